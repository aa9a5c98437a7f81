//! SFU Room management

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard, OnceCell};

use crate::engine::{MediaEngine, RouterInfo};
use crate::error::{Result, SfuError};
use crate::registry::RoomGraph;
use crate::rtp::media_codecs;
use crate::types::{RoomId, WorkerId};

/// An independent routing domain: one router plus the entity graph of its peers.
///
/// The graph mutex is the per-room exclusion mechanism. It is never held
/// across a call into the media engine.
#[derive(Debug)]
pub struct SfuRoom {
    pub id: RoomId,
    pub worker_id: WorkerId,
    router: OnceCell<RouterInfo>,
    graph: Mutex<RoomGraph>,
    /// Set once the worker behind this room died
    failed: AtomicBool,
    /// Set once the room has been removed from the registry
    closed: AtomicBool,
}

impl SfuRoom {
    #[must_use]
    pub fn new(id: RoomId, worker_id: WorkerId) -> Self {
        Self {
            id,
            worker_id,
            router: OnceCell::new(),
            graph: Mutex::new(RoomGraph::new()),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Create the room's router on first use; later calls return the same router
    pub async fn ensure_router(&self, engine: &dyn MediaEngine) -> Result<&RouterInfo> {
        self.check_available()?;
        self.router
            .get_or_try_init(|| async {
                let codecs = media_codecs();
                engine
                    .create_router(&self.worker_id, &codecs)
                    .await
                    .map_err(SfuError::from)
            })
            .await
    }

    #[must_use]
    pub fn router(&self) -> Option<&RouterInfo> {
        self.router.get()
    }

    pub async fn lock(&self) -> MutexGuard<'_, RoomGraph> {
        self.graph.lock().await
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fails with [`SfuError::Fatal`] once the room's worker is gone
    pub fn check_available(&self) -> Result<()> {
        if self.is_failed() {
            return Err(SfuError::Fatal(format!(
                "room {} lost its media worker {}",
                self.id, self.worker_id
            )));
        }
        Ok(())
    }

    pub async fn get_stats(&self) -> RoomStats {
        let graph = self.graph.lock().await;
        RoomStats {
            peer_count: graph.peer_count(),
            transport_count: graph.transport_count(),
            producer_count: graph.producer_count(),
            consumer_count: graph.consumer_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub peer_count: usize,
    pub transport_count: usize,
    pub producer_count: usize,
    pub consumer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LoopbackEngine, WorkerSettings};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ensure_router_is_idempotent() {
        let engine = Arc::new(LoopbackEngine::new());
        let worker = engine
            .create_worker(&WorkerSettings {
                rtc_min_port: 2000,
                rtc_max_port: 2020,
            })
            .await
            .unwrap();
        let room = Arc::new(SfuRoom::new(RoomId::from("r"), worker));

        let (a, b) = tokio::join!(
            room.ensure_router(engine.as_ref()),
            room.ensure_router(engine.as_ref())
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(engine.router_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_room_rejects_work() {
        let engine = LoopbackEngine::new();
        let room = SfuRoom::new(RoomId::from("r"), WorkerId::from("w"));
        room.mark_failed();
        let err = room.ensure_router(&engine).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
