//! Connection supervisor
//!
//! Owns the `connecting -> open -> closed` lifecycle of every peer channel and
//! watches the engine's event stream. Resource closures reported by the engine
//! are routed into the manager's cascade. A dead worker is fatal: its rooms stop
//! accepting work, their peers are told to go away and, after a grace period,
//! the termination signal fires.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::EngineEvent;
use crate::error::{Result, SfuError};
use crate::events::PeerEvent;
use crate::manager::SfuManager;
use crate::types::{PeerId, RoomId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// An open peer channel
#[derive(Debug)]
pub struct PeerSession {
    pub peer_id: PeerId,
    pub room_id: RoomId,
    pub events: mpsc::Receiver<PeerEvent>,
}

pub struct ConnectionSupervisor {
    manager: Arc<SfuManager>,
    connections: DashMap<PeerId, ConnectionState>,
    fatal: AtomicBool,
    fatal_reason: Mutex<Option<String>>,
    terminate_tx: watch::Sender<bool>,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(manager: Arc<SfuManager>) -> Arc<Self> {
        let (terminate_tx, _) = watch::channel(false);
        Arc::new(Self {
            manager,
            connections: DashMap::new(),
            fatal: AtomicBool::new(false),
            fatal_reason: Mutex::new(None),
            terminate_tx,
        })
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<SfuManager> {
        &self.manager
    }

    /// Subscribe to the engine's events and handle them until the engine goes away
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.manager.engine().events();
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => supervisor.handle_engine_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Engine event monitor lagged by {} events, reconciling", n);
                        supervisor.catch_up().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Engine event stream closed, monitor stopping");
                        break;
                    }
                }
            }
        })
    }

    pub async fn handle_engine_event(self: &Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::WorkerDied { worker_id, reason } => {
                self.on_worker_died(&worker_id, &reason).await;
            }
            other => self.manager.handle_engine_event(&other).await,
        }
    }

    /// Rebuild what dropped engine events would have told us: workers the
    /// engine no longer runs are treated as dead, then every registered
    /// resource the engine no longer holds is closed.
    pub async fn catch_up(self: &Arc<Self>) {
        for worker_id in self.manager.lost_workers() {
            self.on_worker_died(&worker_id, "worker vanished while engine events were dropped")
                .await;
        }
        self.manager.reconcile().await;
    }

    /// Open a channel for a new peer in `room_id`
    pub async fn connect(&self, room_id: &RoomId) -> Result<PeerSession> {
        if self.is_fatal() {
            return Err(SfuError::Fatal(
                "server is shutting down after a media worker failure".to_string(),
            ));
        }

        let peer_id = PeerId::generate();
        self.connections
            .insert(peer_id.clone(), ConnectionState::Connecting);
        let events = self.manager.events().register(peer_id.clone());

        if let Err(e) = self.manager.join(room_id, &peer_id).await {
            self.manager.events().unregister(&peer_id);
            self.connections.remove(&peer_id);
            warn!(room_id = %room_id, error = %e, "Peer could not join room");
            return Err(e);
        }

        self.connections.insert(peer_id.clone(), ConnectionState::Open);
        info!(room_id = %room_id, peer_id = %peer_id, "Peer connected");

        Ok(PeerSession {
            peer_id,
            room_id: room_id.clone(),
            events,
        })
    }

    /// Tear down a peer channel and cascade-close everything the peer owns. Idempotent.
    pub async fn disconnect(&self, peer_id: &PeerId) {
        let was_open = match self.connections.get_mut(peer_id) {
            Some(mut state) if *state != ConnectionState::Closed => {
                *state = ConnectionState::Closed;
                true
            }
            _ => false,
        };
        if !was_open {
            return;
        }

        self.manager.leave(peer_id).await;
        self.manager.events().unregister(peer_id);
        self.connections.remove(peer_id);
        info!(peer_id = %peer_id, "Peer disconnected");
    }

    #[must_use]
    pub fn connection_state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        self.connections.get(peer_id).map(|s| *s)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    async fn on_worker_died(self: &Arc<Self>, worker_id: &WorkerId, reason: &str) {
        error!(worker_id = %worker_id, reason = %reason, "Media worker died");

        let rooms = self.manager.fail_worker(worker_id);
        for room in &rooms {
            let peers = self.manager.room_peers(room).await;
            warn!(
                room_id = %room.id,
                peers = peers.len(),
                "Room lost its media worker, disconnecting peers"
            );
            for peer_id in peers {
                self.manager.events().send(
                    &peer_id,
                    PeerEvent::Disconnected {
                        reason: format!("media worker failed: {reason}"),
                    },
                );
            }
        }

        self.report_fatal(format!("media worker {worker_id} died: {reason}"));
    }

    /// Record an unrecoverable failure and schedule termination after the grace period.
    /// Only the first report schedules anything.
    pub fn report_fatal(self: &Arc<Self>, reason: impl Into<String>) {
        let reason = reason.into();
        if self
            .fatal
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *self.fatal_reason.lock() = Some(reason.clone());

        let grace = self.manager.config().worker_death_grace();
        error!(
            reason = %reason,
            grace_ms = self.manager.config().worker_death_grace_ms,
            "Fatal failure, terminating after grace period"
        );

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            supervisor.terminate_tx.send_replace(true);
        });
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_reason.lock().clone()
    }

    /// Resolves once the process should terminate
    pub async fn terminated(&self) {
        let mut rx = self.terminate_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|terminate| *terminate).await;
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        *self.terminate_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::engine::LoopbackEngine;
    use crate::rtp::Direction;
    use std::time::Duration;

    async fn setup() -> (Arc<ConnectionSupervisor>, Arc<LoopbackEngine>) {
        let engine = Arc::new(LoopbackEngine::new());
        let manager = SfuManager::start(SfuConfig::default(), engine.clone())
            .await
            .unwrap();
        (ConnectionSupervisor::new(manager), engine)
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (supervisor, engine) = setup().await;
        let room = RoomId::from("room");
        let session = supervisor.connect(&room).await.unwrap();
        assert_eq!(
            supervisor.connection_state(&session.peer_id),
            Some(ConnectionState::Open)
        );
        assert_eq!(engine.router_count(), 1);

        supervisor
            .manager()
            .create_transport(&session.peer_id, Direction::Send)
            .await
            .unwrap();

        supervisor.disconnect(&session.peer_id).await;
        assert_eq!(supervisor.connection_state(&session.peer_id), None);
        assert_eq!(engine.transport_count(), 0);
        assert_eq!(supervisor.manager().registry().room_count(), 0);

        // second teardown is a no-op
        supervisor.disconnect(&session.peer_id).await;
        assert_eq!(supervisor.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_peers_get_distinct_ids() {
        let (supervisor, _engine) = setup().await;
        let room = RoomId::from("room");
        let a = supervisor.connect(&room).await.unwrap();
        let b = supervisor.connect(&room).await.unwrap();
        assert_ne!(a.peer_id, b.peer_id);
        assert_eq!(supervisor.connection_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_death_is_fatal() {
        let (supervisor, engine) = setup().await;
        let mut session = supervisor.connect(&RoomId::from("room")).await.unwrap();
        let worker = engine.worker_ids().remove(0);

        engine.kill_worker(&worker, "segfault");
        supervisor
            .handle_engine_event(EngineEvent::WorkerDied {
                worker_id: worker,
                reason: "segfault".to_string(),
            })
            .await;

        assert!(supervisor.is_fatal());
        assert!(matches!(
            session.events.recv().await,
            Some(PeerEvent::Disconnected { .. })
        ));

        let err = supervisor
            .manager()
            .create_transport(&session.peer_id, Direction::Send)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(supervisor.connect(&RoomId::from("other")).await.is_err());

        assert!(!supervisor.is_terminated());
        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(!supervisor.is_terminated());
        supervisor.terminated().await;
        assert!(supervisor.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_routes_engine_events() {
        let (supervisor, engine) = setup().await;
        let _monitor = supervisor.spawn_monitor();
        let session = supervisor.connect(&RoomId::from("room")).await.unwrap();
        let transport = supervisor
            .manager()
            .create_transport(&session.peer_id, Direction::Send)
            .await
            .unwrap();

        engine.close_transport_remotely(&transport.id);
        let mut events = session.events;
        assert_eq!(
            events.recv().await,
            Some(PeerEvent::TransportClosed {
                transport_id: transport.id
            })
        );
        assert_eq!(supervisor.manager().get_stats().await.total_transports, 0);

        let worker = engine.worker_ids().remove(0);
        engine.kill_worker(&worker, "oom");
        tokio::time::timeout(Duration::from_secs(5), supervisor.terminated())
            .await
            .unwrap();
        assert!(supervisor.fatal_reason().unwrap().contains("oom"));
    }

    #[tokio::test]
    async fn test_monitor_recovers_from_dropped_engine_events() {
        let engine = Arc::new(LoopbackEngine::new());
        let config = SfuConfig {
            max_transports_per_direction: 1100,
            ..SfuConfig::default()
        };
        let manager = SfuManager::start(config, engine.clone()).await.unwrap();
        let supervisor = ConnectionSupervisor::new(manager);
        let _monitor = supervisor.spawn_monitor();
        let session = supervisor.connect(&RoomId::from("room")).await.unwrap();

        let mut transports = Vec::new();
        for _ in 0..1100 {
            let transport = supervisor
                .manager()
                .create_transport(&session.peer_id, Direction::Send)
                .await
                .unwrap();
            transports.push(transport.id);
        }

        // More closures in one burst than the engine's event channel holds
        for transport_id in &transports {
            engine.close_transport_remotely(transport_id);
        }

        tokio::time::timeout(Duration::from_secs(10), async {
            while supervisor.manager().get_stats().await.total_transports > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(engine.transport_count(), 0);
        assert!(!supervisor.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_detects_silently_lost_worker() {
        let (supervisor, engine) = setup().await;
        let mut session = supervisor.connect(&RoomId::from("room")).await.unwrap();
        let worker = engine.worker_ids().remove(0);

        // No monitor is running, so the death event goes unseen
        engine.kill_worker(&worker, "oom");
        assert_eq!(supervisor.manager().lost_workers(), vec![worker]);

        supervisor.catch_up().await;
        assert!(supervisor.is_fatal());
        assert!(matches!(
            session.events.recv().await,
            Some(PeerEvent::Disconnected { .. })
        ));
        assert!(supervisor.manager().lost_workers().is_empty());
    }
}
