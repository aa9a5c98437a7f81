//! SFU Manager - resource lifecycle on behalf of peers
//!
//! Every operation follows the same shape: lock the room, validate against the
//! registry, release, call the media engine, lock again and commit. If the
//! owning peer or transport went away while the engine call was in flight the
//! fresh engine resource is closed and the result discarded.
//!
//! Closing is centralised here. A close detaches the whole subgraph from the
//! registry under the room lock, then closes the top entity in the engine (the
//! engine cascades internally), then pushes `*-closed` events to the affected
//! peers.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::engine::{ConsumerInfo, EngineEvent, MediaEngine, TransportInfo};
use crate::error::{Result, SfuError};
use crate::events::{PeerEvent, PeerEventHub};
use crate::registry::{
    ConsumerEntry, ConsumerState, Detached, ProducerEntry, ResourceKey, RoomGraph,
    SessionRegistry, TransportEntry, TransportState,
};
use crate::room::{RoomStats, SfuRoom};
use crate::rtp::{Direction, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId, WorkerId};

/// Who initiated a close; the initiator is not told about its own action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    Peer(PeerId),
    Engine,
}

impl CloseCause {
    fn is_initiator(&self, peer_id: &PeerId) -> bool {
        matches!(self, Self::Peer(p) if p == peer_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct WorkerSlot {
    rooms: usize,
    alive: bool,
}

/// Global SFU manager statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub active_rooms: usize,
    pub failed_rooms: usize,
    pub total_peers: usize,
    pub total_transports: usize,
    pub total_producers: usize,
    pub total_consumers: usize,
}

pub struct SfuManager {
    config: Arc<SfuConfig>,
    engine: Arc<dyn MediaEngine>,
    registry: SessionRegistry,
    events: PeerEventHub,
    workers: DashMap<WorkerId, WorkerSlot>,
}

impl SfuManager {
    /// Spawn the configured number of engine workers and build the manager
    pub async fn start(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Result<Arc<Self>> {
        let settings = config.worker_settings();
        let workers = DashMap::new();
        for _ in 0..config.num_workers.max(1) {
            let worker_id = engine.create_worker(&settings).await?;
            info!(
                worker_id = %worker_id,
                rtc_min_port = settings.rtc_min_port,
                rtc_max_port = settings.rtc_max_port,
                "Media worker created"
            );
            workers.insert(worker_id, WorkerSlot { rooms: 0, alive: true });
        }

        let manager = Arc::new(Self {
            events: PeerEventHub::new(config.event_channel_capacity),
            config: Arc::new(config),
            engine,
            registry: SessionRegistry::new(),
            workers,
        });

        info!(
            num_workers = manager.workers.len(),
            max_rooms = manager.config.max_rooms,
            max_peers_per_room = manager.config.max_peers_per_room,
            "SFU Manager initialized"
        );

        Ok(manager)
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn events(&self) -> &PeerEventHub {
        &self.events
    }

    #[must_use]
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.key().clone()).collect()
    }

    /// Least-loaded live worker
    fn pick_worker(&self) -> Result<WorkerId> {
        self.workers
            .iter()
            .filter(|w| w.value().alive)
            .min_by_key(|w| w.value().rooms)
            .map(|w| w.key().clone())
            .ok_or_else(|| SfuError::Fatal("no live media worker available".to_string()))
    }

    fn room_for_peer(&self, peer_id: &PeerId) -> Result<Arc<SfuRoom>> {
        let room = self
            .registry
            .room_of_peer(peer_id)
            .ok_or_else(|| SfuError::not_found(format!("peer {peer_id}")))?;
        room.check_available()?;
        Ok(room)
    }

    /// Register `peer_id` in `room_id`, creating the room and its router on first use
    pub async fn join(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<Arc<SfuRoom>> {
        if self.registry.room_of_peer(peer_id).is_some() {
            return Err(SfuError::conflict(format!("peer {peer_id} already joined")));
        }
        loop {
            let room = match self.registry.room(room_id) {
                Some(room) => room,
                None => {
                    if self.config.max_rooms > 0 && self.registry.room_count() >= self.config.max_rooms
                    {
                        warn!(
                            current_rooms = self.registry.room_count(),
                            max_rooms = self.config.max_rooms,
                            "Room limit reached"
                        );
                        return Err(SfuError::conflict("maximum number of rooms reached"));
                    }
                    let worker_id = self.pick_worker()?;
                    self.registry.room_or_insert_with(room_id, || {
                        if let Some(mut slot) = self.workers.get_mut(&worker_id) {
                            slot.rooms += 1;
                        }
                        info!(room_id = %room_id, worker_id = %worker_id, "Created new room");
                        SfuRoom::new(room_id.clone(), worker_id.clone())
                    })
                }
            };

            if let Err(e) = room.ensure_router(self.engine.as_ref()).await {
                self.reap_if_empty(&room).await;
                return Err(e);
            }

            let mut graph = room.lock().await;
            if room.is_closed() {
                // Lost a race with the last peer leaving; start over with a fresh room
                continue;
            }
            room.check_available()?;
            if self.config.max_peers_per_room > 0
                && graph.peer_count() >= self.config.max_peers_per_room
            {
                warn!(
                    room_id = %room_id,
                    current_peers = graph.peer_count(),
                    max_peers = self.config.max_peers_per_room,
                    "Peer limit reached for room"
                );
                return Err(SfuError::conflict("maximum number of peers reached for this room"));
            }
            graph.register_peer(peer_id.clone())?;
            self.registry.index_peer(peer_id.clone(), room_id.clone());
            info!(
                room_id = %room_id,
                peer_id = %peer_id,
                peer_count = graph.peer_count(),
                "Added peer to room"
            );
            drop(graph);
            return Ok(room);
        }
    }

    /// Remove a peer and close everything it owns. Idempotent.
    pub async fn leave(&self, peer_id: &PeerId) {
        let Some(room) = self.registry.room_of_peer(peer_id) else {
            return;
        };
        let cause = CloseCause::Peer(peer_id.clone());

        let (detached, room_removed) = {
            let mut graph = room.lock().await;
            let Some(detached) = graph.detach_peer(peer_id) else {
                return;
            };
            self.registry.unindex(&detached);
            self.dispatch(collect_notifications(&graph, &detached, &cause));
            let room_removed = graph.is_empty() && !self.config.keep_empty_rooms;
            if room_removed {
                self.registry.remove_room(&room);
                room.mark_closed();
            }
            (detached, room_removed)
        };

        for transport in &detached.transports {
            if let Err(e) = self.engine.close_transport(&transport.id).await {
                warn!(transport_id = %transport.id, error = %e, "Engine failed to close transport");
            }
        }

        info!(
            room_id = %room.id,
            peer_id = %peer_id,
            transports = detached.transports.len(),
            producers = detached.producers.len(),
            consumers = detached.consumers.len(),
            "Removed peer from room"
        );

        if room_removed {
            self.destroy_room(&room).await;
        }
    }

    async fn reap_if_empty(&self, room: &Arc<SfuRoom>) {
        let removed = {
            let graph = room.lock().await;
            if graph.is_empty() && !room.is_closed() {
                self.registry.remove_room(room);
                room.mark_closed();
                true
            } else {
                false
            }
        };
        if removed {
            self.destroy_room(room).await;
        }
    }

    async fn destroy_room(&self, room: &SfuRoom) {
        if let Some(router) = room.router() {
            if let Err(e) = self.engine.close_router(&router.id).await {
                warn!(room_id = %room.id, error = %e, "Engine failed to close router");
            }
        }
        if let Some(mut slot) = self.workers.get_mut(&room.worker_id) {
            slot.rooms = slot.rooms.saturating_sub(1);
        }
        info!(room_id = %room.id, "Removed empty room");
    }

    /// Router capabilities of the peer's room
    pub async fn rtp_capabilities(&self, peer_id: &PeerId) -> Result<RtpCapabilities> {
        let room = self.room_for_peer(peer_id)?;
        let router = room.ensure_router(self.engine.as_ref()).await?;
        Ok(router.rtp_capabilities.clone())
    }

    pub async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<TransportInfo> {
        let room = self.room_for_peer(peer_id)?;
        let router_id = room.ensure_router(self.engine.as_ref()).await?.id.clone();
        let limit = self.config.max_transports_per_direction;

        {
            let graph = room.lock().await;
            graph.find_peer(peer_id)?;
            check_transport_limit(&graph, peer_id, direction, limit)?;
        }

        let info = self
            .engine
            .create_webrtc_transport(&router_id, &self.config.transport_options())
            .await
            .map_err(|e| {
                warn!(peer_id = %peer_id, %direction, error = %e, "Engine failed to create transport");
                SfuError::from(e)
            })?;

        let committed = {
            let mut graph = room.lock().await;
            let committed = room
                .check_available()
                .and_then(|()| check_transport_limit(&graph, peer_id, direction, limit))
                .and_then(|()| {
                    graph
                        .register_transport(TransportEntry::new(
                            info.id.clone(),
                            peer_id.clone(),
                            direction,
                        ))
                        .map_err(SfuError::from)
                });
            if committed.is_ok() {
                self.registry
                    .index_resource(ResourceKey::Transport(info.id.clone()), room.id.clone());
            }
            committed
        };

        if let Err(e) = committed {
            debug!(transport_id = %info.id, error = %e, "Discarding transport created for a stale request");
            self.discard(self.engine.close_transport(&info.id).await, info.id.as_str());
            return Err(e);
        }

        info!(
            room_id = %room.id,
            peer_id = %peer_id,
            transport_id = %info.id,
            %direction,
            "Transport created"
        );
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        let room = self.room_for_peer(peer_id)?;
        {
            let mut graph = room.lock().await;
            let transport = owned_transport_mut(&mut graph, peer_id, transport_id)?;
            match transport.state {
                TransportState::New => transport.state = TransportState::Connecting,
                TransportState::Connecting | TransportState::Connected => {
                    return Err(SfuError::conflict(format!(
                        "transport {transport_id} already connected"
                    )));
                }
            }
        }

        let result = self
            .engine
            .connect_transport(transport_id, dtls_parameters)
            .await;

        let mut graph = room.lock().await;
        match result {
            Ok(()) => {
                let transport = graph.find_transport_mut(transport_id)?;
                transport.state = TransportState::Connected;
                debug!(transport_id = %transport_id, "Transport connected");
                Ok(())
            }
            Err(e) => {
                if let Ok(transport) = graph.find_transport_mut(transport_id) {
                    if transport.state == TransportState::Connecting {
                        transport.state = TransportState::New;
                    }
                }
                warn!(transport_id = %transport_id, error = %e, "Engine failed to connect transport");
                Err(e.into())
            }
        }
    }

    pub async fn produce(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId> {
        let room = self.room_for_peer(peer_id)?;
        {
            let mut graph = room.lock().await;
            let transport = owned_transport_mut(&mut graph, peer_id, transport_id)?;
            if transport.direction != Direction::Send {
                return Err(SfuError::conflict(format!(
                    "transport {transport_id} is not a send transport"
                )));
            }
        }

        let producer = self
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await?;

        {
            let mut graph = room.lock().await;
            let registered = graph.register_producer(ProducerEntry {
                id: producer.id.clone(),
                transport_id: transport_id.clone(),
                peer_id: peer_id.clone(),
                kind: producer.kind,
                seq: 0,
            });
            match registered {
                Ok(()) => {
                    self.registry.index_resource(
                        ResourceKey::Producer(producer.id.clone()),
                        room.id.clone(),
                    );
                    let notifications = graph
                        .peer_ids()
                        .filter(|p| *p != peer_id)
                        .map(|p| {
                            (
                                p.clone(),
                                PeerEvent::NewProducer {
                                    producer_id: producer.id.clone(),
                                    peer_id: peer_id.clone(),
                                    kind: producer.kind,
                                },
                            )
                        })
                        .collect::<Vec<_>>();
                    // Queued before the lock is released, so a concurrent close
                    // cannot overtake this announcement
                    self.dispatch(notifications);
                }
                Err(e) => {
                    drop(graph);
                    debug!(producer_id = %producer.id, "Discarding producer created on a closed transport");
                    self.discard(
                        self.engine.close_producer(&producer.id).await,
                        producer.id.as_str(),
                    );
                    return Err(e.into());
                }
            }
        }

        info!(
            room_id = %room.id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            producer_id = %producer.id,
            kind = producer.kind.as_str(),
            "Producer created"
        );
        Ok(producer.id)
    }

    /// Create a paused consumer of `producer_id` (or of the newest producer of
    /// another peer) on the peer's receive transport.
    pub async fn consume(
        &self,
        peer_id: &PeerId,
        producer_id: Option<&ProducerId>,
        transport_id: Option<&TransportId>,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        let room = self.room_for_peer(peer_id)?;
        let router_id = room.ensure_router(self.engine.as_ref()).await?.id.clone();

        let (transport_id, producer_id) = {
            let mut graph = room.lock().await;
            graph.find_peer(peer_id)?;
            let transport_id = match transport_id {
                Some(id) => {
                    let transport = owned_transport_mut(&mut graph, peer_id, id)?;
                    if transport.direction != Direction::Receive {
                        return Err(SfuError::conflict(format!(
                            "transport {id} is not a receive transport"
                        )));
                    }
                    id.clone()
                }
                None => graph
                    .peer_transports(peer_id, Direction::Receive)
                    .first()
                    .map(|t| t.id.clone())
                    .ok_or_else(|| {
                        SfuError::not_found(format!("receive transport of peer {peer_id}"))
                    })?,
            };
            let producer_id = match producer_id {
                Some(id) => graph.find_producer(id)?.id.clone(),
                None => graph
                    .latest_producer_excluding(peer_id)
                    .map(|p| p.id.clone())
                    .ok_or_else(|| SfuError::not_found("producer to consume"))?,
            };
            (transport_id, producer_id)
        };

        if !self
            .engine
            .can_consume(&router_id, &producer_id, rtp_capabilities)
        {
            info!(
                peer_id = %peer_id,
                producer_id = %producer_id,
                "Receiver capabilities cannot consume producer"
            );
            return Err(SfuError::Incompatible(format!(
                "receiver capabilities cannot consume producer {producer_id}"
            )));
        }

        let consumer = self
            .engine
            .consume(&transport_id, &producer_id, rtp_capabilities, true)
            .await?;

        let committed = {
            let mut graph = room.lock().await;
            let registered = graph.register_consumer(ConsumerEntry {
                id: consumer.id.clone(),
                producer_id: producer_id.clone(),
                transport_id: transport_id.clone(),
                peer_id: peer_id.clone(),
                kind: consumer.kind,
                state: ConsumerState::Paused,
            });
            if registered.is_ok() {
                self.registry
                    .index_resource(ResourceKey::Consumer(consumer.id.clone()), room.id.clone());
            }
            registered
        };

        if let Err(e) = committed {
            debug!(consumer_id = %consumer.id, "Discarding consumer whose transport or producer closed");
            self.discard(
                self.engine.close_consumer(&consumer.id).await,
                consumer.id.as_str(),
            );
            return Err(e.into());
        }

        info!(
            room_id = %room.id,
            peer_id = %peer_id,
            consumer_id = %consumer.id,
            producer_id = %producer_id,
            kind = consumer.kind.as_str(),
            "Consumer created (paused)"
        );
        Ok(consumer)
    }

    pub async fn resume_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<()> {
        let room = self.room_for_peer(peer_id)?;
        {
            let mut graph = room.lock().await;
            let consumer = graph.find_consumer_mut(consumer_id)?;
            if &consumer.peer_id != peer_id {
                return Err(SfuError::not_found(format!("consumer {consumer_id}")));
            }
            match consumer.state {
                ConsumerState::Paused => consumer.state = ConsumerState::Resuming,
                ConsumerState::Resuming | ConsumerState::Active => {
                    return Err(SfuError::conflict(format!(
                        "consumer {consumer_id} already active"
                    )));
                }
            }
        }

        let result = self.engine.resume_consumer(consumer_id).await;

        let mut graph = room.lock().await;
        match result {
            Ok(()) => {
                graph.find_consumer_mut(consumer_id)?.state = ConsumerState::Active;
                info!(peer_id = %peer_id, consumer_id = %consumer_id, "Consumer resumed");
                Ok(())
            }
            Err(e) => {
                if let Ok(consumer) = graph.find_consumer_mut(consumer_id) {
                    if consumer.state == ConsumerState::Resuming {
                        consumer.state = ConsumerState::Paused;
                    }
                }
                Err(e.into())
            }
        }
    }

    pub async fn close_transport(&self, peer_id: &PeerId, transport_id: &TransportId) -> Result<()> {
        self.close(
            ResourceKey::Transport(transport_id.clone()),
            CloseCause::Peer(peer_id.clone()),
        )
        .await
    }

    pub async fn close_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) -> Result<()> {
        self.close(
            ResourceKey::Producer(producer_id.clone()),
            CloseCause::Peer(peer_id.clone()),
        )
        .await
    }

    pub async fn close_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<()> {
        self.close(
            ResourceKey::Consumer(consumer_id.clone()),
            CloseCause::Peer(peer_id.clone()),
        )
        .await
    }

    /// Close an entity and cascade. Closing something already gone is a no-op.
    pub async fn close(&self, key: ResourceKey, cause: CloseCause) -> Result<()> {
        let Some(room) = self.registry.room_of(&key) else {
            return Ok(());
        };

        let detached = {
            let mut graph = room.lock().await;
            if let CloseCause::Peer(peer_id) = &cause {
                if !owned_by(&graph, &key, peer_id) {
                    return Err(SfuError::not_found(describe(&key)));
                }
            }
            let detached = match &key {
                ResourceKey::Transport(id) => graph.detach_transport(id),
                ResourceKey::Producer(id) => graph.detach_producer(id),
                ResourceKey::Consumer(id) => graph.detach_consumer(id),
            };
            let Some(detached) = detached else {
                return Ok(());
            };
            self.registry.unindex(&detached);
            self.dispatch(collect_notifications(&graph, &detached, &cause));
            detached
        };

        if cause != CloseCause::Engine {
            let result = match &key {
                ResourceKey::Transport(id) => self.engine.close_transport(id).await,
                ResourceKey::Producer(id) => self.engine.close_producer(id).await,
                ResourceKey::Consumer(id) => self.engine.close_consumer(id).await,
            };
            if let Err(e) = result {
                warn!(resource = %describe(&key), error = %e, "Engine failed to close resource");
            }
        }

        info!(
            room_id = %room.id,
            resource = %describe(&key),
            ?cause,
            producers = detached.producers.len(),
            consumers = detached.consumers.len(),
            "Resource closed"
        );
        Ok(())
    }

    /// Apply an engine-initiated closure to the registry
    pub async fn handle_engine_event(&self, event: &EngineEvent) {
        let key = match event {
            EngineEvent::TransportClosed { transport_id } => {
                ResourceKey::Transport(transport_id.clone())
            }
            EngineEvent::ProducerClosed { producer_id } => {
                ResourceKey::Producer(producer_id.clone())
            }
            EngineEvent::ConsumerClosed { consumer_id } => {
                ResourceKey::Consumer(consumer_id.clone())
            }
            EngineEvent::WorkerDied { .. } => return,
        };
        if let Err(e) = self.close(key, CloseCause::Engine).await {
            warn!(error = %e, "Failed to apply engine closure");
        }
    }

    /// Close every registered resource the engine no longer holds, as if the
    /// engine had reported each closure. Returns how many were closed.
    pub async fn reconcile(&self) -> usize {
        let mut stale = Vec::new();
        for room in self.registry.rooms() {
            let keys = room.lock().await.resource_keys();
            stale.extend(keys.into_iter().filter(|key| !self.engine_holds(key)));
        }

        let mut closed = 0;
        for key in stale {
            // Children of a stale parent were already detached by its cascade
            if self.registry.room_of(&key).is_none() {
                continue;
            }
            let resource = describe(&key);
            match self.close(key, CloseCause::Engine).await {
                Ok(()) => closed += 1,
                Err(e) => warn!(resource = %resource, error = %e, "Failed to reconcile resource"),
            }
        }
        if closed > 0 {
            warn!(closed, "Closed resources the engine dropped without notice");
        }
        closed
    }

    /// Workers still considered alive that the engine no longer runs
    #[must_use]
    pub fn lost_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|w| w.value().alive && !self.engine.has_worker(w.key()))
            .map(|w| w.key().clone())
            .collect()
    }

    fn engine_holds(&self, key: &ResourceKey) -> bool {
        match key {
            ResourceKey::Transport(id) => self.engine.has_transport(id),
            ResourceKey::Producer(id) => self.engine.has_producer(id),
            ResourceKey::Consumer(id) => self.engine.has_consumer(id),
        }
    }

    /// Mark a worker dead and every room bound to it failed. Returns the failed rooms.
    pub fn fail_worker(&self, worker_id: &WorkerId) -> Vec<Arc<SfuRoom>> {
        if let Some(mut slot) = self.workers.get_mut(worker_id) {
            slot.alive = false;
        }
        let rooms: Vec<_> = self
            .registry
            .rooms()
            .into_iter()
            .filter(|room| &room.worker_id == worker_id)
            .collect();
        for room in &rooms {
            room.mark_failed();
        }
        rooms
    }

    pub async fn room_peers(&self, room: &SfuRoom) -> Vec<PeerId> {
        room.lock().await.peer_ids().cloned().collect()
    }

    pub async fn get_room_stats(&self, room_id: &RoomId) -> RoomStats {
        match self.registry.room(room_id) {
            Some(room) => room.get_stats().await,
            None => RoomStats::default(),
        }
    }

    pub async fn get_stats(&self) -> ManagerStats {
        let mut stats = ManagerStats::default();
        for room in self.registry.rooms() {
            let room_stats = room.get_stats().await;
            stats.active_rooms += 1;
            if room.is_failed() {
                stats.failed_rooms += 1;
            }
            stats.total_peers += room_stats.peer_count;
            stats.total_transports += room_stats.transport_count;
            stats.total_producers += room_stats.producer_count;
            stats.total_consumers += room_stats.consumer_count;
        }
        stats
    }

    fn dispatch(&self, notifications: Vec<(PeerId, PeerEvent)>) {
        for (peer_id, event) in notifications {
            self.events.send(&peer_id, event);
        }
    }

    fn discard(&self, result: crate::engine::EngineResult<()>, id: &str) {
        if let Err(e) = result {
            warn!(resource_id = %id, error = %e, "Engine failed to close discarded resource");
        }
    }
}

fn check_transport_limit(
    graph: &RoomGraph,
    peer_id: &PeerId,
    direction: Direction,
    limit: usize,
) -> Result<()> {
    if graph.peer_transports(peer_id, direction).len() >= limit {
        return Err(SfuError::conflict(format!(
            "peer {peer_id} already holds {limit} {direction} transport(s)"
        )));
    }
    Ok(())
}

fn owned_transport_mut<'a>(
    graph: &'a mut RoomGraph,
    peer_id: &PeerId,
    transport_id: &TransportId,
) -> Result<&'a mut TransportEntry> {
    let transport = graph.find_transport_mut(transport_id)?;
    if &transport.peer_id != peer_id {
        return Err(SfuError::not_found(format!("transport {transport_id}")));
    }
    Ok(transport)
}

/// True if `key` is owned by `peer_id`, or is already gone
fn owned_by(graph: &RoomGraph, key: &ResourceKey, peer_id: &PeerId) -> bool {
    let owner = match key {
        ResourceKey::Transport(id) => graph.find_transport(id).map(|t| &t.peer_id),
        ResourceKey::Producer(id) => graph.find_producer(id).map(|p| &p.peer_id),
        ResourceKey::Consumer(id) => graph.find_consumer(id).map(|c| &c.peer_id),
    };
    owner.map_or(true, |owner| owner == peer_id)
}

fn describe(key: &ResourceKey) -> String {
    match key {
        ResourceKey::Transport(id) => format!("transport {id}"),
        ResourceKey::Producer(id) => format!("producer {id}"),
        ResourceKey::Consumer(id) => format!("consumer {id}"),
    }
}

/// Events owed to the peers still in `graph` for everything in `detached`
fn collect_notifications(
    graph: &RoomGraph,
    detached: &Detached,
    cause: &CloseCause,
) -> Vec<(PeerId, PeerEvent)> {
    let mut out = Vec::new();
    let present = |peer_id: &PeerId| graph.find_peer(peer_id).is_ok();

    for producer in &detached.producers {
        for peer_id in graph.peer_ids().filter(|p| !cause.is_initiator(p)) {
            out.push((
                peer_id.clone(),
                PeerEvent::ProducerClosed {
                    producer_id: producer.id.clone(),
                },
            ));
        }
    }
    for consumer in &detached.consumers {
        if !cause.is_initiator(&consumer.peer_id) && present(&consumer.peer_id) {
            out.push((
                consumer.peer_id.clone(),
                PeerEvent::ConsumerClosed {
                    consumer_id: consumer.id.clone(),
                    producer_id: consumer.producer_id.clone(),
                },
            ));
        }
    }
    if *cause == CloseCause::Engine {
        for transport in &detached.transports {
            if present(&transport.peer_id) {
                out.push((
                    transport.peer_id.clone(),
                    PeerEvent::TransportClosed {
                        transport_id: transport.id.clone(),
                    },
                ));
            }
        }
    }
    out
}
