//! Session registry
//!
//! Each room owns a [`RoomGraph`]: an arena of peers, transports, producers and
//! consumers keyed by id, with explicit ownership edges (peer -> transport,
//! transport -> producer/consumer, producer -> consumer). All mutations of a
//! graph happen under the owning room's lock, so a detach and its cascade are
//! observed atomically.
//!
//! [`SessionRegistry`] is the process-wide directory: rooms by id plus reverse
//! indexes from peer and resource ids to the room that holds them.

use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::rtp::{Direction, MediaKind};
use crate::room::SfuRoom;
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already registered")]
    Conflict(String),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub id: PeerId,
    pub transports: BTreeSet<TransportId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    /// DTLS parameters handed to the engine, handshake in flight
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct TransportEntry {
    pub id: TransportId,
    pub peer_id: PeerId,
    pub direction: Direction,
    pub state: TransportState,
    pub producers: BTreeSet<ProducerId>,
    pub consumers: BTreeSet<ConsumerId>,
}

impl TransportEntry {
    #[must_use]
    pub fn new(id: TransportId, peer_id: PeerId, direction: Direction) -> Self {
        Self {
            id,
            peer_id,
            direction,
            state: TransportState::New,
            producers: BTreeSet::new(),
            consumers: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerEntry {
    pub id: ProducerId,
    pub transport_id: TransportId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    /// Creation order within the room
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Paused,
    /// Resume handed to the engine, not yet confirmed
    Resuming,
    Active,
}

#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub state: ConsumerState,
}

/// Everything removed by a single detach, in cascade order
#[derive(Debug, Default, Clone)]
pub struct Detached {
    pub peers: Vec<PeerEntry>,
    pub transports: Vec<TransportEntry>,
    pub producers: Vec<ProducerEntry>,
    pub consumers: Vec<ConsumerEntry>,
}

impl Detached {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
            && self.transports.is_empty()
            && self.producers.is_empty()
            && self.consumers.is_empty()
    }
}

/// Entity graph of one room
#[derive(Debug, Default)]
pub struct RoomGraph {
    peers: HashMap<PeerId, PeerEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    producer_consumers: HashMap<ProducerId, BTreeSet<ConsumerId>>,
    next_seq: u64,
}

impl RoomGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_peer(&mut self, peer_id: PeerId) -> RegistryResult<()> {
        if self.peers.contains_key(&peer_id) {
            return Err(RegistryError::Conflict(format!("peer {peer_id}")));
        }
        self.peers.insert(
            peer_id.clone(),
            PeerEntry {
                id: peer_id,
                transports: BTreeSet::new(),
            },
        );
        Ok(())
    }

    pub fn register_transport(&mut self, entry: TransportEntry) -> RegistryResult<()> {
        if self.transports.contains_key(&entry.id) {
            return Err(RegistryError::Conflict(format!("transport {}", entry.id)));
        }
        let peer = self
            .peers
            .get_mut(&entry.peer_id)
            .ok_or_else(|| RegistryError::NotFound(format!("peer {}", entry.peer_id)))?;
        peer.transports.insert(entry.id.clone());
        self.transports.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Register a producer; its `seq` is assigned here
    pub fn register_producer(&mut self, mut entry: ProducerEntry) -> RegistryResult<()> {
        if self.producers.contains_key(&entry.id) {
            return Err(RegistryError::Conflict(format!("producer {}", entry.id)));
        }
        let transport = self
            .transports
            .get_mut(&entry.transport_id)
            .ok_or_else(|| RegistryError::NotFound(format!("transport {}", entry.transport_id)))?;
        transport.producers.insert(entry.id.clone());
        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.producer_consumers
            .insert(entry.id.clone(), BTreeSet::new());
        self.producers.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn register_consumer(&mut self, entry: ConsumerEntry) -> RegistryResult<()> {
        if self.consumers.contains_key(&entry.id) {
            return Err(RegistryError::Conflict(format!("consumer {}", entry.id)));
        }
        if !self.producers.contains_key(&entry.producer_id) {
            return Err(RegistryError::NotFound(format!(
                "producer {}",
                entry.producer_id
            )));
        }
        let transport = self
            .transports
            .get_mut(&entry.transport_id)
            .ok_or_else(|| RegistryError::NotFound(format!("transport {}", entry.transport_id)))?;
        transport.consumers.insert(entry.id.clone());
        self.producer_consumers
            .entry(entry.producer_id.clone())
            .or_default()
            .insert(entry.id.clone());
        self.consumers.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn find_peer(&self, peer_id: &PeerId) -> RegistryResult<&PeerEntry> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| RegistryError::NotFound(format!("peer {peer_id}")))
    }

    pub fn find_transport(&self, transport_id: &TransportId) -> RegistryResult<&TransportEntry> {
        self.transports
            .get(transport_id)
            .ok_or_else(|| RegistryError::NotFound(format!("transport {transport_id}")))
    }

    pub fn find_transport_mut(
        &mut self,
        transport_id: &TransportId,
    ) -> RegistryResult<&mut TransportEntry> {
        self.transports
            .get_mut(transport_id)
            .ok_or_else(|| RegistryError::NotFound(format!("transport {transport_id}")))
    }

    pub fn find_producer(&self, producer_id: &ProducerId) -> RegistryResult<&ProducerEntry> {
        self.producers
            .get(producer_id)
            .ok_or_else(|| RegistryError::NotFound(format!("producer {producer_id}")))
    }

    pub fn find_consumer(&self, consumer_id: &ConsumerId) -> RegistryResult<&ConsumerEntry> {
        self.consumers
            .get(consumer_id)
            .ok_or_else(|| RegistryError::NotFound(format!("consumer {consumer_id}")))
    }

    pub fn find_consumer_mut(
        &mut self,
        consumer_id: &ConsumerId,
    ) -> RegistryResult<&mut ConsumerEntry> {
        self.consumers
            .get_mut(consumer_id)
            .ok_or_else(|| RegistryError::NotFound(format!("consumer {consumer_id}")))
    }

    /// Transports a peer owns in the given direction, oldest id first
    #[must_use]
    pub fn peer_transports(&self, peer_id: &PeerId, direction: Direction) -> Vec<&TransportEntry> {
        self.peers
            .get(peer_id)
            .map(|peer| {
                peer.transports
                    .iter()
                    .filter_map(|id| self.transports.get(id))
                    .filter(|t| t.direction == direction)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Producers and consumers carried by a transport
    #[must_use]
    pub fn transport_children(
        &self,
        transport_id: &TransportId,
    ) -> (Vec<ProducerId>, Vec<ConsumerId>) {
        self.transports
            .get(transport_id)
            .map(|t| {
                (
                    t.producers.iter().cloned().collect(),
                    t.consumers.iter().cloned().collect(),
                )
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn consumers_of(&self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        self.producer_consumers
            .get(producer_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recently created producer not owned by `peer_id`
    #[must_use]
    pub fn latest_producer_excluding(&self, peer_id: &PeerId) -> Option<&ProducerEntry> {
        self.producers
            .values()
            .filter(|p| &p.peer_id != peer_id)
            .max_by_key(|p| p.seq)
    }

    /// Every transport, producer and consumer of the room, parents first
    #[must_use]
    pub fn resource_keys(&self) -> Vec<ResourceKey> {
        self.transports
            .keys()
            .cloned()
            .map(ResourceKey::Transport)
            .chain(self.producers.keys().cloned().map(ResourceKey::Producer))
            .chain(self.consumers.keys().cloned().map(ResourceKey::Consumer))
            .collect()
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Remove a consumer. `None` if it was already gone.
    pub fn detach_consumer(&mut self, consumer_id: &ConsumerId) -> Option<Detached> {
        let mut detached = Detached::default();
        self.detach_consumer_into(consumer_id, &mut detached);
        (!detached.is_empty()).then_some(detached)
    }

    /// Remove a producer and every consumer of it
    pub fn detach_producer(&mut self, producer_id: &ProducerId) -> Option<Detached> {
        let mut detached = Detached::default();
        self.detach_producer_into(producer_id, &mut detached);
        (!detached.is_empty()).then_some(detached)
    }

    /// Remove a transport, its producers (and their consumers) and its consumers
    pub fn detach_transport(&mut self, transport_id: &TransportId) -> Option<Detached> {
        let mut detached = Detached::default();
        self.detach_transport_into(transport_id, &mut detached);
        (!detached.is_empty()).then_some(detached)
    }

    /// Remove a peer and everything it owns
    pub fn detach_peer(&mut self, peer_id: &PeerId) -> Option<Detached> {
        let peer = self.peers.get(peer_id)?;
        let transports: Vec<TransportId> = peer.transports.iter().cloned().collect();
        let mut detached = Detached::default();
        for transport_id in &transports {
            self.detach_transport_into(transport_id, &mut detached);
        }
        if let Some(peer) = self.peers.remove(peer_id) {
            detached.peers.push(peer);
        }
        Some(detached)
    }

    fn detach_consumer_into(&mut self, consumer_id: &ConsumerId, detached: &mut Detached) {
        let Some(consumer) = self.consumers.remove(consumer_id) else {
            return;
        };
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(consumer_id);
        }
        if let Some(set) = self.producer_consumers.get_mut(&consumer.producer_id) {
            set.remove(consumer_id);
        }
        detached.consumers.push(consumer);
    }

    fn detach_producer_into(&mut self, producer_id: &ProducerId, detached: &mut Detached) {
        let Some(producer) = self.producers.remove(producer_id) else {
            return;
        };
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(producer_id);
        }
        let consumers = self
            .producer_consumers
            .remove(producer_id)
            .unwrap_or_default();
        detached.producers.push(producer);
        for consumer_id in &consumers {
            self.detach_consumer_into(consumer_id, detached);
        }
    }

    fn detach_transport_into(&mut self, transport_id: &TransportId, detached: &mut Detached) {
        let (producers, consumers) = self.transport_children(transport_id);
        for producer_id in &producers {
            self.detach_producer_into(producer_id, detached);
        }
        for consumer_id in &consumers {
            self.detach_consumer_into(consumer_id, detached);
        }
        let Some(transport) = self.transports.remove(transport_id) else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(&transport.peer_id) {
            peer.transports.remove(transport_id);
        }
        detached.transports.push(transport);
    }
}

/// Key of an engine-backed resource in the reverse index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Transport(TransportId),
    Producer(ProducerId),
    Consumer(ConsumerId),
}

/// Process-wide directory of rooms
#[derive(Default)]
pub struct SessionRegistry {
    rooms: DashMap<RoomId, Arc<SfuRoom>>,
    peer_rooms: DashMap<PeerId, RoomId>,
    resource_rooms: DashMap<ResourceKey, RoomId>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<SfuRoom>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    /// Return the room, creating it with `create` if absent
    pub fn room_or_insert_with(
        &self,
        room_id: &RoomId,
        create: impl FnOnce() -> SfuRoom,
    ) -> Arc<SfuRoom> {
        Arc::clone(
            self.rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(create()))
                .value(),
        )
    }

    /// Remove a room only if the registered instance is `room`
    pub fn remove_room(&self, room: &Arc<SfuRoom>) -> bool {
        self.rooms
            .remove_if(&room.id, |_, current| Arc::ptr_eq(current, room))
            .is_some()
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<Arc<SfuRoom>> {
        self.rooms.iter().map(|r| Arc::clone(r.value())).collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn room_of_peer(&self, peer_id: &PeerId) -> Option<Arc<SfuRoom>> {
        let room_id = self.peer_rooms.get(peer_id).map(|r| r.value().clone())?;
        self.room(&room_id)
    }

    #[must_use]
    pub fn room_of(&self, key: &ResourceKey) -> Option<Arc<SfuRoom>> {
        let room_id = self.resource_rooms.get(key).map(|r| r.value().clone())?;
        self.room(&room_id)
    }

    pub fn index_peer(&self, peer_id: PeerId, room_id: RoomId) {
        self.peer_rooms.insert(peer_id, room_id);
    }

    pub fn index_resource(&self, key: ResourceKey, room_id: RoomId) {
        self.resource_rooms.insert(key, room_id);
    }

    /// Drop index entries for everything in `detached`
    pub fn unindex(&self, detached: &Detached) {
        for peer in &detached.peers {
            self.peer_rooms.remove(&peer.id);
        }
        for transport in &detached.transports {
            self.resource_rooms
                .remove(&ResourceKey::Transport(transport.id.clone()));
        }
        for producer in &detached.producers {
            self.resource_rooms
                .remove(&ResourceKey::Producer(producer.id.clone()));
        }
        for consumer in &detached.consumers {
            self.resource_rooms
                .remove(&ResourceKey::Consumer(consumer.id.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(id: &str, transport: &str, peer: &str) -> ProducerEntry {
        ProducerEntry {
            id: ProducerId::from(id),
            transport_id: TransportId::from(transport),
            peer_id: PeerId::from(peer),
            kind: MediaKind::Audio,
            seq: 0,
        }
    }

    fn consumer(id: &str, producer: &str, transport: &str, peer: &str) -> ConsumerEntry {
        ConsumerEntry {
            id: ConsumerId::from(id),
            producer_id: ProducerId::from(producer),
            transport_id: TransportId::from(transport),
            peer_id: PeerId::from(peer),
            kind: MediaKind::Audio,
            state: ConsumerState::Paused,
        }
    }

    /// alice sends p1 on ts; bob receives c1 (of p1) on tr
    fn graph() -> RoomGraph {
        let mut g = RoomGraph::new();
        g.register_peer(PeerId::from("alice")).unwrap();
        g.register_peer(PeerId::from("bob")).unwrap();
        g.register_transport(TransportEntry::new(
            TransportId::from("ts"),
            PeerId::from("alice"),
            Direction::Send,
        ))
        .unwrap();
        g.register_transport(TransportEntry::new(
            TransportId::from("tr"),
            PeerId::from("bob"),
            Direction::Receive,
        ))
        .unwrap();
        g.register_producer(producer("p1", "ts", "alice")).unwrap();
        g.register_consumer(consumer("c1", "p1", "tr", "bob")).unwrap();
        g
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let mut g = graph();
        assert!(matches!(
            g.register_peer(PeerId::from("alice")),
            Err(RegistryError::Conflict(_))
        ));
        assert!(matches!(
            g.register_producer(producer("p1", "ts", "alice")),
            Err(RegistryError::Conflict(_))
        ));
    }

    #[test]
    fn test_register_requires_owner() {
        let mut g = graph();
        let err = g
            .register_transport(TransportEntry::new(
                TransportId::from("tx"),
                PeerId::from("carol"),
                Direction::Send,
            ))
            .unwrap_err();
        assert_eq!(err, RegistryError::NotFound("peer carol".to_string()));

        let err = g
            .register_consumer(consumer("c2", "missing", "tr", "bob"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn test_detach_transport_cascades_to_zero_children() {
        let mut g = graph();
        let detached = g.detach_transport(&TransportId::from("ts")).unwrap();

        assert_eq!(detached.transports.len(), 1);
        assert_eq!(detached.producers.len(), 1);
        assert_eq!(detached.consumers.len(), 1);
        assert_eq!(g.producer_count(), 0);
        assert_eq!(g.consumer_count(), 0);
        assert!(g.find_consumer(&ConsumerId::from("c1")).is_err());
        // bob's receive transport is untouched
        assert!(g.find_transport(&TransportId::from("tr")).is_ok());
        assert!(g
            .find_peer(&PeerId::from("alice"))
            .unwrap()
            .transports
            .is_empty());
    }

    #[test]
    fn test_detach_producer_closes_only_its_consumers() {
        let mut g = graph();
        g.register_producer(producer("p2", "ts", "alice")).unwrap();
        g.register_consumer(consumer("c2", "p2", "tr", "bob")).unwrap();

        let detached = g.detach_producer(&ProducerId::from("p1")).unwrap();
        let closed: Vec<_> = detached.consumers.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(closed, vec!["c1"]);
        assert!(g.find_consumer(&ConsumerId::from("c2")).is_ok());
        assert!(g.find_transport(&TransportId::from("ts")).is_ok());
        assert!(g.consumers_of(&ProducerId::from("p1")).is_empty());
    }

    #[test]
    fn test_detach_is_idempotent() {
        let mut g = graph();
        assert!(g.detach_producer(&ProducerId::from("p1")).is_some());
        assert!(g.detach_producer(&ProducerId::from("p1")).is_none());
        assert!(g.detach_consumer(&ConsumerId::from("c1")).is_none());
    }

    #[test]
    fn test_detach_peer_removes_everything_owned() {
        let mut g = graph();
        let detached = g.detach_peer(&PeerId::from("alice")).unwrap();
        assert_eq!(detached.peers.len(), 1);
        assert_eq!(g.peer_count(), 1);
        assert_eq!(g.transport_count(), 1);
        assert_eq!(g.consumer_count(), 0);
        assert!(g.detach_peer(&PeerId::from("alice")).is_none());
    }

    #[test]
    fn test_latest_producer_excluding() {
        let mut g = graph();
        g.register_producer(producer("p2", "ts", "alice")).unwrap();
        let latest = g.latest_producer_excluding(&PeerId::from("bob")).unwrap();
        assert_eq!(latest.id.as_str(), "p2");
        assert!(g.latest_producer_excluding(&PeerId::from("alice")).is_none());
    }

    #[test]
    fn test_resource_keys_list_parents_first() {
        let g = graph();
        let keys = g.resource_keys();
        assert_eq!(keys.len(), 4);
        assert!(matches!(keys[0], ResourceKey::Transport(_)));
        assert!(matches!(keys[1], ResourceKey::Transport(_)));
        assert_eq!(keys[2], ResourceKey::Producer(ProducerId::from("p1")));
        assert_eq!(keys[3], ResourceKey::Consumer(ConsumerId::from("c1")));
    }
}
