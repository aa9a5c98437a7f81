//! `RelayMesh` SFU (Selective Forwarding Unit) signaling core
//!
//! This crate orchestrates a media engine on behalf of remote WebRTC peers. It
//! never touches media itself: peers ask for transports, producers and
//! consumers, and the SFU creates them through the [`MediaEngine`] facade while
//! keeping the ownership graph between them consistent.
//!
//! ## Architecture
//!
//! - **`SessionRegistry`**: rooms by id, each holding a `RoomGraph` of peers,
//!   transports, producers and consumers with explicit ownership edges
//! - **`SfuManager`**: the resource lifecycle (create, connect, produce,
//!   consume, resume, close with cascade)
//! - **`ConnectionSupervisor`**: peer channel lifecycle and the fatal policy
//!   for dead engine workers
//! - **`MediaEngine`**: the engine facade, with [`LoopbackEngine`] as the
//!   in-process implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relaymesh_sfu::{ConnectionSupervisor, Direction, LoopbackEngine, RoomId, SfuConfig, SfuManager};
//!
//! let engine = Arc::new(LoopbackEngine::new());
//! let manager = SfuManager::start(SfuConfig::default(), engine).await?;
//! let supervisor = ConnectionSupervisor::new(manager);
//! supervisor.spawn_monitor();
//!
//! let session = supervisor.connect(&RoomId::from("lobby")).await?;
//! let transport = supervisor
//!     .manager()
//!     .create_transport(&session.peer_id, Direction::Send)
//!     .await?;
//! ```

mod config;
pub mod engine;
mod error;
mod events;
mod manager;
pub mod registry;
mod room;
pub mod rtp;
mod supervisor;
mod types;

pub use config::SfuConfig;
pub use engine::{
    ConsumerInfo, EngineError, EngineEvent, EngineResult, LoopbackEngine, MediaEngine,
    ProducerInfo, RouterInfo, TransportInfo, WorkerSettings,
};
pub use error::{Result, SfuError};
pub use events::{PeerEvent, PeerEventHub};
pub use manager::{CloseCause, ManagerStats, SfuManager};
pub use registry::{RegistryError, ResourceKey, SessionRegistry};
pub use room::{RoomStats, SfuRoom};
pub use rtp::{
    media_codecs, Direction, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters,
};
pub use supervisor::{ConnectionState, ConnectionSupervisor, PeerSession};
pub use types::{ConsumerId, PeerId, ProducerId, RoomId, RouterId, TransportId, WorkerId};
