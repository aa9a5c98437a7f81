//! Media engine facade
//!
//! The SFU never touches media. Everything that involves ICE, DTLS, SRTP or RTP
//! forwarding is delegated to an engine behind the [`MediaEngine`] trait. The
//! trait is addressed by id: the engine owns the real objects and the SFU only
//! keeps the ids it was handed back.
//!
//! Engine-initiated state changes (a worker process dying, a transport whose
//! DTLS session closed underneath us) are reported through [`MediaEngine::events`].
//! The `has_*` queries let a subscriber that missed events catch up.

mod loopback;

pub use loopback::LoopbackEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::rtp::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters, WebRtcTransportOptions,
};
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine rejected request: {0}")]
    Rejected(String),

    #[error("unknown engine resource: {0}")]
    UnknownResource(String),

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Settings for spawning an engine worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterInfo {
    pub id: RouterId,
    pub rtp_capabilities: RtpCapabilities,
}

/// What a remote peer needs to set up its side of a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Engine-initiated notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The worker process died; everything it hosted is gone
    WorkerDied { worker_id: WorkerId, reason: String },
    /// A transport closed on the engine side (e.g. DTLS state went to `closed`)
    TransportClosed { transport_id: TransportId },
    ProducerClosed { producer_id: ProducerId },
    ConsumerClosed { consumer_id: ConsumerId },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<WorkerId>;

    async fn create_router(
        &self,
        worker_id: &WorkerId,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<RouterInfo>;

    async fn create_webrtc_transport(
        &self,
        router_id: &RouterId,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<TransportInfo>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> EngineResult<()>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> EngineResult<ProducerInfo>;

    /// Whether a receiver with `rtp_capabilities` can consume `producer_id`
    fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<ConsumerInfo>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()>;

    /// Closing a router closes every transport created on it
    async fn close_router(&self, router_id: &RouterId) -> EngineResult<()>;

    /// Closing a transport closes its producers and consumers
    async fn close_transport(&self, transport_id: &TransportId) -> EngineResult<()>;

    /// Closing a producer closes every consumer of it
    async fn close_producer(&self, producer_id: &ProducerId) -> EngineResult<()>;

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()>;

    fn events(&self) -> broadcast::Receiver<EngineEvent>;

    /// Whether the worker is still running
    fn has_worker(&self, worker_id: &WorkerId) -> bool;

    /// Whether the engine still holds the transport
    fn has_transport(&self, transport_id: &TransportId) -> bool;

    fn has_producer(&self, producer_id: &ProducerId) -> bool;

    fn has_consumer(&self, consumer_id: &ConsumerId) -> bool;
}
