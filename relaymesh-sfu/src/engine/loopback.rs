//! In-process engine that keeps the bookkeeping of a real media engine without
//! moving any media.
//!
//! It hands out ids, synthesises ICE and DTLS parameters from the configured
//! listen address, answers the codec compatibility question and cascades
//! closures the way a real engine does. It is what the server runs with when no
//! external engine is linked in, and what the test-suite drives.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ConsumerInfo, EngineError, EngineEvent, EngineResult, MediaEngine, ProducerInfo, RouterInfo,
    TransportInfo, WorkerSettings,
};
use crate::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters, TransportProtocol,
    WebRtcTransportOptions,
};
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;
const UDP_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const TCP_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

struct WorkerState {
    settings: WorkerSettings,
    next_port: u16,
}

struct RouterState {
    worker_id: WorkerId,
    rtp_capabilities: RtpCapabilities,
}

struct TransportState {
    router_id: RouterId,
    connected: bool,
}

struct ProducerState {
    transport_id: TransportId,
    router_id: RouterId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct ConsumerState {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Default)]
struct LoopbackState {
    workers: HashMap<WorkerId, WorkerState>,
    routers: HashMap<RouterId, RouterState>,
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
    /// Last media section id handed to a consumer
    last_mid: u64,
}

impl LoopbackState {
    fn remove_consumer(&mut self, consumer_id: &ConsumerId) {
        self.consumers.remove(consumer_id);
    }

    fn remove_producer(&mut self, producer_id: &ProducerId) {
        if self.producers.remove(producer_id).is_none() {
            return;
        }
        self.consumers
            .retain(|_, consumer| &consumer.producer_id != producer_id);
    }

    fn remove_transport(&mut self, transport_id: &TransportId) {
        if self.transports.remove(transport_id).is_none() {
            return;
        }
        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.remove_producer(&producer_id);
        }
        self.consumers
            .retain(|_, consumer| &consumer.transport_id != transport_id);
    }

    fn remove_router(&mut self, router_id: &RouterId) {
        if self.routers.remove(router_id).is_none() {
            return;
        }
        let transports: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|(_, t)| &t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transports {
            self.remove_transport(&transport_id);
        }
    }

    fn allocate_port(&mut self, worker_id: &WorkerId) -> EngineResult<u16> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| EngineError::WorkerUnavailable(worker_id.to_string()))?;
        let port = worker.next_port;
        worker.next_port = if port >= worker.settings.rtc_max_port {
            worker.settings.rtc_min_port
        } else {
            port + 1
        };
        Ok(port)
    }
}

/// In-process [`MediaEngine`] implementation
pub struct LoopbackEngine {
    state: Mutex<LoopbackState>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(LoopbackState::default()),
            events,
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine: nobody is interested yet.
        let _ = self.events.send(event);
    }

    /// Simulate the worker process dying
    pub fn kill_worker(&self, worker_id: &WorkerId, reason: impl Into<String>) {
        {
            let mut state = self.state.lock();
            if state.workers.remove(worker_id).is_none() {
                return;
            }
            let routers: Vec<RouterId> = state
                .routers
                .iter()
                .filter(|(_, r)| &r.worker_id == worker_id)
                .map(|(id, _)| id.clone())
                .collect();
            for router_id in routers {
                state.remove_router(&router_id);
            }
        }
        let reason = reason.into();
        warn!(worker_id = %worker_id, reason = %reason, "Loopback worker died");
        self.emit(EngineEvent::WorkerDied {
            worker_id: worker_id.clone(),
            reason,
        });
    }

    /// Simulate the remote end tearing down DTLS on a transport
    pub fn close_transport_remotely(&self, transport_id: &TransportId) {
        let existed = {
            let mut state = self.state.lock();
            let existed = state.transports.contains_key(transport_id);
            state.remove_transport(transport_id);
            existed
        };
        if existed {
            debug!(transport_id = %transport_id, "DTLS closed, transport closed by engine");
            self.emit(EngineEvent::TransportClosed {
                transport_id: transport_id.clone(),
            });
        }
    }

    /// Simulate the engine closing a producer on its own
    pub fn close_producer_remotely(&self, producer_id: &ProducerId) {
        let existed = {
            let mut state = self.state.lock();
            let existed = state.producers.contains_key(producer_id);
            state.remove_producer(producer_id);
            existed
        };
        if existed {
            self.emit(EngineEvent::ProducerClosed {
                producer_id: producer_id.clone(),
            });
        }
    }

    #[must_use]
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.state.lock().workers.keys().cloned().collect()
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.state.lock().routers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.state.lock().transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// `Some(paused)` for a live consumer, `None` once it is gone
    #[must_use]
    pub fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.state.lock().consumers.get(consumer_id).map(|c| c.paused)
    }
}

fn random_fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn router_capabilities(media_codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    let codecs = media_codecs
        .iter()
        .zip(FIRST_DYNAMIC_PAYLOAD_TYPE..)
        .map(|(codec, payload_type)| RtpCodecCapability {
            preferred_payload_type: codec.preferred_payload_type.or(Some(payload_type)),
            ..codec.clone()
        })
        .collect();
    RtpCapabilities {
        codecs,
        header_extensions: Vec::new(),
    }
}

/// Codecs of `producer` the receiver can decode, re-mapped to the payload
/// types the receiver prefers.
fn negotiate_codecs(
    producer: &RtpParameters,
    receiver: &RtpCapabilities,
) -> Vec<RtpCodecParameters> {
    producer
        .codecs
        .iter()
        .filter_map(|codec| {
            receiver
                .codecs
                .iter()
                .find(|cap| cap.matches(codec))
                .map(|cap| RtpCodecParameters {
                    payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                    ..codec.clone()
                })
        })
        .collect()
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<WorkerId> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::Rejected(format!(
                "invalid port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }
        let worker_id = WorkerId::new(Uuid::new_v4().to_string());
        self.state.lock().workers.insert(
            worker_id.clone(),
            WorkerState {
                settings: settings.clone(),
                next_port: settings.rtc_min_port,
            },
        );
        debug!(worker_id = %worker_id, "Loopback worker created");
        Ok(worker_id)
    }

    async fn create_router(
        &self,
        worker_id: &WorkerId,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<RouterInfo> {
        let mut state = self.state.lock();
        if !state.workers.contains_key(worker_id) {
            return Err(EngineError::WorkerUnavailable(worker_id.to_string()));
        }
        let router_id = RouterId::new(Uuid::new_v4().to_string());
        let rtp_capabilities = router_capabilities(media_codecs);
        state.routers.insert(
            router_id.clone(),
            RouterState {
                worker_id: worker_id.clone(),
                rtp_capabilities: rtp_capabilities.clone(),
            },
        );
        Ok(RouterInfo {
            id: router_id,
            rtp_capabilities,
        })
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &RouterId,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<TransportInfo> {
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Rejected(
                "at least one of UDP or TCP must be enabled".to_string(),
            ));
        }
        if options.listen_ips.is_empty() {
            return Err(EngineError::Rejected("no listen IPs given".to_string()));
        }

        let mut state = self.state.lock();
        let worker_id = state
            .routers
            .get(router_id)
            .map(|r| r.worker_id.clone())
            .ok_or_else(|| EngineError::UnknownResource(router_id.to_string()))?;
        let port = state.allocate_port(&worker_id)?;

        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (UDP_CANDIDATE_PRIORITY, TCP_CANDIDATE_PRIORITY)
        } else {
            (TCP_CANDIDATE_PRIORITY, UDP_CANDIDATE_PRIORITY)
        };

        let mut ice_candidates = Vec::new();
        for (index, listen) in options.listen_ips.iter().enumerate() {
            let ip = listen
                .announced_ip
                .clone()
                .unwrap_or_else(|| listen.ip.clone());
            if options.enable_udp {
                ice_candidates.push(IceCandidate {
                    foundation: format!("udpcandidate{index}"),
                    priority: udp_priority,
                    ip: ip.clone(),
                    protocol: TransportProtocol::Udp,
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: None,
                });
            }
            if options.enable_tcp {
                ice_candidates.push(IceCandidate {
                    foundation: format!("tcpcandidate{index}"),
                    priority: tcp_priority,
                    ip,
                    protocol: TransportProtocol::Tcp,
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: Some("passive".to_string()),
                });
            }
        }

        let transport_id = TransportId::new(Uuid::new_v4().to_string());
        state.transports.insert(
            transport_id.clone(),
            TransportState {
                router_id: router_id.clone(),
                connected: false,
            },
        );

        Ok(TransportInfo {
            id: transport_id,
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> EngineResult<()> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Rejected(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::UnknownResource(transport_id.to_string()))?;
        if transport.connected {
            return Err(EngineError::Rejected("connect() already called".to_string()));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> EngineResult<ProducerInfo> {
        let mut state = self.state.lock();
        let router_id = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| EngineError::UnknownResource(transport_id.to_string()))?;
        let router = state
            .routers
            .get(&router_id)
            .ok_or_else(|| EngineError::UnknownResource(router_id.to_string()))?;
        let supported = rtp_parameters
            .codecs
            .iter()
            .any(|codec| router.rtp_capabilities.supports(codec));
        if !supported {
            return Err(EngineError::Rejected(
                "no producer codec is supported by the router".to_string(),
            ));
        }

        let producer_id = ProducerId::new(Uuid::new_v4().to_string());
        state.producers.insert(
            producer_id.clone(),
            ProducerState {
                transport_id: transport_id.clone(),
                router_id,
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        Ok(ProducerInfo {
            id: producer_id,
            kind,
        })
    }

    fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        let state = self.state.lock();
        state
            .producers
            .get(producer_id)
            .filter(|p| &p.router_id == router_id)
            .is_some_and(|p| !negotiate_codecs(&p.rtp_parameters, rtp_capabilities).is_empty())
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<ConsumerInfo> {
        let mut state = self.state.lock();
        if !state.transports.contains_key(transport_id) {
            return Err(EngineError::UnknownResource(transport_id.to_string()));
        }
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::UnknownResource(producer_id.to_string()))?;

        let codecs = negotiate_codecs(&producer.rtp_parameters, rtp_capabilities);
        if codecs.is_empty() {
            return Err(EngineError::Rejected(
                "cannot consume producer with given capabilities".to_string(),
            ));
        }
        let kind = producer.kind;
        let encodings = producer.rtp_parameters.encodings.clone();
        let rtcp = producer.rtp_parameters.rtcp.clone();
        let mid = state.last_mid;
        state.last_mid += 1;
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs,
            header_extensions: Vec::new(),
            encodings,
            rtcp,
        };

        let consumer_id = ConsumerId::new(Uuid::new_v4().to_string());
        state.consumers.insert(
            consumer_id.clone(),
            ConsumerState {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                paused,
            },
        );
        Ok(ConsumerInfo {
            id: consumer_id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()> {
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::UnknownResource(consumer_id.to_string()))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_router(&self, router_id: &RouterId) -> EngineResult<()> {
        self.state.lock().remove_router(router_id);
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) -> EngineResult<()> {
        self.state.lock().remove_transport(transport_id);
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> EngineResult<()> {
        self.state.lock().remove_producer(producer_id);
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()> {
        self.state.lock().remove_consumer(consumer_id);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn has_worker(&self, worker_id: &WorkerId) -> bool {
        self.state.lock().workers.contains_key(worker_id)
    }

    fn has_transport(&self, transport_id: &TransportId) -> bool {
        self.state.lock().transports.contains_key(transport_id)
    }

    fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.state.lock().producers.contains_key(producer_id)
    }

    fn has_consumer(&self, consumer_id: &ConsumerId) -> bool {
        self.state.lock().consumers.contains_key(consumer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{media_codecs, ListenIp};

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 2000,
            rtc_max_port: 2001,
        }
    }

    fn options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: Some("127.0.0.1".to_string()),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: serde_json::Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..RtpParameters::default()
        }
    }

    #[tokio::test]
    async fn test_transport_candidates_use_announced_ip() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = engine.create_router(&worker, &media_codecs()).await.unwrap();
        assert_eq!(
            router.rtp_capabilities.codecs[0].preferred_payload_type,
            Some(100)
        );

        let transport = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        assert_eq!(transport.ice_candidates.len(), 2);
        assert!(transport.ice_candidates.iter().all(|c| c.ip == "127.0.0.1"));
        let udp = &transport.ice_candidates[0];
        let tcp = &transport.ice_candidates[1];
        assert_eq!(udp.protocol, TransportProtocol::Udp);
        assert!(udp.priority > tcp.priority);
        assert_eq!(transport.dtls_parameters.fingerprints.len(), 1);
    }

    #[tokio::test]
    async fn test_ports_wrap_within_range() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = engine.create_router(&worker, &media_codecs()).await.unwrap();

        let mut ports = Vec::new();
        for _ in 0..3 {
            let t = engine
                .create_webrtc_transport(&router.id, &options())
                .await
                .unwrap();
            ports.push(t.ice_candidates[0].port);
        }
        assert_eq!(ports, vec![2000, 2001, 2000]);
    }

    #[tokio::test]
    async fn test_closing_transport_cascades() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = engine.create_router(&worker, &media_codecs()).await.unwrap();
        let send = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let recv = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let producer = engine
            .produce(&send.id, MediaKind::Audio, &opus_parameters())
            .await
            .unwrap();
        let consumer = engine
            .consume(&recv.id, &producer.id, &router.rtp_capabilities, true)
            .await
            .unwrap();
        assert_eq!(consumer.rtp_parameters.codecs[0].payload_type, 100);
        assert_eq!(engine.consumer_paused(&consumer.id), Some(true));

        engine.close_transport(&send.id).await.unwrap();
        assert_eq!(engine.producer_count(), 0);
        assert_eq!(engine.consumer_count(), 0);
        assert_eq!(engine.transport_count(), 1);
    }

    #[tokio::test]
    async fn test_can_consume_requires_matching_codec() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = engine.create_router(&worker, &media_codecs()).await.unwrap();
        let send = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let producer = engine
            .produce(&send.id, MediaKind::Audio, &opus_parameters())
            .await
            .unwrap();

        assert!(engine.can_consume(&router.id, &producer.id, &router.rtp_capabilities));

        let video_only = RtpCapabilities {
            codecs: vec![media_codecs()[1].clone()],
            header_extensions: Vec::new(),
        };
        assert!(!engine.can_consume(&router.id, &producer.id, &video_only));
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = engine.create_router(&worker, &media_codecs()).await.unwrap();
        let t = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();

        engine.connect_transport(&t.id, &t.dtls_parameters).await.unwrap();
        let err = engine
            .connect_transport(&t.id, &t.dtls_parameters)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_kill_worker_emits_event_and_drops_routers() {
        let engine = LoopbackEngine::new();
        let mut events = engine.events();
        let worker = engine.create_worker(&settings()).await.unwrap();
        engine.create_router(&worker, &media_codecs()).await.unwrap();

        engine.kill_worker(&worker, "segfault");
        assert_eq!(engine.router_count(), 0);
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::WorkerDied {
                worker_id: worker,
                reason: "segfault".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_consumer_mids_are_never_reused() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = engine.create_router(&worker, &media_codecs()).await.unwrap();
        let send = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let recv = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let producer = engine
            .produce(&send.id, MediaKind::Audio, &opus_parameters())
            .await
            .unwrap();

        let first = engine
            .consume(&recv.id, &producer.id, &router.rtp_capabilities, true)
            .await
            .unwrap();
        let second = engine
            .consume(&recv.id, &producer.id, &router.rtp_capabilities, true)
            .await
            .unwrap();
        engine.close_consumer(&first.id).await.unwrap();
        assert!(!engine.has_consumer(&first.id));
        let third = engine
            .consume(&recv.id, &producer.id, &router.rtp_capabilities, true)
            .await
            .unwrap();

        let mids: Vec<_> = [&first, &second, &third]
            .iter()
            .map(|c| c.rtp_parameters.mid.clone().unwrap())
            .collect();
        assert_eq!(mids, vec!["0", "1", "2"]);
    }
}
