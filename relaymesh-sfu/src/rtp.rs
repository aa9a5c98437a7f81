//! Media negotiation data model
//!
//! These structures are exchanged verbatim with browser peers, so their serde
//! representation follows the camelCase shape used by WebRTC client libraries.
//! The SFU never interprets them beyond the codec matching needed to pick a
//! router's capabilities and to answer compatibility questions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Transport direction, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Carries producers (peer -> SFU)
    Send,
    /// Carries consumers (SFU -> peer)
    #[serde(alias = "recv")]
    Receive,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

/// A codec a router (or a receiving peer) is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// Whether `codec` describes the same encoding as this capability
    #[must_use]
    pub fn matches(&self, codec: &RtpCodecParameters) -> bool {
        if !self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            || self.clock_rate != codec.clock_rate
        {
            return false;
        }
        match (self.channels, codec.channels) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Capabilities of a router or of a receiving endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    #[must_use]
    pub fn supports(&self, codec: &RtpCodecParameters) -> bool {
        self.codecs.iter().any(|cap| cap.matches(codec))
    }
}

/// A negotiated codec inside RTP parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// RTP parameters of a producer or consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: TransportProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
}

/// Options handed to the engine when creating a WebRTC transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

/// The process-wide codec list every router is created with.
///
/// Opus stereo at 48kHz for audio, VP8 at 90kHz for video with a start
/// bitrate hint of 1000 kbps.
#[must_use]
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = Map::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
            rtcp_feedback: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus(payload_type: u8) -> RtpCodecParameters {
        RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    #[test]
    fn test_media_codecs() {
        let codecs = media_codecs();
        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs[0].kind, MediaKind::Audio);
        assert_eq!(codecs[0].channels, Some(2));
        assert_eq!(codecs[1].mime_type, "video/VP8");
        assert_eq!(
            codecs[1].parameters.get("x-google-start-bitrate"),
            Some(&Value::from(1000))
        );
    }

    #[test]
    fn test_capability_matching_ignores_mime_case() {
        let caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                mime_type: "AUDIO/OPUS".to_string(),
                ..media_codecs()[0].clone()
            }],
            header_extensions: Vec::new(),
        };
        assert!(caps.supports(&opus(111)));

        let mut mono = opus(111);
        mono.channels = Some(1);
        assert!(!caps.supports(&mono));
    }

    #[test]
    fn test_direction_accepts_recv_alias() {
        let d: Direction = serde_json::from_str("\"recv\"").unwrap();
        assert_eq!(d, Direction::Receive);
        assert_eq!(serde_json::to_string(&Direction::Receive).unwrap(), "\"receive\"");
    }

    #[test]
    fn test_rtp_parameters_camel_case() {
        let params: RtpParameters = serde_json::from_value(serde_json::json!({
            "mid": "0",
            "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }],
            "encodings": [{ "ssrc": 1234 }]
        }))
        .unwrap();
        assert_eq!(params.codecs[0].payload_type, 111);
        assert_eq!(params.encodings.len(), 1);
    }
}
