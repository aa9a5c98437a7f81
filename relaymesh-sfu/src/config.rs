//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::WorkerSettings;
use crate::rtp::{ListenIp, WebRtcTransportOptions};

/// SFU configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Number of engine workers; rooms are spread across them
    pub num_workers: usize,
    /// Lowest RTC port a worker may bind
    pub rtc_min_port: u16,
    /// Highest RTC port a worker may bind
    pub rtc_max_port: u16,
    /// Address transports listen on
    pub listen_ip: String,
    /// Address advertised in ICE candidates
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Simultaneous transports a peer may hold per direction
    pub max_transports_per_direction: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Keep a room and its router alive after the last peer left
    pub keep_empty_rooms: bool,
    /// Room joined by channels that do not name one
    pub default_room: String,
    /// Delay between a worker dying and process termination
    pub worker_death_grace_ms: u64,
    /// Capacity of each peer's push-event queue
    pub event_channel_capacity: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            rtc_min_port: 2000,
            rtc_max_port: 2020,
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: Some("127.0.0.1".to_string()),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            max_transports_per_direction: 1,
            max_peers_per_room: 0,
            max_rooms: 0,
            keep_empty_rooms: false,
            default_room: "mediasoup".to_string(),
            worker_death_grace_ms: 2000,
            event_channel_capacity: 256,
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: self.listen_ip.clone(),
                announced_ip: self.announced_ip.clone(),
            }],
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
        }
    }

    #[must_use]
    pub const fn worker_death_grace(&self) -> Duration {
        Duration::from_millis(self.worker_death_grace_ms)
    }

    /// Collect every problem with this configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.num_workers == 0 {
            errors.push("sfu.num_workers must be at least 1".to_string());
        }
        if self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "sfu.rtc_min_port ({}) is greater than sfu.rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if self.max_transports_per_direction == 0 {
            errors.push("sfu.max_transports_per_direction must be at least 1".to_string());
        }
        if self.event_channel_capacity == 0 {
            errors.push("sfu.event_channel_capacity must be at least 1".to_string());
        }
        if !self.enable_udp && !self.enable_tcp {
            errors.push("sfu: at least one of enable_udp/enable_tcp must be set".to_string());
        }
        if self.announced_ip.as_deref().is_some_and(str::is_empty) {
            errors.push("sfu.announced_ip must not be empty when set".to_string());
        }
        if self.default_room.is_empty() {
            errors.push("sfu.default_room must not be empty".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SfuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_death_grace(), Duration::from_secs(2));

        let options = config.transport_options();
        assert_eq!(options.listen_ips[0].ip, "0.0.0.0");
        assert_eq!(options.listen_ips[0].announced_ip.as_deref(), Some("127.0.0.1"));
        assert!(options.enable_udp && options.enable_tcp && options.prefer_udp);
    }

    #[test]
    fn test_validate_collects_errors() {
        let config = SfuConfig {
            num_workers: 0,
            rtc_min_port: 3000,
            rtc_max_port: 2000,
            max_transports_per_direction: 0,
            ..SfuConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
