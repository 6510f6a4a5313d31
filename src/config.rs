//! Node configuration
//!
//! One immutable value parsed at startup from flags or environment
//! variables and passed by reference to every subsystem.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
pub struct Config {
    /// Address the stream listener binds to
    #[arg(long, env = "TCP_HOST", default_value = "0.0.0.0")]
    pub tcp_host: IpAddr,

    /// Port peers connect to for audio and text streams
    #[arg(long, env = "TCP_PORT", default_value_t = 52700)]
    pub tcp_port: u16,

    /// Port discovery announcements are sent and received on
    #[arg(long, env = "BROADCAST_PORT", default_value_t = 52701)]
    pub broadcast_port: u16,

    /// Seconds between discovery announcements (or overlay enumerations)
    #[arg(long, env = "BROADCAST_INTERVAL", default_value_t = 2.0)]
    pub broadcast_interval_secs: f64,

    /// Seconds of silence before a LAN peer is dropped
    #[arg(long, env = "PEER_TIMEOUT", default_value_t = 10.0)]
    pub peer_timeout_secs: f64,

    /// Seconds between peer-table aging sweeps
    #[arg(long, env = "CLEANUP_INTERVAL", default_value_t = 3.0)]
    pub cleanup_interval_secs: f64,

    /// Seconds between reconciliation passes over discovered peers
    #[arg(long, env = "CONNECTION_CHECK_INTERVAL", default_value_t = 3.0)]
    pub connection_check_interval_secs: f64,

    /// Seconds the capture path waits when no frame is ready
    #[arg(long, env = "AUDIO_SEND_INTERVAL", default_value_t = 0.05)]
    pub audio_send_interval_secs: f64,
}

impl Config {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs_f64(self.broadcast_interval_secs.max(0.0))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.peer_timeout_secs.max(0.0))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_interval_secs.max(0.0))
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.connection_check_interval_secs.max(0.0))
    }

    pub fn audio_send_interval(&self) -> Duration {
        Duration::from_secs_f64(self.audio_send_interval_secs.max(0.0))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 52700,
            broadcast_port: 52701,
            broadcast_interval_secs: 2.0,
            peer_timeout_secs: 10.0,
            cleanup_interval_secs: 3.0,
            connection_check_interval_secs: 3.0,
            audio_send_interval_secs: 0.05,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::parse_from([
            "parley",
            "--tcp-port",
            "6000",
            "--broadcast-interval-secs",
            "5",
        ]);
        assert_eq!(config.tcp_port, 6000);
        assert_eq!(config.broadcast_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_interval_helpers() {
        let config = Config::default();
        assert_eq!(config.broadcast_interval(), Duration::from_secs(2));
        assert_eq!(config.peer_timeout(), Duration::from_secs(10));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(3));
        assert_eq!(config.connection_check_interval(), Duration::from_secs(3));
        assert_eq!(config.audio_send_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_negative_interval_is_clamped() {
        let config = Config {
            peer_timeout_secs: -1.0,
            ..Config::default()
        };
        assert_eq!(config.peer_timeout(), Duration::ZERO);
    }
}
