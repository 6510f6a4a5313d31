//! Overlay discovery: periodic enumeration of the overlay agent
//!
//! Instead of broadcasting, the node asks the tailscale agent for its peer
//! list at a fixed interval. Peers absent from an enumeration are removed
//! from the table immediately; there is no aging.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::config::Config;

use super::error::DiscoveryError;
use super::table::PeerTable;

/// Overlay agent binary
const AGENT: &str = "tailscale";

/// Bound on one agent invocation; also the startup reachability probe
const AGENT_TIMEOUT: Duration = Duration::from_secs(2);

/// The agent's status document, reduced to the fields discovery needs
#[derive(Debug, Deserialize)]
pub(super) struct StatusDoc {
    #[serde(rename = "Peer", default)]
    pub(super) peers: HashMap<String, PeerStatus>,
}

/// One peer entry from the status document
#[derive(Debug, Deserialize)]
pub(super) struct PeerStatus {
    #[serde(rename = "Online")]
    pub(super) online: bool,
    #[serde(rename = "TailscaleIPs", default)]
    pub(super) ips: Vec<IpAddr>,
    #[serde(rename = "HostName")]
    pub(super) hostname: String,
}

/// Address a peer is reachable on: its first IPv4, accepted only inside
/// the 100.0.0.0/8 overlay range.
pub(super) fn overlay_addr(status: &PeerStatus) -> Option<IpAddr> {
    let first_v4 = status.ips.iter().find_map(|ip| match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    })?;
    if first_v4.octets()[0] == 100 {
        Some(IpAddr::V4(first_v4))
    } else {
        None
    }
}

pub(super) fn parse_status(bytes: &[u8]) -> Result<StatusDoc, DiscoveryError> {
    Ok(serde_json::from_slice(bytes)?)
}

async fn fetch_status() -> Result<StatusDoc, DiscoveryError> {
    let output = timeout(
        AGENT_TIMEOUT,
        Command::new(AGENT).args(["status", "--json"]).output(),
    )
    .await
    .map_err(|_| DiscoveryError::Agent("status command timed out".to_string()))??;

    if !output.status.success() {
        return Err(DiscoveryError::Agent(format!(
            "status command exited with {}",
            output.status
        )));
    }

    parse_status(&output.stdout)
}

/// Whether the overlay agent answers; decides the strategy at startup
pub(super) async fn agent_reachable() -> bool {
    match fetch_status().await {
        Ok(_) => true,
        Err(e) => {
            debug!("Overlay agent not reachable: {}", e);
            false
        }
    }
}

/// Start the enumeration loop
pub(super) fn spawn(
    config: &Config,
    table: Arc<PeerTable>,
    running: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    vec![tokio::spawn(enumerate_loop(
        config.tcp_port,
        config.broadcast_interval(),
        table,
        running,
    ))]
}

async fn enumerate_loop(
    stream_port: u16,
    every: Duration,
    table: Arc<PeerTable>,
    running: Arc<AtomicBool>,
) {
    let mut ticker = interval(every);
    while running.load(Ordering::SeqCst) {
        ticker.tick().await;

        let status = match fetch_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Overlay enumeration failed: {}", e);
                continue;
            }
        };

        let mut seen = HashSet::new();
        for peer in status.peers.values() {
            if !peer.online {
                continue;
            }
            let Some(addr) = overlay_addr(peer) else {
                continue;
            };
            seen.insert(addr);
            if table.upsert(addr, &peer.hostname, stream_port) {
                info!("Overlay peer {} ({}) online", peer.hostname, addr);
            }
        }

        // The agent is authoritative: anything it stopped listing is gone.
        for record in table.retain_addrs(&seen) {
            info!("Overlay peer {} ({}) offline", record.name, record.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "Version": "1.60.0",
        "Peer": {
            "key:abc": {
                "Online": true,
                "TailscaleIPs": ["100.101.0.7", "fd7a:115c:a1e0::7"],
                "HostName": "alpha"
            },
            "key:def": {
                "Online": false,
                "TailscaleIPs": ["100.101.0.8"],
                "HostName": "beta"
            },
            "key:ghi": {
                "Online": true,
                "TailscaleIPs": ["192.168.1.4"],
                "HostName": "gamma"
            }
        }
    }"#;

    #[test]
    fn test_parse_status_document() {
        let status = parse_status(SAMPLE.as_bytes()).unwrap();
        assert_eq!(status.peers.len(), 3);

        let alpha = &status.peers["key:abc"];
        assert!(alpha.online);
        assert_eq!(alpha.hostname, "alpha");
        assert_eq!(alpha.ips.len(), 2);
    }

    #[test]
    fn test_parse_status_without_peers() {
        let status = parse_status(br#"{"Version":"1.60.0"}"#).unwrap();
        assert!(status.peers.is_empty());
    }

    #[test]
    fn test_parse_status_rejects_garbage() {
        assert!(parse_status(b"not json").is_err());
    }

    #[test]
    fn test_overlay_addr_accepts_overlay_range() {
        let status = parse_status(SAMPLE.as_bytes()).unwrap();
        let alpha = &status.peers["key:abc"];
        assert_eq!(
            overlay_addr(alpha),
            Some("100.101.0.7".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn test_overlay_addr_rejects_other_ranges() {
        let status = parse_status(SAMPLE.as_bytes()).unwrap();
        let gamma = &status.peers["key:ghi"];
        assert_eq!(overlay_addr(gamma), None);
    }

    #[test]
    fn test_overlay_addr_skips_ipv6() {
        let status = PeerStatus {
            online: true,
            ips: vec![
                "fd7a:115c:a1e0::7".parse().unwrap(),
                "100.64.0.9".parse().unwrap(),
            ],
            hostname: "delta".to_string(),
        };
        assert_eq!(
            overlay_addr(&status),
            Some("100.64.0.9".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn test_overlay_addr_without_ipv4() {
        let status = PeerStatus {
            online: true,
            ips: vec!["fd7a:115c:a1e0::7".parse().unwrap()],
            hostname: "epsilon".to_string(),
        };
        assert_eq!(overlay_addr(&status), None);
    }
}
