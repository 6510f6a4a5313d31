//! LAN discovery: UDP broadcast announcements
//!
//! Every node announces itself on the broadcast address at a fixed
//! interval, listens for announcements from others, and ages out peers
//! that have gone quiet.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Config;

use super::table::PeerTable;

/// Maximum announcement datagram size
const MAX_DATAGRAM_LEN: usize = 1024;

/// Receive poll period; bounds shutdown latency of the listen loop
const RECV_POLL: Duration = Duration::from_secs(1);

/// Discovery datagram: UTF-8 JSON with the sender's name, address and
/// stream port. Any missing or malformed field fails parsing and drops
/// the datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub username: String,
    pub ip: IpAddr,
    pub tcp_port: u16,
}

/// Resolve the address the kernel would source LAN traffic from.
///
/// Connecting a datagram socket to an unroutable destination selects a
/// source address without sending anything. Falls back to loopback.
pub fn local_ip() -> IpAddr {
    let probed = std::net::UdpSocket::bind(("0.0.0.0", 0)).and_then(|socket| {
        socket.connect(("10.255.255.255", 1))?;
        socket.local_addr()
    });
    match probed {
        Ok(addr) => addr.ip(),
        Err(e) => {
            warn!("Could not determine local address, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Start the announce, listen and aging loops
pub(super) fn spawn(
    config: &Config,
    username: &str,
    table: Arc<PeerTable>,
    running: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    let local = local_ip();
    info!("LAN discovery for {} on {}", username, local);

    let announcement = Announcement {
        username: username.to_string(),
        ip: local,
        tcp_port: config.tcp_port,
    };

    vec![
        tokio::spawn(announce_loop(
            announcement,
            config.broadcast_port,
            config.broadcast_interval(),
            running.clone(),
        )),
        tokio::spawn(listen_loop(
            local,
            config.broadcast_port,
            table.clone(),
            running.clone(),
        )),
        tokio::spawn(cleanup_loop(
            table,
            config.peer_timeout(),
            config.cleanup_interval(),
            running,
        )),
    ]
}

async fn announce_loop(
    announcement: Announcement,
    port: u16,
    every: Duration,
    running: Arc<AtomicBool>,
) {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("Failed to open announce socket: {}", e);
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        error!("Failed to enable broadcast: {}", e);
        return;
    }

    let message = match serde_json::to_vec(&announcement) {
        Ok(message) => message,
        Err(e) => {
            error!("Failed to serialize announcement: {}", e);
            return;
        }
    };

    let mut ticker = interval(every);
    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        match socket.send_to(&message, (Ipv4Addr::BROADCAST, port)).await {
            Ok(_) => debug!("Announced {}", announcement.username),
            Err(e) => warn!("Broadcast announce failed: {}", e),
        }
    }
}

async fn listen_loop(local: IpAddr, port: u16, table: Arc<PeerTable>, running: Arc<AtomicBool>) {
    let socket = match bind_reuse_udp(port) {
        Ok(socket) => socket,
        Err(e) => {
            error!("Failed to bind discovery listener on port {}: {}", port, e);
            return;
        }
    };
    debug!("Listening for announcements on port {}", port);

    let mut buf = [0u8; MAX_DATAGRAM_LEN];
    while running.load(Ordering::SeqCst) {
        let len = match timeout(RECV_POLL, socket.recv_from(&mut buf)).await {
            // poll tick; re-check the running flag
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!("Discovery receive failed: {}", e);
                continue;
            }
            Ok(Ok((len, _from))) => len,
        };

        let announcement: Announcement = match serde_json::from_slice(&buf[..len]) {
            Ok(announcement) => announcement,
            Err(e) => {
                debug!("Dropping malformed announcement: {}", e);
                continue;
            }
        };

        if announcement.ip == local {
            continue;
        }

        if table.upsert(announcement.ip, &announcement.username, announcement.tcp_port) {
            info!(
                "Discovered peer {} ({})",
                announcement.username, announcement.ip
            );
        }
    }
}

async fn cleanup_loop(
    table: Arc<PeerTable>,
    timeout_after: Duration,
    every: Duration,
    running: Arc<AtomicBool>,
) {
    let mut ticker = interval(every);
    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        for record in table.age(timeout_after) {
            info!("Peer {} ({}) timed out", record.name, record.addr);
        }
    }
}

/// Bind a datagram socket with SO_REUSEADDR so multiple nodes on one host
/// can share the announcement port.
fn bind_reuse_udp(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}
