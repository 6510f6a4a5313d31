//! Mesh connection manager
//!
//! Owns at most one framed stream connection per peer address: accepts
//! inbound peers, dials outbound ones on demand, and broadcasts frames to
//! every live connection. Received frames are delivered to a
//! constructor-injected [`FrameSink`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::error::NetworkError;
use super::frame::{self, Frame, FrameKind};

/// Accept poll period; bounds how long shutdown waits on the accept loop
const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Outbound dial timeout
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiver for frames arriving from the mesh.
///
/// Injected when the mesh is constructed, so every connection delivers into
/// the same sinks for its whole lifetime.
pub trait FrameSink: Send + Sync {
    /// One encoded audio frame from `from`
    fn on_audio(&self, payload: Vec<u8>, from: IpAddr);
    /// One UTF-8 text message from `from`
    fn on_text(&self, text: String, from: IpAddr);
}

/// One live peer connection
struct PeerLink {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    reader: Option<JoinHandle<()>>,
}

type LinkTable = Arc<Mutex<HashMap<IpAddr, PeerLink>>>;

/// Full-mesh connection manager
pub struct Mesh {
    bind_addr: SocketAddr,
    links: LinkTable,
    sink: Arc<dyn FrameSink>,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Mesh {
    /// Create a mesh that will listen on `host:port` once started
    pub fn new(host: IpAddr, port: u16, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            bind_addr: SocketAddr::new(host, port),
            links: Arc::new(Mutex::new(HashMap::new())),
            sink,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            accept_handle: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting inbound peers
    pub async fn start(&self) -> Result<(), NetworkError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = match bind_listener(self.bind_addr) {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!("Listening for peers on {}", local);

        let handle = tokio::spawn(Self::accept_loop(
            listener,
            self.running.clone(),
            self.links.clone(),
            self.sink.clone(),
        ));
        *self.accept_handle.lock() = Some(handle);

        Ok(())
    }

    /// Address the listener actually bound to (set after `start`)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Addresses with a live connection
    pub fn connected_peers(&self) -> Vec<IpAddr> {
        self.links.lock().keys().copied().collect()
    }

    /// Whether `ip` currently has a live connection
    pub fn is_connected(&self, ip: IpAddr) -> bool {
        self.links.lock().contains_key(&ip)
    }

    /// Dial a peer. Succeeds without dialing when a connection already
    /// exists; otherwise connects with a bounded timeout and registers the
    /// stream.
    pub async fn connect_to_peer(&self, ip: IpAddr, port: u16) -> Result<(), NetworkError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.links.lock().contains_key(&ip) {
            return Ok(());
        }

        let addr = SocketAddr::new(ip, port);
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::DialTimeout(ip))??;

        if Self::register(&self.links, &self.running, &self.sink, stream, ip) {
            info!("Connected to {}", addr);
        }
        Ok(())
    }

    /// Broadcast one frame to every connected peer.
    ///
    /// Empty payloads are a silent no-op and oversized payloads are
    /// rejected before framing. A failing peer is deregistered after the
    /// sweep; it never blocks or fails the send to the others.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), NetworkError> {
        if frame.payload.is_empty() {
            return Ok(());
        }
        if frame.payload.len() > frame::MAX_PAYLOAD_LEN {
            return Err(NetworkError::PayloadTooLarge(frame.payload.len()));
        }

        let bytes = frame.encode();

        // Copy the write handles out so no socket write happens under the
        // table lock.
        let targets: Vec<(IpAddr, Arc<tokio::sync::Mutex<OwnedWriteHalf>>)> = self
            .links
            .lock()
            .iter()
            .map(|(ip, link)| (*ip, link.writer.clone()))
            .collect();

        let mut failed = Vec::new();
        for (ip, writer) in targets {
            let mut guard = writer.lock().await;
            if let Err(e) = guard.write_all(&bytes).await {
                warn!("Send to {} failed: {}", ip, e);
                failed.push(ip);
            }
        }

        for ip in failed {
            self.disconnect(ip);
        }

        Ok(())
    }

    /// Stop accepting, close every connection and clear the table.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let accept = self.accept_handle.lock().take();
        if let Some(handle) = accept {
            // exits on its next poll tick
            let _ = handle.await;
        }

        let links: Vec<(IpAddr, PeerLink)> = {
            let mut table = self.links.lock();
            table.drain().collect()
        };
        for (ip, link) in links {
            if let Some(handle) = link.reader {
                handle.abort();
            }
            debug!("Closed connection to {}", ip);
        }

        info!("Mesh stopped");
    }

    fn disconnect(&self, ip: IpAddr) {
        if let Some(link) = self.links.lock().remove(&ip) {
            if let Some(handle) = link.reader {
                handle.abort();
            }
            info!("Dropped connection to {}", ip);
        }
    }

    /// Insert a stream into the table and spawn its receive loop. Returns
    /// false (dropping the stream) when the address is already connected.
    fn register(
        links: &LinkTable,
        running: &Arc<AtomicBool>,
        sink: &Arc<dyn FrameSink>,
        stream: TcpStream,
        ip: IpAddr,
    ) -> bool {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        {
            let mut table = links.lock();
            if table.contains_key(&ip) {
                return false;
            }
            table.insert(
                ip,
                PeerLink {
                    writer: Arc::new(tokio::sync::Mutex::new(write_half)),
                    reader: None,
                },
            );
        }

        let handle = tokio::spawn(Self::receive_loop(
            ip,
            read_half,
            running.clone(),
            links.clone(),
            sink.clone(),
        ));
        if let Some(link) = links.lock().get_mut(&ip) {
            link.reader = Some(handle);
        }
        true
    }

    async fn accept_loop(
        listener: TcpListener,
        running: Arc<AtomicBool>,
        links: LinkTable,
        sink: Arc<dyn FrameSink>,
    ) {
        while running.load(Ordering::SeqCst) {
            let (stream, remote) = match timeout(ACCEPT_POLL, listener.accept()).await {
                // poll tick; re-check the running flag
                Err(_) => continue,
                Ok(Err(e)) => {
                    if running.load(Ordering::SeqCst) {
                        warn!("Accept failed: {}", e);
                    }
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };

            let ip = remote.ip();
            if Self::register(&links, &running, &sink, stream, ip) {
                info!("Accepted connection from {}", ip);
            } else {
                debug!("Connection from {} already exists, closing duplicate", ip);
            }
        }
        debug!("Accept loop stopped");
    }

    async fn receive_loop(
        ip: IpAddr,
        mut reader: OwnedReadHalf,
        running: Arc<AtomicBool>,
        links: LinkTable,
        sink: Arc<dyn FrameSink>,
    ) {
        debug!("Receiving frames from {}", ip);

        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let (tag, payload) = match frame::read_frame(&mut reader).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("Read from {} ended: {}", ip, e);
                    break;
                }
            };

            match FrameKind::try_from(tag) {
                Ok(FrameKind::Audio) => {
                    trace!("Audio frame from {} ({} bytes)", ip, payload.len());
                    sink.on_audio(payload, ip);
                }
                Ok(FrameKind::Text) => match String::from_utf8(payload) {
                    Ok(text) => sink.on_text(text, ip),
                    Err(e) => {
                        warn!("Invalid UTF-8 text frame from {}: {}", ip, e);
                        break;
                    }
                },
                Err(()) => {
                    warn!("Unknown frame type 0x{:02x} from {}, skipping", tag, ip);
                }
            }
        }

        if links.lock().remove(&ip).is_some() {
            info!("Connection to {} closed", ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    impl FrameSink for NullSink {
        fn on_audio(&self, _payload: Vec<u8>, _from: IpAddr) {}
        fn on_text(&self, _text: String, _from: IpAddr) {}
    }

    fn test_mesh() -> Mesh {
        Mesh::new("127.0.0.1".parse().unwrap(), 0, Arc::new(NullSink))
    }

    #[tokio::test]
    async fn test_new_mesh_has_no_peers() {
        let mesh = test_mesh();
        assert!(mesh.connected_peers().is_empty());
        assert!(mesh.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_empty_payload_is_noop() {
        let mesh = test_mesh();
        mesh.send_frame(Frame::text(Vec::new()))
            .await
            .expect("Empty payload should be a no-op");
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_before_framing() {
        let mesh = test_mesh();
        let payload = vec![0u8; frame::MAX_PAYLOAD_LEN + 1];
        match mesh.send_frame(Frame::audio(payload)).await {
            Err(NetworkError::PayloadTooLarge(len)) => {
                assert_eq!(len, frame::MAX_PAYLOAD_LEN + 1);
            }
            other => panic!("Expected PayloadTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mesh = test_mesh();
        mesh.stop().await;
        mesh.stop().await;
    }
}

/// Bind a stream listener with SO_REUSEADDR so a node can rebind its port
/// immediately after a restart.
fn bind_listener(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}
