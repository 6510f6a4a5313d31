//! Mesh integration tests
//!
//! Exercises the connection manager over real loopback sockets: framing
//! on the wire, one-connection-per-address, broadcast failure handling
//! and shutdown behavior.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::sleep;

use parley::network::{Frame, FrameSink, Mesh};

/// Sink that records everything it receives
struct RecordingSink {
    texts: Mutex<Vec<(String, IpAddr)>>,
    audio: Mutex<Vec<(Vec<u8>, IpAddr)>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            texts: Mutex::new(Vec::new()),
            audio: Mutex::new(Vec::new()),
        })
    }

    fn texts(&self) -> Vec<(String, IpAddr)> {
        self.texts.lock().unwrap().clone()
    }

    fn audio_count(&self) -> usize {
        self.audio.lock().unwrap().len()
    }
}

impl FrameSink for RecordingSink {
    fn on_audio(&self, payload: Vec<u8>, from: IpAddr) {
        self.audio.lock().unwrap().push((payload, from));
    }

    fn on_text(&self, text: String, from: IpAddr) {
        self.texts.lock().unwrap().push((text, from));
    }
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// Start a mesh on an auto-assigned port
async fn start_mesh(sink: Arc<RecordingSink>) -> Arc<Mesh> {
    let mesh = Arc::new(Mesh::new(localhost(), 0, sink));
    mesh.start().await.expect("Failed to start mesh");
    mesh
}

/// Poll `condition` until it holds or two seconds pass
async fn wait_for<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {}", what);
}

/// Test: A text frame crosses the wire intact
/// Given two connected meshes
/// When one broadcasts a text frame
/// Then the other's sink receives the exact payload and source address
#[tokio::test]
async fn test_text_frame_reaches_peer_sink() {
    let sink_a = RecordingSink::new();
    let sink_b = RecordingSink::new();
    let mesh_a = start_mesh(sink_a.clone()).await;
    let mesh_b = start_mesh(sink_b.clone()).await;

    let b_port = mesh_b.local_addr().unwrap().port();
    mesh_a
        .connect_to_peer(localhost(), b_port)
        .await
        .expect("Dial failed");
    wait_for("B to register the connection", || {
        !mesh_b.connected_peers().is_empty()
    })
    .await;

    mesh_a
        .send_frame(Frame::text(b"hi".to_vec()))
        .await
        .expect("Send failed");

    wait_for("text to arrive", || !sink_b.texts().is_empty()).await;
    let texts = sink_b.texts();
    assert_eq!(texts[0].0, "hi");
    assert_eq!(texts[0].1, localhost());

    mesh_a.stop().await;
    mesh_b.stop().await;
}

/// Test: Frames are delivered in wire order
#[tokio::test]
async fn test_frames_arrive_in_order() {
    let sink_b = RecordingSink::new();
    let mesh_a = start_mesh(RecordingSink::new()).await;
    let mesh_b = start_mesh(sink_b.clone()).await;

    let b_port = mesh_b.local_addr().unwrap().port();
    mesh_a.connect_to_peer(localhost(), b_port).await.unwrap();
    wait_for("connection", || !mesh_b.connected_peers().is_empty()).await;

    for i in 0..10 {
        mesh_a
            .send_frame(Frame::text(format!("msg-{}", i).into_bytes()))
            .await
            .unwrap();
    }

    wait_for("all messages", || sink_b.texts().len() == 10).await;
    let texts = sink_b.texts();
    for (i, (text, _)) in texts.iter().enumerate() {
        assert_eq!(text, &format!("msg-{}", i));
    }

    mesh_a.stop().await;
    mesh_b.stop().await;
}

/// Test: Dialing the same peer twice yields exactly one connection
#[tokio::test]
async fn test_connect_is_idempotent() {
    let mesh_a = start_mesh(RecordingSink::new()).await;
    let mesh_b = start_mesh(RecordingSink::new()).await;

    let b_port = mesh_b.local_addr().unwrap().port();
    mesh_a.connect_to_peer(localhost(), b_port).await.unwrap();
    mesh_a.connect_to_peer(localhost(), b_port).await.unwrap();

    wait_for("connection", || !mesh_b.connected_peers().is_empty()).await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(mesh_a.connected_peers().len(), 1);
    assert_eq!(mesh_b.connected_peers().len(), 1);

    mesh_a.stop().await;
    mesh_b.stop().await;
}

/// Test: A duplicate inbound connection from the same address is closed
#[tokio::test]
async fn test_duplicate_inbound_is_rejected() {
    let mesh = start_mesh(RecordingSink::new()).await;
    let addr = mesh.local_addr().unwrap();

    let _first = TcpStream::connect(addr).await.expect("First connect");
    let _second = TcpStream::connect(addr).await.expect("Second connect");
    sleep(Duration::from_millis(100)).await;

    assert_eq!(mesh.connected_peers().len(), 1);

    mesh.stop().await;
}

/// Test: An unknown frame type is skipped without dropping the connection
#[tokio::test]
async fn test_unknown_frame_type_is_skipped() {
    let sink = RecordingSink::new();
    let mesh = start_mesh(sink.clone()).await;
    let addr = mesh.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    wait_for("registration", || !mesh.connected_peers().is_empty()).await;

    // Unknown tag 0x7F with a 3-byte payload, then a valid text frame
    stream
        .write_all(&[0x7F, 0, 0, 0, 3, 1, 2, 3])
        .await
        .unwrap();
    stream
        .write_all(&Frame::text(b"still alive".to_vec()).encode())
        .await
        .unwrap();

    wait_for("text after unknown frame", || !sink.texts().is_empty()).await;
    assert_eq!(sink.texts()[0].0, "still alive");
    assert_eq!(mesh.connected_peers().len(), 1);

    mesh.stop().await;
}

/// Test: Invalid UTF-8 in a text frame terminates that connection
#[tokio::test]
async fn test_invalid_utf8_text_drops_connection() {
    let mesh = start_mesh(RecordingSink::new()).await;
    let addr = mesh.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    wait_for("registration", || !mesh.connected_peers().is_empty()).await;

    stream
        .write_all(&Frame::text(vec![0xFF, 0xFE, 0xFD]).encode())
        .await
        .unwrap();

    wait_for("deregistration", || mesh.connected_peers().is_empty()).await;

    mesh.stop().await;
}

/// Test: A dead peer is swept out without failing the broadcast
#[tokio::test]
async fn test_dead_peer_does_not_fail_broadcast() {
    let mesh_a = start_mesh(RecordingSink::new()).await;
    let mesh_b = start_mesh(RecordingSink::new()).await;

    let b_port = mesh_b.local_addr().unwrap().port();
    mesh_a.connect_to_peer(localhost(), b_port).await.unwrap();
    wait_for("connection", || !mesh_a.connected_peers().is_empty()).await;

    // Kill B: its sockets close and A must clean up on its own
    mesh_b.stop().await;

    for _ in 0..20 {
        mesh_a
            .send_frame(Frame::audio(vec![0xAB; 64]))
            .await
            .expect("Broadcast must not fail because of a dead peer");
        if mesh_a.connected_peers().is_empty() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    assert!(mesh_a.connected_peers().is_empty());

    mesh_a.stop().await;
}

/// Test: Empty payloads are a silent no-op on the wire
#[tokio::test]
async fn test_empty_payload_writes_nothing() {
    let sink_b = RecordingSink::new();
    let mesh_a = start_mesh(RecordingSink::new()).await;
    let mesh_b = start_mesh(sink_b.clone()).await;

    let b_port = mesh_b.local_addr().unwrap().port();
    mesh_a.connect_to_peer(localhost(), b_port).await.unwrap();
    wait_for("connection", || !mesh_b.connected_peers().is_empty()).await;

    mesh_a.send_frame(Frame::audio(Vec::new())).await.unwrap();
    mesh_a.send_frame(Frame::text(Vec::new())).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert!(sink_b.texts().is_empty());
    assert_eq!(sink_b.audio_count(), 0);

    mesh_a.stop().await;
    mesh_b.stop().await;
}

/// Test: Stop is idempotent and the port can be rebound immediately
/// This verifies SO_REUSEADDR is working correctly
#[tokio::test]
async fn test_stop_and_rebind_same_port() {
    let mesh = start_mesh(RecordingSink::new()).await;
    let port = mesh.local_addr().unwrap().port();

    mesh.stop().await;
    mesh.stop().await;

    sleep(Duration::from_millis(50)).await;

    let rebound = Arc::new(Mesh::new(localhost(), port, RecordingSink::new()));
    rebound
        .start()
        .await
        .expect("Should rebind the same port after stop");
    assert_eq!(rebound.local_addr().unwrap().port(), port);

    rebound.stop().await;
}
