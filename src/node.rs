//! Session coordinator
//!
//! Wires discovery, the mesh and the audio pipeline into one node:
//! reconciles discovered-but-unconnected peers, pumps captured frames
//! into the mesh, and delivers incoming text to the UI callback.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::audio::{AudioError, AudioPipeline, PlaybackQueue};
use crate::config::Config;
use crate::discovery::{Discovery, PeerRecord, PeerTable};
use crate::network::{Frame, FrameSink, Mesh, NetworkError};

/// Errors that can abort node startup
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("audio pipeline failed to start: {0}")]
    Audio(#[from] AudioError),

    #[error("network failed to start: {0}")]
    Network(#[from] NetworkError),
}

/// UI callback receiving `(sender name, message)`
pub type TextCallback = Box<dyn Fn(&str, &str) + Send + Sync + 'static>;

/// Delivers mesh frames into the playback queue and the UI.
///
/// Audio goes straight onto the per-node playback queue; the mixer on the
/// playback side handles concurrent senders. Text resolves the sender's
/// display name through the peer table, falling back to the bare address.
struct NodeSink {
    queue: Arc<PlaybackQueue>,
    table: Arc<PeerTable>,
    text_callback: Arc<Mutex<Option<TextCallback>>>,
}

impl FrameSink for NodeSink {
    fn on_audio(&self, payload: Vec<u8>, _from: IpAddr) {
        self.queue.push(payload);
    }

    fn on_text(&self, text: String, from: IpAddr) {
        let name = self
            .table
            .display_name(from)
            .unwrap_or_else(|| from.to_string());
        info!("{}: {}", name, text);
        if let Some(callback) = self.text_callback.lock().as_ref() {
            callback(&name, &text);
        }
    }
}

/// One chat node: discovery, mesh, audio and the loops that drive them
pub struct Node {
    config: Config,
    username: String,
    table: Arc<PeerTable>,
    mesh: Arc<Mesh>,
    queue: Arc<PlaybackQueue>,
    text_callback: Arc<Mutex<Option<TextCallback>>>,
    running: Arc<AtomicBool>,
    discovery: Mutex<Option<Discovery>>,
    pipeline: Mutex<Option<AudioPipeline>>,
    main_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(username: String, config: Config) -> Self {
        let table = Arc::new(PeerTable::new());
        let queue = Arc::new(PlaybackQueue::new());
        let text_callback: Arc<Mutex<Option<TextCallback>>> = Arc::new(Mutex::new(None));

        let sink = Arc::new(NodeSink {
            queue: queue.clone(),
            table: table.clone(),
            text_callback: text_callback.clone(),
        });
        let mesh = Arc::new(Mesh::new(config.tcp_host, config.tcp_port, sink));

        Self {
            config,
            username,
            table,
            mesh,
            queue,
            text_callback,
            running: Arc::new(AtomicBool::new(false)),
            discovery: Mutex::new(None),
            pipeline: Mutex::new(None),
            main_task: Mutex::new(None),
        }
    }

    /// Register the UI callback for incoming text messages
    pub fn set_text_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        *self.text_callback.lock() = Some(Box::new(callback));
    }

    /// Start discovery, the mesh, the audio pipeline and the main loop.
    ///
    /// An unavailable audio device or an unbindable stream port fails
    /// startup; subsystems already running are rolled back.
    pub async fn start(&self) -> Result<(), NodeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Starting node for {}", self.username);

        let discovery = Discovery::start(&self.config, &self.username, self.table.clone()).await;
        *self.discovery.lock() = Some(discovery);

        if let Err(e) = self.mesh.start().await {
            self.rollback().await;
            return Err(e.into());
        }

        let pipeline_result =
            AudioPipeline::start(self.queue.clone(), self.config.audio_send_interval()).await;
        let frames = match pipeline_result {
            Ok((pipeline, frames)) => {
                *self.pipeline.lock() = Some(pipeline);
                frames
            }
            Err(e) => {
                self.rollback().await;
                return Err(e.into());
            }
        };

        let task = tokio::spawn(Self::main_loop(
            self.running.clone(),
            self.table.clone(),
            self.mesh.clone(),
            frames,
            self.config.clone(),
        ));
        *self.main_task.lock() = Some(task);

        info!("Node started");
        Ok(())
    }

    /// Broadcast a text message to every connected peer.
    /// Blank messages are a no-op.
    pub async fn send_message(&self, message: &str) -> Result<(), NetworkError> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        self.mesh
            .send_frame(Frame::text(trimmed.as_bytes().to_vec()))
            .await
    }

    /// Consistent copy of the discovered-peer table
    pub fn snapshot_peers(&self) -> Vec<PeerRecord> {
        self.table.snapshot()
    }

    /// Addresses with a live mesh connection
    pub fn connected_peers(&self) -> Vec<IpAddr> {
        self.mesh.connected_peers()
    }

    /// Stop capture and playback, then the mesh, then discovery.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping node");

        if let Some(mut pipeline) = self.pipeline.lock().take() {
            pipeline.stop();
        }
        if let Some(task) = self.main_task.lock().take() {
            task.abort();
        }
        self.mesh.stop().await;
        if let Some(discovery) = self.discovery.lock().take() {
            discovery.stop();
        }

        info!("Node stopped");
    }

    /// Undo a partial start after a failed subsystem
    async fn rollback(&self) {
        if let Some(mut pipeline) = self.pipeline.lock().take() {
            pipeline.stop();
        }
        self.mesh.stop().await;
        if let Some(discovery) = self.discovery.lock().take() {
            discovery.stop();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Forward captured frames to the mesh and periodically reconcile the
    /// peer table against the connection table.
    async fn main_loop(
        running: Arc<AtomicBool>,
        table: Arc<PeerTable>,
        mesh: Arc<Mesh>,
        mut frames: mpsc::Receiver<Vec<u8>>,
        config: Config,
    ) {
        let mut reconcile = interval(config.connection_check_interval());

        while running.load(Ordering::SeqCst) {
            tokio::select! {
                captured = frames.recv() => match captured {
                    Some(payload) => {
                        if let Err(e) = mesh.send_frame(Frame::audio(payload)).await {
                            warn!("Audio broadcast failed: {}", e);
                        }
                    }
                    None => break,
                },
                _ = reconcile.tick() => {
                    Self::connect_to_new_peers(&table, &mesh);
                }
            }
        }
        debug!("Main loop stopped");
    }

    /// Dial every discovered peer without a live connection. Each dial
    /// runs on its own task so a slow peer cannot stall the audio path.
    fn connect_to_new_peers(table: &Arc<PeerTable>, mesh: &Arc<Mesh>) {
        for record in table.snapshot() {
            if mesh.is_connected(record.addr) {
                continue;
            }
            debug!("Dialing discovered peer {} ({})", record.name, record.addr);
            let mesh = mesh.clone();
            tokio::spawn(async move {
                if let Err(e) = mesh.connect_to_peer(record.addr, record.port).await {
                    debug!("Dial to {} failed: {}", record.addr, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_node_is_stopped() {
        let node = Node::new("alice".to_string(), Config::default());
        assert!(node.snapshot_peers().is_empty());
        assert!(node.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let node = Node::new("alice".to_string(), Config::default());
        node.stop().await;
        node.stop().await;
    }

    #[tokio::test]
    async fn test_send_message_without_peers_is_ok() {
        let node = Node::new("alice".to_string(), Config::default());
        node.send_message("hello").await.expect("Send should succeed");
        node.send_message("   ").await.expect("Blank is a no-op");
    }
}
