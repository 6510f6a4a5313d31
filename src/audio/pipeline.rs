//! Real-time audio pipeline
//!
//! Capture side: device frames → voice gate → Opus → bounded channel to
//! the session's send tick. Playback side: one queue of encoded frames
//! per node, drained by a dedicated loop that decodes and sums everything
//! due this tick (so concurrent speakers are heard together, not
//! alternated), conceals losses, applies gain control and writes to the
//! device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::agc::AutoGain;
use super::codec::{VoiceDecoder, VoiceEncoder};
use super::device::{CaptureStream, PlaybackStream};
use super::error::AudioError;
use super::jitter::JitterControl;
use super::vad::VoiceDetector;
use super::{FRAME_DURATION, FRAME_SAMPLES};

/// Capacity of the playback queue, in encoded frames
pub const PLAYBACK_QUEUE_SIZE: usize = 50;

/// Frames discarded when the queue overflows, to bound latency
const OVERFLOW_DROP: usize = 5;

/// Outage length after which concealment takes over from rebuffering
const CONCEAL_AFTER: Duration = Duration::from_millis(100);

/// Bounded FIFO of encoded frames between the mesh and the playback loop.
///
/// Producers are the per-connection receive tasks; the only consumer is
/// the playback loop.
pub struct PlaybackQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    overruns: AtomicU64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            overruns: AtomicU64::new(0),
        }
    }

    /// Enqueue one frame. On overflow the five oldest frames are dropped
    /// first so latency stays bounded.
    pub fn push(&self, frame: Vec<u8>) {
        let mut frames = self.frames.lock();
        if frames.len() >= PLAYBACK_QUEUE_SIZE {
            frames.drain(..OVERFLOW_DROP);
            self.overruns.fetch_add(1, Ordering::Relaxed);
            warn!("Playback queue full, dropped {} oldest frames", OVERFLOW_DROP);
        }
        frames.push_back(frame);
        drop(frames);
        self.ready.notify_one();
    }

    /// Wait up to `wait` for the first frame, then take up to `max` more
    /// without waiting further.
    pub fn drain(&self, max: usize, wait: Duration) -> Vec<Vec<u8>> {
        let mut frames = self.frames.lock();
        if frames.is_empty() {
            self.ready.wait_for(&mut frames, wait);
        }
        let take = frames.len().min(max.max(1));
        frames.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// How many times the overflow policy has fired
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum decoded frames sample-wise, saturating to the 16-bit range
pub(crate) fn mix_frames(frames: &[Vec<i16>]) -> Vec<i16> {
    let mut acc = vec![0i32; FRAME_SAMPLES];
    for frame in frames {
        for (slot, &sample) in acc.iter_mut().zip(frame.iter()) {
            *slot += sample as i32;
        }
    }
    acc.into_iter()
        .map(|v| v.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackState {
    /// Accumulating frames until the queue reaches the jitter target
    Filling,
    /// Draining, mixing and playing one output frame per tick
    Playing,
}

/// Capture and playback threads plus their shared running flag
pub struct AudioPipeline {
    running: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    playback: Option<JoinHandle<()>>,
}

impl AudioPipeline {
    /// Open both devices and start the capture and playback threads.
    ///
    /// cpal streams are not `Send`, so each thread opens its own device
    /// and reports the result back; an unavailable device fails startup.
    /// Returns the receiver carrying encoded capture frames.
    pub async fn start(
        queue: Arc<PlaybackQueue>,
        idle_wait: Duration,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>), AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let (frames_tx, frames_rx) = mpsc::channel(32);

        let (capture_ready, capture_started) = oneshot::channel();
        let capture_running = running.clone();
        let capture = std::thread::spawn(move || {
            capture_loop(frames_tx, capture_running, capture_ready, idle_wait)
        });

        let (playback_ready, playback_started) = oneshot::channel();
        let playback_running = running.clone();
        let playback =
            std::thread::spawn(move || playback_loop(queue, playback_running, playback_ready));

        let mut pipeline = Self {
            running,
            capture: Some(capture),
            playback: Some(playback),
        };

        for started in [capture_started, playback_started] {
            match started.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    pipeline.stop();
                    return Err(e);
                }
                Err(_) => {
                    pipeline.stop();
                    return Err(AudioError::StreamError(
                        "audio thread exited during startup".to_string(),
                    ));
                }
            }
        }

        Ok((pipeline, frames_rx))
    }

    /// Stop both threads. Calling it again is a no-op.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.capture.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.playback.take() {
            let _ = handle.join();
        }
        info!("Audio pipeline stopped");
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    frames: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), AudioError>>,
    idle_wait: Duration,
) {
    let mut capture = match CaptureStream::open() {
        Ok(capture) => capture,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut encoder = match VoiceEncoder::new() {
        Ok(encoder) => encoder,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut vad = VoiceDetector::new();
    let mut frame = [0i16; FRAME_SAMPLES];

    info!("Capture loop started");
    while running.load(Ordering::SeqCst) {
        if !capture.read_frame(&mut frame) {
            // No complete frame yet; complete frames drain back-to-back so
            // a long wait never accumulates backlog.
            std::thread::sleep(idle_wait.min(FRAME_DURATION));
            continue;
        }

        if !vad.is_voice(&frame) {
            continue;
        }

        match encoder.encode(&frame) {
            // try_send: a congested session loop must never stall capture
            Ok(packet) => {
                if frames.try_send(packet).is_err() {
                    trace!("Send channel full, dropping capture frame");
                }
            }
            Err(e) => warn!("Encode failed: {}", e),
        }
    }
    info!("Capture loop stopped");
}

fn playback_loop(
    queue: Arc<PlaybackQueue>,
    running: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), AudioError>>,
) {
    let mut playback = match PlaybackStream::open() {
        Ok(playback) => playback,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut decoder = match VoiceDecoder::new() {
        Ok(decoder) => decoder,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut jitter = JitterControl::new();
    let mut agc = AutoGain::new();
    let mut state = PlaybackState::Filling;
    let mut started = false;
    let mut last_received = Instant::now();
    let mut underruns: u64 = 0;

    info!("Playback loop started");
    while running.load(Ordering::SeqCst) {
        match state {
            PlaybackState::Filling => {
                if queue.len() >= jitter.target() as usize {
                    debug!("Jitter buffer filled to {} frames, playing", jitter.target());
                    state = PlaybackState::Playing;
                    started = true;
                } else if started && last_received.elapsed() > CONCEAL_AFTER {
                    // Nothing is arriving; concealment covers the outage
                    state = PlaybackState::Playing;
                } else {
                    std::thread::sleep(FRAME_DURATION);
                }
            }
            PlaybackState::Playing => {
                jitter.observe(queue.len());

                let batch = queue.drain(jitter.target() as usize, FRAME_DURATION);
                if batch.is_empty() {
                    if last_received.elapsed() > CONCEAL_AFTER {
                        match decoder.conceal() {
                            Ok(mut pcm) => {
                                trace!("Concealing lost frame");
                                agc.process(&mut pcm);
                                playback.write_frame(&pcm);
                            }
                            Err(e) => warn!("Concealment failed: {}", e),
                        }
                    } else {
                        underruns += 1;
                        debug!("Playback queue dry (underrun #{}), rebuffering", underruns);
                        state = PlaybackState::Filling;
                    }
                    continue;
                }

                last_received = Instant::now();

                let mut decoded = Vec::with_capacity(batch.len());
                for packet in &batch {
                    match decoder.decode(packet) {
                        Ok(pcm) => decoded.push(pcm),
                        Err(e) => debug!("Dropping undecodable frame: {}", e),
                    }
                }
                if decoded.is_empty() {
                    continue;
                }
                if decoded.len() > 1 {
                    trace!("Mixed {} concurrent frames", decoded.len());
                }

                let mut pcm = mix_frames(&decoded);
                agc.process(&mut pcm);
                playback.write_frame(&pcm);
            }
        }
    }
    info!("Playback loop stopped");
}
