//! Audio pipeline
//!
//! Capture, voice detection, Opus coding, jitter buffering, mixing, gain
//! control and playback. All audio is 48 kHz mono 16-bit PCM; one frame
//! is 20 ms (960 samples).

mod agc;
mod codec;
mod device;
mod error;
mod jitter;
mod pipeline;
mod vad;

use std::time::Duration;

pub use agc::{AutoGain, GAIN_CEILING, GAIN_FLOOR, TARGET_LEVEL};
pub use codec::{VoiceDecoder, VoiceEncoder, TARGET_BITRATE};
pub use error::AudioError;
pub use jitter::{JitterControl, INITIAL_JITTER, MAX_JITTER, MIN_JITTER};
pub use pipeline::{AudioPipeline, PlaybackQueue, PLAYBACK_QUEUE_SIZE};
pub use vad::{VoiceDetector, DEFAULT_HOLD_FRAMES, DEFAULT_THRESHOLD};

/// Sample rate used throughout the pipeline
pub const SAMPLE_RATE: u32 = 48_000;

/// Mono capture and playback
pub const CHANNELS: u16 = 1;

/// Samples per frame: 20 ms at 48 kHz
pub const FRAME_SAMPLES: usize = 960;

/// Wall-clock length of one frame
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
