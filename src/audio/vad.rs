//! Voice activity detection
//!
//! An energy gate over raw PCM frames. Frames below the RMS threshold are
//! classified as silence and never reach the encoder; a hold window keeps
//! the gate open briefly after speech so word tails are not clipped.

/// RMS level (full scale 1.0) above which a frame counts as speech
pub const DEFAULT_THRESHOLD: f32 = 0.015;

/// Frames the gate stays open after the level drops (~240 ms)
pub const DEFAULT_HOLD_FRAMES: u32 = 12;

/// Per-frame speech/silence classifier
pub struct VoiceDetector {
    threshold: f32,
    hold_frames: u32,
    quiet_run: u32,
    open: bool,
}

impl VoiceDetector {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_THRESHOLD, DEFAULT_HOLD_FRAMES)
    }

    pub fn with_config(threshold: f32, hold_frames: u32) -> Self {
        Self {
            threshold,
            hold_frames,
            quiet_run: 0,
            open: false,
        }
    }

    /// Classify one frame. True means the frame should be sent.
    pub fn is_voice(&mut self, pcm: &[i16]) -> bool {
        if rms(pcm) >= self.threshold {
            self.open = true;
            self.quiet_run = 0;
            return true;
        }

        if self.open {
            self.quiet_run += 1;
            if self.quiet_run > self.hold_frames {
                self.open = false;
            }
        }
        self.open
    }
}

impl Default for VoiceDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Root-mean-square level of a PCM frame, normalized to [0, 1]
pub(crate) fn rms(pcm: &[i16]) -> f32 {
    if pcm.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm
        .iter()
        .map(|&s| {
            let x = s as f64 / 32768.0;
            x * x
        })
        .sum();
    (sum / pcm.len() as f64).sqrt() as f32
}
