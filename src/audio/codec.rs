//! Opus voice codec
//!
//! Encodes one 20 ms PCM frame into an opaque compact packet and back.
//! The decoder doubles as the packet-loss concealer: decoding an empty
//! packet asks libopus to synthesize a plausible continuation of the
//! last heard audio.

use opus::{Application, Bitrate, Channels};

use super::error::AudioError;
use super::{FRAME_SAMPLES, SAMPLE_RATE};

/// Target bitrate in bits per second, tuned for speech
pub const TARGET_BITRATE: i32 = 24_000;

/// Upper bound on one encoded frame (libopus hard limit is ~1275 bytes)
const MAX_PACKET_LEN: usize = 1500;

/// Voice encoder for the capture path
pub struct VoiceEncoder {
    encoder: opus::Encoder,
    packet: Vec<u8>,
}

impl VoiceEncoder {
    pub fn new() -> Result<Self, AudioError> {
        let mut encoder = opus::Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| AudioError::CodecInit(format!("encoder init failed: {}", e)))?;
        encoder
            .set_bitrate(Bitrate::Bits(TARGET_BITRATE))
            .map_err(|e| AudioError::CodecInit(format!("set bitrate failed: {}", e)))?;

        Ok(Self {
            encoder,
            packet: vec![0u8; MAX_PACKET_LEN],
        })
    }

    /// Encode exactly one 960-sample frame
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, AudioError> {
        debug_assert_eq!(pcm.len(), FRAME_SAMPLES);
        let len = self
            .encoder
            .encode(pcm, &mut self.packet)
            .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
        Ok(self.packet[..len].to_vec())
    }
}

/// Voice decoder for the playback path
pub struct VoiceDecoder {
    decoder: opus::Decoder,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self, AudioError> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| AudioError::CodecInit(format!("decoder init failed: {}", e)))?;
        Ok(Self { decoder })
    }

    /// Decode one packet into a 960-sample frame. A packet that decodes to
    /// any other length is corrupt and rejected.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, AudioError> {
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let decoded = self
            .decoder
            .decode(packet, &mut pcm, false)
            .map_err(|e| AudioError::DecodeFailed(e.to_string()))?;
        if decoded != FRAME_SAMPLES {
            return Err(AudioError::DecodeFailed(format!(
                "short frame: {} samples",
                decoded
            )));
        }
        Ok(pcm)
    }

    /// Synthesize one concealment frame for a lost packet
    pub fn conceal(&mut self) -> Result<Vec<i16>, AudioError> {
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        self.decoder
            .decode(&[], &mut pcm, false)
            .map_err(|e| AudioError::DecodeFailed(format!("concealment failed: {}", e)))?;
        Ok(pcm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frame(freq: f32, amplitude: f32) -> Vec<i16> {
        (0..FRAME_SAMPLES)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                (amplitude * (2.0 * std::f32::consts::PI * freq * t).sin() * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_encode_compresses_voice_frame() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let frame = sine_frame(440.0, 0.5);

        let packet = encoder.encode(&frame).unwrap();
        assert!(!packet.is_empty());
        // ~24 kbit/s means a 20 ms packet stays well under the raw 1920 bytes
        assert!(packet.len() < FRAME_SAMPLES * 2 / 4);
    }

    #[test]
    fn test_decode_returns_full_frame() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let mut decoder = VoiceDecoder::new().unwrap();

        let packet = encoder.encode(&sine_frame(300.0, 0.5)).unwrap();
        let pcm = decoder.decode(&packet).unwrap();

        assert_eq!(pcm.len(), FRAME_SAMPLES);
    }

    #[test]
    fn test_roundtrip_preserves_signal_energy() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let mut decoder = VoiceDecoder::new().unwrap();

        // Let the codec converge over a few frames
        let frame = sine_frame(440.0, 0.5);
        let mut pcm = Vec::new();
        for _ in 0..5 {
            let packet = encoder.encode(&frame).unwrap();
            pcm = decoder.decode(&packet).unwrap();
        }

        let energy: f64 = pcm.iter().map(|&s| (s as f64).powi(2)).sum();
        assert!(energy > 0.0, "Decoded frame should not be silence");
    }

    #[test]
    fn test_concealment_after_decode() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let mut decoder = VoiceDecoder::new().unwrap();

        let packet = encoder.encode(&sine_frame(440.0, 0.5)).unwrap();
        decoder.decode(&packet).unwrap();

        for _ in 0..5 {
            let concealed = decoder.conceal().unwrap();
            assert_eq!(concealed.len(), FRAME_SAMPLES);
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        let mut decoder = VoiceDecoder::new().unwrap();
        assert!(decoder.decode(&[0xFF; 7]).is_err());
    }
}
