//! Audio device access
//!
//! Opens the default capture and playback devices at 48 kHz mono 16-bit
//! PCM and bridges their callback-driven streams to the pipeline threads
//! with lock-free rings. The rings absorb scheduling slack: capture
//! overruns drop samples instead of raising, playback underruns emit
//! silence.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{info, warn};

use super::error::AudioError;
use super::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};

/// Ring capacity in frames on each side of the device boundary
const RING_FRAMES: usize = 16;

fn stream_config() -> StreamConfig {
    StreamConfig {
        channels: CHANNELS,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Microphone stream feeding a sample ring
pub struct CaptureStream {
    _stream: Stream,
    samples: HeapCons<i16>,
}

impl CaptureStream {
    /// Open the default input device. Failure here is fatal for the node.
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        info!(
            "Opening capture device: {}",
            device.name().unwrap_or_default()
        );

        let rb = HeapRb::<i16>::new(FRAME_SAMPLES * RING_FRAMES);
        let (mut producer, consumer) = rb.split();

        let err_fn = |err| warn!("Capture stream error: {}", err);
        let stream = device
            .build_input_stream(
                &stream_config(),
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    // A full ring means the reader fell behind; dropped
                    // samples are the tolerated overflow policy.
                    for &sample in data {
                        let _ = producer.try_push(sample);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            samples: consumer,
        })
    }

    /// Pop exactly one 960-sample frame if one has accumulated.
    /// Never returns a partial frame.
    pub fn read_frame(&mut self, out: &mut [i16; FRAME_SAMPLES]) -> bool {
        if self.samples.occupied_len() < FRAME_SAMPLES {
            return false;
        }
        for slot in out.iter_mut() {
            *slot = self.samples.try_pop().unwrap_or(0);
        }
        true
    }
}

/// Speaker stream drained from a sample ring
pub struct PlaybackStream {
    _stream: Stream,
    samples: HeapProd<i16>,
}

impl PlaybackStream {
    /// Open the default output device. Failure here is fatal for the node.
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        info!(
            "Opening playback device: {}",
            device.name().unwrap_or_default()
        );

        let rb = HeapRb::<i16>::new(FRAME_SAMPLES * RING_FRAMES);
        let (producer, mut consumer) = rb.split();

        let err_fn = |err| warn!("Playback stream error: {}", err);
        let stream = device
            .build_output_stream(
                &stream_config(),
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = consumer.try_pop().unwrap_or(0);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            samples: producer,
        })
    }

    /// Queue one frame for the device, waiting while the ring is full so
    /// the device clock paces the playback loop. Blocks at most about one
    /// frame length.
    pub fn write_frame(&mut self, pcm: &[i16]) {
        for &sample in pcm {
            let mut pending = sample;
            loop {
                match self.samples.try_push(pending) {
                    Ok(()) => break,
                    Err(rejected) => {
                        pending = rejected;
                        std::thread::sleep(std::time::Duration::from_millis(2));
                    }
                }
            }
        }
    }
}
