//! Microphone audio capture using cpal.
//!
//! The capture engine owns the physical input device exclusively for one
//! call. The cpal stream lives on a dedicated thread (streams are not Send)
//! and feeds chunks to the pipeline over a bounded channel.

use crate::config::AudioConfig;
use crate::error::{CallError, Result};
use crate::messages::AudioChunk;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Chunk channel depth. The callback drops chunks rather than block.
const CHUNK_CHANNEL_SIZE: usize = 64;

/// Audio capture from the system microphone via cpal.
///
/// `start()` acquires the device and begins producing [`AudioChunk`]s until
/// `stop()` is called. Overlapping starts are rejected; the device is
/// released on every exit path, including a failed start.
pub struct AudioCaptureEngine {
    config: AudioConfig,
    recording: Arc<AtomicBool>,
    /// Dropping this ends the capture thread and releases the device.
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioCaptureEngine {
    /// Create an engine for the configured input device.
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
            recording: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            thread: None,
        }
    }

    /// Whether a capture is currently running.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Acquire the input device and start producing chunks.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::AlreadyRecording`] if a capture is already
    /// running, and [`CallError::Permission`] if the device cannot be
    /// acquired. On failure no device handle is held and `is_recording()`
    /// stays false.
    pub fn start(&mut self) -> Result<mpsc::Receiver<AudioChunk>> {
        if self.recording.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyRecording);
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_SIZE);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let config = self.config.clone();
        let recording = Arc::clone(&self.recording);

        let thread = std::thread::Builder::new()
            .name("voxcoach-capture".into())
            .spawn(move || {
                capture_thread(&config, &chunk_tx, &stop_rx, &ready_tx);
                recording.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.recording.store(false, Ordering::SeqCst);
                CallError::Audio(format!("failed to spawn capture thread: {e}"))
            })?;

        // Wait for the stream to come up (or fail) before reporting success.
        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(thread);
                info!("audio capture started");
                Ok(chunk_rx)
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                self.recording.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                self.recording.store(false, Ordering::SeqCst);
                Err(CallError::Audio("capture thread exited during start".into()))
            }
        }
    }

    /// Stop capturing and release the device. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            drop(tx);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.recording.store(false, Ordering::SeqCst);
        info!("audio capture stopped");
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| CallError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl Drop for AudioCaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build and run the cpal stream, holding it until the stop sender drops.
fn capture_thread(
    config: &AudioConfig,
    chunk_tx: &mpsc::Sender<AudioChunk>,
    stop_rx: &std::sync::mpsc::Receiver<()>,
    ready_tx: &std::sync::mpsc::Sender<Result<()>>,
) {
    let stream = match build_input_stream(config, chunk_tx.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CallError::Audio(format!(
            "failed to start input stream: {e}"
        ))));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Hold the stream alive until stop() drops the sender.
    let _ = stop_rx.recv();
    drop(stream);
}

fn build_input_stream(
    config: &AudioConfig,
    chunk_tx: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.input_device {
        host.input_devices()
            .map_err(|e| CallError::Permission(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| CallError::Permission(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| CallError::Permission("no input device available".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_name}");

    // Use the device's default config for best compatibility, then convert
    // to mono at the target rate in software.
    let default_config = device
        .default_input_config()
        .map_err(|e| CallError::Permission(format!("cannot open input device: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let target_rate = config.capture_sample_rate;

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    if native_rate != target_rate {
        info!("will downsample from {native_rate}Hz to {target_rate}Hz");
    }

    let order = Arc::new(AtomicU64::new(0));

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };

                let samples = if native_rate != target_rate {
                    downsample(&mono, native_rate, target_rate)
                } else {
                    mono
                };

                let chunk = AudioChunk {
                    samples,
                    sample_rate: target_rate,
                    order: order.fetch_add(1, Ordering::Relaxed),
                    captured_at: Instant::now(),
                };
                // try_send so the audio callback never blocks.
                if chunk_tx.try_send(chunk).is_err() {
                    debug!("audio channel full, dropping chunk");
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| CallError::Audio(format!("failed to build input stream: {e}")))?;

    Ok(stream)
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation downsampler.
///
/// Sufficient for speech (energy below 8kHz); no anti-alias filter needed
/// for 48kHz → 16kHz.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };

        output.push(sample as f32);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_mono_averages_channels() {
        let stereo = [0.2, 0.4, -0.6, -0.2];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] + 0.4).abs() < 1e-6);
    }

    #[test]
    fn downsample_halves_length() {
        let samples: Vec<f32> = (0..480).map(|i| (i as f32 / 480.0).sin()).collect();
        let out = downsample(&samples, 48_000, 16_000);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn downsample_same_rate_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(downsample(&samples, 16_000, 16_000), samples);
    }
}
