//! Silence-based utterance segmentation.
//!
//! Converts the continuous chunk stream into discrete [`AudioSegment`]s.
//! A chunk with audible energy resets the silence deadline and appends to
//! the accumulation buffer; once `silence_threshold_ms` passes with no
//! voiced chunk the buffer is flushed as one segment. A hard cap
//! (`max_utterance_ms`) forces a flush during continuous speech so turn
//! latency stays bounded.
//!
//! Policy: `stop()` mid-buffer discards the partial utterance rather than
//! emitting it, matching the at-rest behavior of the capture source.

use crate::audio::pcm16_from_f32;
use crate::config::SegmenterConfig;
use crate::error::Result;
use crate::messages::{AudioChunk, AudioSegment};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Synchronous segmentation core, driven by [`run_segmenter`].
pub struct SilenceSegmenter {
    config: SegmenterConfig,
    /// Accumulated samples for the current utterance.
    buffer: Vec<f32>,
    /// When the first voiced chunk of the current utterance arrived.
    utterance_start: Option<Instant>,
    /// Deadline after which the buffer is flushed as a segment.
    silence_deadline: Option<Instant>,
    /// Next segment sequence number, assigned at emission.
    next_sequence: u64,
    sample_rate: u32,
}

impl SilenceSegmenter {
    /// Create a segmenter for the given chunk sample rate.
    #[must_use]
    pub fn new(config: &SegmenterConfig, sample_rate: u32) -> Self {
        info!(
            "segmenter initialized: silence={}ms, hard cap={}ms, energy threshold={}",
            config.silence_threshold_ms, config.max_utterance_ms, config.energy_threshold
        );
        Self {
            config: config.clone(),
            buffer: Vec::new(),
            utterance_start: None,
            silence_deadline: None,
            next_sequence: 0,
            sample_rate,
        }
    }

    /// Feed one chunk. Returns a segment when the hard cap forces a flush.
    pub fn push_chunk(&mut self, chunk: &AudioChunk, now: Instant) -> Option<AudioSegment> {
        let voiced = !chunk.samples.is_empty()
            && rms_energy(&chunk.samples) >= self.config.energy_threshold;
        if !voiced {
            return None;
        }

        if self.buffer.is_empty() {
            self.utterance_start = Some(chunk.captured_at);
        }
        self.buffer.extend_from_slice(&chunk.samples);
        self.silence_deadline =
            Some(now + Duration::from_millis(self.config.silence_threshold_ms));

        let max_samples =
            (self.config.max_utterance_ms as usize * self.sample_rate as usize) / 1000;
        if self.buffer.len() >= max_samples {
            debug!("utterance hard cap reached, forcing flush");
            return self.flush(now);
        }
        None
    }

    /// Deadline for the next silence flush, if an utterance is buffered.
    #[must_use]
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    /// Flush the buffered utterance as one segment.
    ///
    /// A flush with an empty buffer is a no-op; zero-length segments are
    /// never emitted.
    pub fn flush(&mut self, now: Instant) -> Option<AudioSegment> {
        self.silence_deadline = None;
        if self.buffer.is_empty() {
            return None;
        }

        let samples = std::mem::take(&mut self.buffer);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        debug!(
            "emitting segment {sequence}: {:.1}s of audio",
            samples.len() as f32 / self.sample_rate as f32
        );

        Some(AudioSegment {
            sequence,
            payload: pcm16_from_f32(&samples),
            sample_rate: self.sample_rate,
            captured_at: self.utterance_start.take().unwrap_or(now),
        })
    }

    /// Discard any buffered partial utterance without emitting.
    pub fn discard(&mut self) {
        if !self.buffer.is_empty() {
            debug!("discarding partial utterance ({} samples)", self.buffer.len());
        }
        self.buffer.clear();
        self.utterance_start = None;
        self.silence_deadline = None;
    }
}

/// Compute RMS energy of audio samples.
fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Drive a segmenter from the capture channel until cancelled.
///
/// Emitted segments are forwarded to `segment_tx` in order. Cancellation
/// discards any partial buffer.
///
/// # Errors
///
/// Returns an error if the segment channel closes while a segment is
/// pending delivery.
pub async fn run_segmenter(
    mut segmenter: SilenceSegmenter,
    mut chunk_rx: mpsc::Receiver<AudioChunk>,
    segment_tx: mpsc::Sender<AudioSegment>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let deadline = segmenter.silence_deadline();

        let emitted = tokio::select! {
            () = cancel.cancelled() => {
                segmenter.discard();
                return Ok(());
            }
            chunk = chunk_rx.recv() => {
                match chunk {
                    Some(chunk) => segmenter.push_chunk(&chunk, Instant::now()),
                    None => {
                        // Capture stopped: mirror stop() policy, discard.
                        segmenter.discard();
                        return Ok(());
                    }
                }
            }
            () = sleep_until_deadline(deadline), if deadline.is_some() => {
                segmenter.flush(Instant::now())
            }
        };

        if let Some(segment) = emitted {
            segment_tx
                .send(segment)
                .await
                .map_err(|e| crate::error::CallError::Channel(format!("segment channel closed: {e}")))?;
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
