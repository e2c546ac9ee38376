//! Message types passed between pipeline stages.

use std::time::Instant;

/// A chunk of raw audio from the microphone.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples at the configured capture rate.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Monotonic receipt order assigned by the capture callback.
    pub order: u64,
    /// Timestamp when this chunk was captured.
    pub captured_at: Instant,
}

/// One discrete utterance, bounded by silence, ready for transcription.
///
/// Ownership passes from the segmenter to the orchestrator at emission and
/// is never retained afterward.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    /// Monotonic sequence number assigned at emission.
    pub sequence: u64,
    /// Encoded audio payload (PCM16LE mono, backend-agreed rate).
    pub payload: Vec<u8>,
    /// Sample rate of the payload in Hz.
    pub sample_rate: u32,
    /// When the first voiced chunk of this utterance was captured.
    pub captured_at: Instant,
}

/// Playback completion notice for one turn's audio.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackDone {
    /// Turn sequence the finished item belonged to.
    pub sequence: u64,
    /// True when the item was cancelled (barge-in) rather than played out.
    pub cancelled: bool,
}
