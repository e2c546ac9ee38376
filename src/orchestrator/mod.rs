//! Turn orchestration: the single serialization point of a call.
//!
//! Consumes utterance segments in order and drives each through
//! transcription → coach reply → synthesis → playback. At most one turn is
//! non-terminal at any time; segments arriving meanwhile queue FIFO and are
//! never dropped. A failed turn never blocks the pipeline. A segment
//! arriving while a turn is `Playing` is a barge-in: that turn's playback
//! is cancelled (`Cancelled`, not `Failed`) and the new segment is promoted
//! to the queue head.

pub mod turn;

use crate::audio::playback::PlaybackQueue;
use crate::error::CallError;
use crate::messages::{AudioSegment, PlaybackDone};
use crate::services::VoiceServices;
use crate::session::Session;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use self::turn::{Turn, TurnState};

/// Per-session turn orchestrator. Owns the turn queue and the session's
/// turn log; nothing else mutates either.
pub struct TurnOrchestrator {
    services: Arc<dyn VoiceServices>,
    playback: PlaybackQueue,
    session: Session,
    /// Segments promoted ahead of the inbound channel (barge-in head).
    pending: VecDeque<AudioSegment>,
    /// Barge-in notifications (cancelled turn sequence), e.g. to forward an
    /// `interrupt` message upstream.
    interrupt_tx: Option<mpsc::Sender<u64>>,
    /// Set when the segment source has closed.
    segments_closed: bool,
}

impl TurnOrchestrator {
    /// Create an orchestrator bound to a session.
    #[must_use]
    pub fn new(services: Arc<dyn VoiceServices>, playback: PlaybackQueue, session: Session) -> Self {
        Self {
            services,
            playback,
            session,
            pending: VecDeque::new(),
            interrupt_tx: None,
            segments_closed: false,
        }
    }

    /// Notify this sender with the cancelled sequence on each barge-in.
    #[must_use]
    pub fn with_interrupt_notifier(mut self, tx: mpsc::Sender<u64>) -> Self {
        self.interrupt_tx = Some(tx);
        self
    }

    /// Run the turn loop until the call is stopped or the segment source
    /// closes. Returns the session with its completed turn log.
    pub async fn run(
        mut self,
        mut segment_rx: mpsc::Receiver<AudioSegment>,
        mut done_rx: mpsc::Receiver<PlaybackDone>,
        cancel: CancellationToken,
    ) -> Session {
        loop {
            let segment = match self.next_segment(&mut segment_rx, &cancel).await {
                Some(segment) => segment,
                None => break,
            };

            match self
                .process_turn(segment, &mut segment_rx, &mut done_rx, &cancel)
                .await
            {
                Some(finished) => self.session.append_turn(finished),
                // Call stopped mid-turn: the unfinished turn is dropped,
                // never logged in a non-terminal state.
                None => break,
            }
        }

        self.session
    }

    /// Head of the processing queue: promoted segments first, then the
    /// inbound channel in FIFO order.
    async fn next_segment(
        &mut self,
        segment_rx: &mut mpsc::Receiver<AudioSegment>,
        cancel: &CancellationToken,
    ) -> Option<AudioSegment> {
        if let Some(segment) = self.pending.pop_front() {
            return Some(segment);
        }
        if self.segments_closed {
            return None;
        }
        tokio::select! {
            () = cancel.cancelled() => None,
            segment = segment_rx.recv() => segment,
        }
    }

    /// Drive one turn from `Queued` to a terminal state. Returns `None`
    /// only when the call was stopped mid-processing.
    async fn process_turn(
        &mut self,
        segment: AudioSegment,
        segment_rx: &mut mpsc::Receiver<AudioSegment>,
        done_rx: &mut mpsc::Receiver<PlaybackDone>,
        cancel: &CancellationToken,
    ) -> Option<Turn> {
        let started = Instant::now();
        let mut turn = Turn::new(segment.sequence);

        turn.state = TurnState::Transcribing;
        let text = match with_cancel(cancel, self.services.transcribe(&segment)).await? {
            Ok(text) => text,
            Err(e) => return Some(finish(turn, &e, started)),
        };

        // Silence transcribed to nothing is a no-op turn; the coach is
        // never invoked on it.
        if text.trim().is_empty() {
            debug!("turn {}: empty transcript, skipping coach call", turn.sequence);
            turn.user_text = Some(String::new());
            turn.state = TurnState::Complete;
            turn.processing_ms = Some(elapsed_ms(started));
            return Some(turn);
        }

        info!("turn {}: \"{text}\"", turn.sequence);
        turn.user_text = Some(text.clone());

        turn.state = TurnState::AwaitingReply;
        let reply = match with_cancel(cancel, self.services.reply(&text)).await? {
            Ok(reply) => reply,
            Err(e) => return Some(finish(turn, &e, started)),
        };
        turn.ai_text = Some(reply.clone());

        turn.state = TurnState::Synthesizing;
        let audio = match with_cancel(cancel, self.services.synthesize(&reply)).await? {
            Ok(audio) => audio,
            Err(e) => return Some(finish(turn, &e, started)),
        };
        turn.audio_reply = Some(audio.clone());

        turn.state = TurnState::Playing;
        if let Err(e) = self.playback.enqueue(turn.sequence, audio).await {
            return Some(finish(turn, &e, started));
        }

        self.await_playback(&mut turn, segment_rx, done_rx, cancel).await;
        turn.processing_ms = Some(elapsed_ms(started));
        Some(turn)
    }

    /// Wait for this turn's playback to finish, watching for barge-in.
    async fn await_playback(
        &mut self,
        turn: &mut Turn,
        segment_rx: &mut mpsc::Receiver<AudioSegment>,
        done_rx: &mut mpsc::Receiver<PlaybackDone>,
        cancel: &CancellationToken,
    ) {
        // Segments already buffered arrived before playback started; they
        // queue in order rather than counting as barge-in.
        while let Ok(queued) = segment_rx.try_recv() {
            self.pending.push_back(queued);
        }

        let mut barged_in = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    // Call stopped while the reply was playing; stop the
                    // audio and record the turn as cancelled.
                    let _ = self.playback.cancel(turn.sequence).await;
                    turn.state = TurnState::Cancelled;
                    return;
                }
                done = done_rx.recv() => match done {
                    Some(done) if done.sequence == turn.sequence => {
                        turn.state = if done.cancelled {
                            TurnState::Cancelled
                        } else {
                            TurnState::Complete
                        };
                        return;
                    }
                    Some(done) => {
                        debug!("stale playback notice for turn {}", done.sequence);
                    }
                    None => {
                        turn.fail(&CallError::Channel("playback events closed".into()));
                        return;
                    }
                },
                segment = segment_rx.recv(), if !self.segments_closed => match segment {
                    Some(segment) => {
                        if barged_in {
                            // Later arrivals keep their utterance order
                            // behind the barge-in head.
                            self.pending.push_back(segment);
                            continue;
                        }
                        barged_in = true;
                        info!(
                            "barge-in: cancelling playback of turn {} for segment {}",
                            turn.sequence, segment.sequence
                        );
                        if let Err(e) = self.playback.cancel(turn.sequence).await {
                            warn!("playback cancel failed: {e}");
                        }
                        if let Some(tx) = &self.interrupt_tx {
                            let _ = tx.try_send(turn.sequence);
                        }
                        self.pending.push_front(segment);
                        // Keep looping: the cancelled completion notice
                        // arrives on done_rx and settles the state.
                    }
                    None => self.segments_closed = true,
                }
            }
        }
    }
}

/// Await a pipeline stage unless the call is stopped first.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        () = cancel.cancelled() => None,
        value = fut => Some(value),
    }
}

fn finish(mut turn: Turn, error: &CallError, started: Instant) -> Turn {
    warn!("turn {} failed while {:?}: {error}", turn.sequence, turn.state);
    turn.fail(error);
    turn.processing_ms = Some(elapsed_ms(started));
    turn
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
