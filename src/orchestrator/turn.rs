//! Turn data model and per-turn state machine.

use crate::error::{CallError, ErrorKind};

/// Lifecycle of one conversational exchange.
///
/// `Queued → Transcribing → AwaitingReply → Synthesizing → Playing →
/// Complete`, with `Failed` reachable from any non-terminal state and
/// `Cancelled` reachable from `Playing` only (barge-in).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Queued,
    Transcribing,
    AwaitingReply,
    Synthesizing,
    Playing,
    Complete,
    Cancelled,
    Failed,
}

impl TurnState {
    /// Terminal states are immutable once reached.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }
}

/// One question/answer exchange, mutated only by the orchestrator.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Matches the sequence of the utterance segment that created it.
    pub sequence: u64,
    /// Current state machine position.
    pub state: TurnState,
    /// Transcribed user text, once transcription succeeded.
    pub user_text: Option<String>,
    /// Coach reply text, once the AI call succeeded.
    pub ai_text: Option<String>,
    /// Synthesized reply audio, once synthesis succeeded.
    pub audio_reply: Option<Vec<u8>>,
    /// Error classification and detail for failed turns.
    pub error: Option<(ErrorKind, String)>,
    /// Wall-clock time from dequeue to terminal state, in ms.
    pub processing_ms: Option<u64>,
}

impl Turn {
    /// Create a queued turn for a segment.
    #[must_use]
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            state: TurnState::Queued,
            user_text: None,
            ai_text: None,
            audio_reply: None,
            error: None,
            processing_ms: None,
        }
    }

    /// Record a failure: the state becomes `Failed` and the error kind is
    /// carried on the turn.
    pub fn fail(&mut self, error: &CallError) {
        debug_assert!(!self.state.is_terminal());
        self.state = TurnState::Failed;
        self.error = Some((error.kind(), error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TurnState::Complete.is_terminal());
        assert!(TurnState::Cancelled.is_terminal());
        assert!(TurnState::Failed.is_terminal());
        assert!(!TurnState::Playing.is_terminal());
        assert!(!TurnState::Queued.is_terminal());
    }

    #[test]
    fn fail_records_kind_and_detail() {
        let mut turn = Turn::new(3);
        turn.state = TurnState::Synthesizing;
        turn.fail(&CallError::UpstreamService {
            service: "tts",
            message: "quota exceeded".into(),
        });
        assert_eq!(turn.state, TurnState::Failed);
        let (kind, detail) = turn.error.as_ref().expect("error recorded");
        assert_eq!(*kind, ErrorKind::UpstreamService);
        assert!(detail.contains("quota exceeded"));
    }
}
