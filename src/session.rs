//! Session data model and end-of-call persistence.

use crate::error::{CallError, Result};
use crate::orchestrator::turn::{Turn, TurnState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One call. Created at call start, mutated by the orchestrator as turns
/// reach terminal states, closed and flushed when the call ends.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Append-only log of terminal turns, in completion order.
    pub turns: Vec<Turn>,
}

impl Session {
    /// Start a new session for a user.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            turns: Vec::new(),
        }
    }

    /// Append a terminal turn to the log.
    ///
    /// Non-terminal turns are a programming error and are logged and
    /// dropped rather than recorded.
    pub fn append_turn(&mut self, turn: Turn) {
        if !turn.state.is_terminal() {
            warn!(
                "refusing to log non-terminal turn {} ({:?})",
                turn.sequence, turn.state
            );
            return;
        }
        info!(
            "turn {} finished: {:?}{}",
            turn.sequence,
            turn.state,
            turn.error
                .as_ref()
                .map(|(_, detail)| format!(" ({detail})"))
                .unwrap_or_default()
        );
        self.turns.push(turn);
    }

    /// Transcript lines in turn order. Includes every turn that produced
    /// user text, failed ones too; no-op (empty) transcripts are skipped.
    #[must_use]
    pub fn transcript_lines(&self) -> Vec<String> {
        self.turns
            .iter()
            .filter_map(|t| t.user_text.as_deref())
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Coach replies in turn order.
    #[must_use]
    pub fn ai_responses(&self) -> Vec<String> {
        self.turns
            .iter()
            .filter_map(|t| t.ai_text.as_deref())
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Close the session and build the persisted record.
    #[must_use]
    pub fn close(mut self) -> SessionRecord {
        self.ended_at = Some(Utc::now());
        SessionRecord {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at.unwrap_or_else(Utc::now),
            transcript: self.transcript_lines().join("\n"),
            ai_responses: self.ai_responses(),
        }
    }

    /// Whether any turn completed successfully.
    #[must_use]
    pub fn any_complete(&self) -> bool {
        self.turns.iter().any(|t| t.state == TurnState::Complete)
    }
}

/// The record persisted at call end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Accumulated user transcript, newline-joined.
    pub transcript: String,
    /// AI replies in turn order.
    pub ai_responses: Vec<String>,
}

/// Destination for closed-session records.
#[async_trait]
pub trait SessionRecorder: Send + Sync {
    /// Persist one record.
    async fn record(&self, record: &SessionRecord) -> Result<()>;
}

/// POSTs records to the configured endpoint. When no endpoint is set the
/// record is only logged, which keeps local runs working offline.
pub struct HttpSessionRecorder {
    http: reqwest::Client,
    url: String,
}

impl HttpSessionRecorder {
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SessionRecorder for HttpSessionRecorder {
    async fn record(&self, record: &SessionRecord) -> Result<()> {
        if self.url.is_empty() {
            info!(
                "session {} closed ({} turns persisted locally only)",
                record.id,
                record.ai_responses.len()
            );
            return Ok(());
        }

        self.http
            .post(&self.url)
            .json(record)
            .send()
            .await
            .map_err(|e| CallError::Network(format!("record session: {e}")))?
            .error_for_status()
            .map_err(|e| CallError::Network(format!("record session: {e}")))?;

        info!("session {} persisted", record.id);
        Ok(())
    }
}
