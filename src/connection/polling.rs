//! Polling fallback channel over plain HTTP.
//!
//! Used when the streaming socket is unavailable. The client periodically
//! requests status instead of receiving push messages:
//!
//! - `POST /transcript` — stores the utterance text server-side
//! - `GET /status` — `{ status: "pending" | "done", aiResponse? }`
//! - `POST /stop` — ends the turn-processing loop, carrying the
//!   accumulated transcript and AI responses
//!
//! Completion is judged on `status == "done"` exclusively; `aiResponse`
//! is read only once done.

use crate::connection::messages::WireMessage;
use crate::connection::{ChannelEvent, ConnectionChannel, ConnectionMode};
use crate::error::{CallError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Pull-based channel: fixed-interval status polling.
pub struct PollingChannel {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

/// Body of `POST /transcript`.
#[derive(Debug, Serialize)]
struct TranscriptBody<'a> {
    transcript: &'a str,
}

/// Response of `GET /status`.
#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(rename = "aiResponse")]
    ai_response: Option<String>,
}

/// Body of `POST /stop`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopBody {
    /// Accumulated user transcript, newline-joined.
    pub transcript: String,
    /// AI replies in turn order.
    pub ai_responses: Vec<String>,
}

impl PollingChannel {
    /// Probe the backend and open a polling channel.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Network`] if the status endpoint is not
    /// reachable.
    pub async fn connect(
        http: reqwest::Client,
        base_url: &str,
        poll_interval: Duration,
    ) -> Result<Self> {
        let channel = Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            poll_interval,
        };
        // One probe request up front so connect() fails fast when the
        // fallback is as unreachable as the socket was.
        channel.fetch_status().await?;
        debug!("polling channel connected: {}", channel.base_url);
        Ok(channel)
    }

    async fn fetch_status(&self) -> Result<StatusResponse> {
        let response = self
            .http
            .get(format!("{}/status", self.base_url))
            .send()
            .await
            .map_err(|e| CallError::Network(format!("status poll: {e}")))?
            .error_for_status()
            .map_err(|e| CallError::Network(format!("status poll: {e}")))?;

        response
            .json::<StatusResponse>()
            .await
            .map_err(|e| CallError::MalformedMessage(format!("status body: {e}")))
    }

}

/// End the server-side turn loop, persisting the accumulated call text.
///
/// # Errors
///
/// Returns [`CallError::Network`] if the request fails.
pub async fn post_stop(http: &reqwest::Client, base_url: &str, body: &StopBody) -> Result<()> {
    http.post(format!("{}/stop", base_url.trim_end_matches('/')))
        .json(body)
        .send()
        .await
        .map_err(|e| CallError::Network(format!("stop: {e}")))?
        .error_for_status()
        .map_err(|e| CallError::Network(format!("stop: {e}")))?;
    Ok(())
}

#[async_trait]
impl ConnectionChannel for PollingChannel {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Polling
    }

    async fn deliver(&mut self, msg: &WireMessage) -> Result<()> {
        match msg {
            WireMessage::Transcript { text, .. } => {
                self.http
                    .post(format!("{}/transcript", self.base_url))
                    .json(&TranscriptBody { transcript: text })
                    .send()
                    .await
                    .map_err(|e| CallError::Network(format!("post transcript: {e}")))?
                    .error_for_status()
                    .map_err(|e| CallError::Network(format!("post transcript: {e}")))?;
                Ok(())
            }
            WireMessage::Interrupt => {
                // No polling-mode transport for barge-in; the current poll
                // cycle simply runs out.
                debug!("interrupt has no polling transport, ignored");
                Ok(())
            }
            WireMessage::AudioData { .. } | WireMessage::Error { .. } => Err(CallError::Channel(
                "message type has no polling transport".into(),
            )),
        }
    }

    async fn next_event(&mut self) -> Result<Option<ChannelEvent>> {
        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.fetch_status().await {
                Ok(status) if status.status == "done" => {
                    let text = status.ai_response.unwrap_or_default();
                    return Ok(Some(ChannelEvent::ReplyReady(text)));
                }
                Ok(_) => {
                    // Still pending; keep polling.
                }
                Err(CallError::MalformedMessage(e)) => {
                    // Unparseable status bodies are dropped like any other
                    // malformed message; the channel stays open.
                    warn!("dropping malformed status response: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn close(&mut self) {}
}
