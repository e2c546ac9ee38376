//! External speech and coaching services, consumed as black boxes.
//!
//! The orchestrator only sees [`VoiceServices`]; the production
//! implementation routes each stage over the right transport for the
//! current connection mode and never leaks that choice upward.

use crate::config::ServicesConfig;
use crate::connection::messages::WireMessage;
use crate::connection::{ChannelEvent, ConnectionManager, ConnectionMode};
use crate::error::{CallError, Result};
use crate::messages::AudioSegment;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// The three per-turn external calls.
#[async_trait]
pub trait VoiceServices: Send + Sync {
    /// Transcribe one utterance to text.
    async fn transcribe(&self, segment: &AudioSegment) -> Result<String>;

    /// Produce the coach's reply to the user's words.
    async fn reply(&self, user_text: &str) -> Result<String>;

    /// Synthesize reply text to audio (PCM16LE mono at the playback rate).
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Production services: HTTP endpoints plus the connection channel.
///
/// Routing per mode:
/// - streaming: audio goes over the socket as `audio_data` and the final
///   `transcript` message comes back; reply and synthesis are HTTP calls.
/// - polling: transcription is an HTTP STT call; the transcript is then
///   delivered over the channel (`POST /transcript`) and the reply arrives
///   via the polled status; synthesis is an HTTP call.
pub struct BackendServices {
    http: reqwest::Client,
    config: ServicesConfig,
    connection: ConnectionManager,
    session_id: String,
    user_id: String,
}

#[derive(Debug, Serialize)]
struct SttRequest<'a> {
    audio: &'a str,
}

#[derive(Debug, Deserialize)]
struct SttResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CoachRequest<'a> {
    text: &'a str,
    session_id: &'a str,
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CoachResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TtsResponse {
    #[serde(rename = "audioContent", default)]
    audio_content: String,
}

impl BackendServices {
    /// Bind the services to a connection and session.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        config: &ServicesConfig,
        connection: ConnectionManager,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            config: config.clone(),
            connection,
            session_id: session_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Streaming transcription: deliver audio, await the final transcript.
    async fn transcribe_streaming(&self, audio_b64: String) -> Result<String> {
        // Subscribe before sending so the response cannot slip past.
        let mut events = self.connection.subscribe();
        self.connection
            .send(WireMessage::AudioData {
                audio_data: audio_b64,
                session_id: self.session_id.clone(),
            })
            .await?;

        let timeout = self.connection_timeout();
        tokio::time::timeout(timeout, wait_for_transcript(&mut events))
            .await
            .map_err(|_| CallError::Network("transcript wait timed out".into()))?
    }

    /// Polling-mode transcription: direct STT call.
    async fn transcribe_http(&self, audio_b64: &str) -> Result<String> {
        let response: SttResponse = post_json(
            &self.http,
            &self.config.stt_url,
            &SttRequest { audio: audio_b64 },
            "stt",
        )
        .await?;
        Ok(response.text)
    }

    /// Polling-mode reply: push the transcript, await the polled result.
    async fn reply_polling(&self, user_text: &str) -> Result<String> {
        let mut events = self.connection.subscribe();
        self.connection
            .send(WireMessage::Transcript {
                text: user_text.to_owned(),
                is_final: true,
            })
            .await?;

        tokio::time::timeout(self.config.timeout(), wait_for_reply(&mut events))
            .await
            .map_err(|_| CallError::Network("reply poll timed out".into()))?
    }

    /// Streaming-mode reply: direct coach call.
    async fn reply_http(&self, user_text: &str) -> Result<String> {
        let response: CoachResponse = post_json(
            &self.http,
            &self.config.coach_url,
            &CoachRequest {
                text: user_text,
                session_id: &self.session_id,
                user_id: &self.user_id,
            },
            "coach",
        )
        .await?;
        Ok(response.response)
    }

    fn connection_timeout(&self) -> std::time::Duration {
        self.config.timeout()
    }
}

#[async_trait]
impl VoiceServices for BackendServices {
    async fn transcribe(&self, segment: &AudioSegment) -> Result<String> {
        let audio_b64 = BASE64.encode(&segment.payload);
        debug!(
            "transcribing segment {} ({} bytes)",
            segment.sequence,
            segment.payload.len()
        );
        match self.connection.mode() {
            ConnectionMode::Streaming => self.transcribe_streaming(audio_b64).await,
            ConnectionMode::Polling | ConnectionMode::Disconnected => {
                self.transcribe_http(&audio_b64).await
            }
        }
    }

    async fn reply(&self, user_text: &str) -> Result<String> {
        match self.connection.mode() {
            ConnectionMode::Polling => self.reply_polling(user_text).await,
            ConnectionMode::Streaming | ConnectionMode::Disconnected => {
                self.reply_http(user_text).await
            }
        }
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let response: TtsResponse = post_json(
            &self.http,
            &self.config.tts_url,
            &TtsRequest { text },
            "tts",
        )
        .await?;
        BASE64.decode(response.audio_content).map_err(|e| {
            CallError::UpstreamService {
                service: "tts",
                message: format!("invalid audio content: {e}"),
            }
        })
    }
}

/// POST a JSON body and decode a JSON response, mapping failures to the
/// named upstream service.
async fn post_json<B, R>(
    http: &reqwest::Client,
    url: &str,
    body: &B,
    service: &'static str,
) -> Result<R>
where
    B: Serialize + Sync,
    R: for<'de> Deserialize<'de>,
{
    let response = http
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| CallError::UpstreamService {
            service,
            message: e.to_string(),
        })?
        .error_for_status()
        .map_err(|e| CallError::UpstreamService {
            service,
            message: e.to_string(),
        })?;

    response
        .json::<R>()
        .await
        .map_err(|e| CallError::UpstreamService {
            service,
            message: format!("invalid response body: {e}"),
        })
}

/// Wait for the final transcript of the in-flight utterance.
async fn wait_for_transcript(events: &mut broadcast::Receiver<ChannelEvent>) -> Result<String> {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Message(WireMessage::Transcript { text, is_final })) if is_final => {
                return Ok(text);
            }
            Ok(ChannelEvent::Message(WireMessage::Error { message })) => {
                return Err(CallError::UpstreamService {
                    service: "stt",
                    message,
                });
            }
            Ok(ChannelEvent::Exhausted) => return Err(CallError::ConnectivityExhausted),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("event subscriber lagged by {n}");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(CallError::Channel("connection events closed".into()));
            }
        }
    }
}

/// Wait for the polled reply of the in-flight turn.
async fn wait_for_reply(events: &mut broadcast::Receiver<ChannelEvent>) -> Result<String> {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::ReplyReady(text)) => return Ok(text),
            Ok(ChannelEvent::Message(WireMessage::Error { message })) => {
                return Err(CallError::UpstreamService {
                    service: "coach",
                    message,
                });
            }
            Ok(ChannelEvent::Exhausted) => return Err(CallError::ConnectivityExhausted),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("event subscriber lagged by {n}");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(CallError::Channel("connection events closed".into()));
            }
        }
    }
}
