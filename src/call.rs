//! Call lifecycle: wires capture, segmentation, connection, orchestration,
//! playback and persistence into one running voice call.

use crate::audio::capture::AudioCaptureEngine;
use crate::audio::playback::{CpalSink, PlaybackQueue};
use crate::config::CallConfig;
use crate::connection::messages::WireMessage;
use crate::connection::polling::StopBody;
use crate::connection::{ConnectionManager, ConnectionMode, ConnectionState};
use crate::error::{CallError, Result};
use crate::orchestrator::TurnOrchestrator;
use crate::segmenter::{run_segmenter, SilenceSegmenter};
use crate::services::BackendServices;
use crate::session::{HttpSessionRecorder, Session, SessionRecord, SessionRecorder};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Utterance queue depth between segmenter and orchestrator. Segments are
/// never dropped while a turn is in flight; they wait here.
const SEGMENT_CHANNEL_SIZE: usize = 64;
/// Playback completion notices.
const DONE_CHANNEL_SIZE: usize = 32;
/// Barge-in notifications.
const INTERRUPT_CHANNEL_SIZE: usize = 8;

/// One live voice call. Created by [`CallSession::start`], torn down by
/// [`CallSession::stop`]; dropping it also cancels all background tasks.
pub struct CallSession {
    cancel: CancellationToken,
    capture: AudioCaptureEngine,
    playback: PlaybackQueue,
    connection: ConnectionManager,
    recorder: Arc<dyn SessionRecorder>,
    orchestrator: JoinHandle<Session>,
    segmenter_task: JoinHandle<()>,
    interrupt_task: JoinHandle<()>,
}

impl CallSession {
    /// Bring the whole pipeline up.
    ///
    /// Order matters: the connection is established first so a reachable
    /// backend is confirmed before the capture device is claimed. Any
    /// failure tears down what was already started.
    ///
    /// # Errors
    ///
    /// Returns the first setup failure: [`CallError::Network`] when neither
    /// transport is reachable, [`CallError::Permission`] or
    /// [`CallError::Audio`] for device problems.
    pub async fn start(config: &CallConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| CallError::Network(format!("http client: {e}")))?;

        let connection = ConnectionManager::connect(&config.connection, http.clone()).await?;

        let mut capture = AudioCaptureEngine::new(&config.audio);
        let chunk_rx = match capture.start() {
            Ok(rx) => rx,
            Err(e) => {
                connection.shutdown(None).await;
                return Err(e);
            }
        };

        let sink = match CpalSink::new(&config.audio) {
            Ok(sink) => sink,
            Err(e) => {
                capture.stop();
                connection.shutdown(None).await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();

        let (segment_tx, segment_rx) = mpsc::channel(SEGMENT_CHANNEL_SIZE);
        let (done_tx, done_rx) = mpsc::channel(DONE_CHANNEL_SIZE);
        let (interrupt_tx, mut interrupt_rx) = mpsc::channel(INTERRUPT_CHANNEL_SIZE);

        let segmenter = SilenceSegmenter::new(&config.segmenter, config.audio.capture_sample_rate);
        let segmenter_task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(e) = run_segmenter(segmenter, chunk_rx, segment_tx, cancel).await {
                    warn!("segmenter stopped: {e}");
                }
            }
        });

        let playback = PlaybackQueue::spawn(
            sink,
            config.audio.playback_sample_rate,
            done_tx,
            cancel.clone(),
        );

        let session = Session::new(config.session.user_id.clone());
        info!("call started (session {})", session.id);

        let services = Arc::new(BackendServices::new(
            http.clone(),
            &config.services,
            connection.clone(),
            session.id.clone(),
            config.session.user_id.clone(),
        ));

        // Forward barge-ins upstream so a streaming backend can abandon any
        // in-flight synthesis for the cancelled turn.
        let interrupt_task = tokio::spawn({
            let connection = connection.clone();
            async move {
                while let Some(sequence) = interrupt_rx.recv().await {
                    if let Err(e) = connection.send(WireMessage::Interrupt).await {
                        warn!("interrupt for turn {sequence} not delivered: {e}");
                    }
                }
            }
        });

        let orchestrator = tokio::spawn(
            TurnOrchestrator::new(services, playback.clone(), session)
                .with_interrupt_notifier(interrupt_tx)
                .run(segment_rx, done_rx, cancel.clone()),
        );

        let recorder: Arc<dyn SessionRecorder> = Arc::new(HttpSessionRecorder::new(
            http,
            config.session.record_url.clone(),
        ));

        Ok(Self {
            cancel,
            capture,
            playback,
            connection,
            recorder,
            orchestrator,
            segmenter_task,
            interrupt_task,
        })
    }

    /// Suppress coach audio without pausing queue advancement.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Channel`] if playback has already stopped.
    pub async fn mute(&self) -> Result<()> {
        self.playback.mute().await
    }

    /// Resume audible coach audio.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Channel`] if playback has already stopped.
    pub async fn unmute(&self) -> Result<()> {
        self.playback.unmute().await
    }

    /// Snapshot of the connection layer (mode, reconnect attempt, error).
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// End the call: stop capture, settle the in-flight turn, tear the
    /// connection down and persist the session record.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Channel`] if the turn loop panicked; the
    /// connection and capture device are released regardless.
    pub async fn stop(mut self) -> Result<SessionRecord> {
        self.cancel.cancel();
        self.capture.stop();

        let session = match (&mut self.orchestrator).await {
            Ok(session) => session,
            Err(e) => {
                self.connection.shutdown(None).await;
                return Err(CallError::Channel(format!("turn loop failed: {e}")));
            }
        };

        // The polling backend accumulates no server-side state; hand it the
        // final call text. The streaming backend saw every message live.
        let stop = (self.connection.mode() == ConnectionMode::Polling).then(|| StopBody {
            transcript: session.transcript_lines().join("\n"),
            ai_responses: session.ai_responses(),
        });
        self.connection.shutdown(stop).await;

        let _ = (&mut self.segmenter_task).await;
        let _ = (&mut self.interrupt_task).await;

        let record = session.close();
        if let Err(e) = self.recorder.record(&record).await {
            warn!("session {} not persisted: {e}", record.id);
        }
        info!("call ended (session {}, {} turns)", record.id, record.ai_responses.len());
        Ok(record)
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        // stop() consumed paths cancel first; this covers early drops.
        self.cancel.cancel();
        self.capture.stop();
    }
}

/// Run a call until `shutdown` fires, then stop it cleanly.
///
/// # Errors
///
/// Propagates setup failures from [`CallSession::start`] and teardown
/// failures from [`CallSession::stop`].
pub async fn run_call(config: &CallConfig, shutdown: CancellationToken) -> Result<SessionRecord> {
    let call = CallSession::start(config).await?;
    shutdown.cancelled().await;
    call.stop().await
}
