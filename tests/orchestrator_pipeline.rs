//! End-to-end turn loop tests over scripted services and a fake sink.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use voxcoach::audio::playback::{AudioSink, PlaybackQueue, SinkControl};
use voxcoach::audio::pcm16_from_f32;
use voxcoach::error::{CallError, ErrorKind, Result};
use voxcoach::messages::AudioSegment;
use voxcoach::services::VoiceServices;
use voxcoach::{Session, TurnOrchestrator, TurnState};

/// Per-turn behavior of the scripted backend.
#[derive(Clone, Copy)]
enum Script {
    Normal,
    EmptyTranscript,
    SttError,
    CoachError,
}

/// Deterministic stand-in for the three external calls. Records how many
/// calls were in flight at once so single-flight can be asserted.
struct ScriptedServices {
    scripts: HashMap<u64, Script>,
    stage_delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedServices {
    fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            stage_delay: Duration::from_millis(5),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn with(mut self, sequence: u64, script: Script) -> Self {
        self.scripts.insert(sequence, script);
        self
    }

    fn script_for(&self, sequence: u64) -> Script {
        self.scripts.get(&sequence).copied().unwrap_or(Script::Normal)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    fn max_in_flight(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a ScriptedServices);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The transcript embeds the sequence so reply() can find its script.
fn sequence_from_text(text: &str) -> u64 {
    text.rsplit(' ')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX)
}

#[async_trait]
impl VoiceServices for ScriptedServices {
    async fn transcribe(&self, segment: &AudioSegment) -> Result<String> {
        let _guard = self.enter();
        tokio::time::sleep(self.stage_delay).await;
        match self.script_for(segment.sequence) {
            Script::SttError => Err(CallError::UpstreamService {
                service: "stt",
                message: "transcription rejected".into(),
            }),
            Script::EmptyTranscript => Ok("   ".into()),
            _ => Ok(format!("utterance {}", segment.sequence)),
        }
    }

    async fn reply(&self, user_text: &str) -> Result<String> {
        let _guard = self.enter();
        tokio::time::sleep(self.stage_delay).await;
        match self.script_for(sequence_from_text(user_text)) {
            Script::CoachError => Err(CallError::UpstreamService {
                service: "coach",
                message: "coach unavailable".into(),
            }),
            _ => Ok(format!("coach says {user_text}")),
        }
    }

    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
        let _guard = self.enter();
        tokio::time::sleep(self.stage_delay).await;
        Ok(vec![0u8; 640])
    }
}

/// Sink that holds each item for a fixed wall time, honoring cancellation.
struct FakeSink {
    hold: Duration,
}

impl AudioSink for FakeSink {
    fn play(&mut self, _samples: &[f32], _sample_rate: u32, ctl: &SinkControl) -> Result<bool> {
        let deadline = Instant::now() + self.hold;
        while Instant::now() < deadline {
            if ctl.cancelled.load(Ordering::SeqCst) {
                return Ok(true);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(false)
    }
}

fn segment(sequence: u64) -> AudioSegment {
    AudioSegment {
        sequence,
        payload: pcm16_from_f32(&vec![0.1_f32; 160]),
        sample_rate: 16_000,
        captured_at: Instant::now(),
    }
}

struct Pipeline {
    segment_tx: mpsc::Sender<AudioSegment>,
    cancel: CancellationToken,
    run: tokio::task::JoinHandle<Session>,
}

fn start_pipeline(services: ScriptedServices, hold: Duration) -> (Pipeline, std::sync::Arc<ScriptedServices>) {
    let services = std::sync::Arc::new(services);
    let cancel = CancellationToken::new();
    let (segment_tx, segment_rx) = mpsc::channel(16);
    let (done_tx, done_rx) = mpsc::channel(16);

    let playback = PlaybackQueue::spawn(FakeSink { hold }, 16_000, done_tx, cancel.clone());
    let orchestrator = TurnOrchestrator::new(
        services.clone(),
        playback,
        Session::new("user-1"),
    );
    let run = tokio::spawn(orchestrator.run(segment_rx, done_rx, cancel.clone()));

    (
        Pipeline {
            segment_tx,
            cancel,
            run,
        },
        services,
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn turns_complete_in_order_one_at_a_time() {
    let (pipeline, services) = start_pipeline(ScriptedServices::new(), Duration::from_millis(20));

    for sequence in 0..3 {
        pipeline.segment_tx.send(segment(sequence)).await.unwrap();
    }
    drop(pipeline.segment_tx);

    let session = pipeline.run.await.unwrap();

    let states: Vec<TurnState> = session.turns.iter().map(|t| t.state).collect();
    assert_eq!(states, vec![TurnState::Complete; 3]);
    let sequences: Vec<u64> = session.turns.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert_eq!(
        session.turns[1].user_text.as_deref(),
        Some("utterance 1")
    );
    assert_eq!(
        session.turns[2].ai_text.as_deref(),
        Some("coach says utterance 2")
    );
    assert_eq!(services.max_in_flight(), 1);

    let record = session.close();
    assert_eq!(record.transcript, "utterance 0\nutterance 1\nutterance 2");
    assert_eq!(record.ai_responses.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_turn_does_not_block_the_queue() {
    let services = ScriptedServices::new()
        .with(0, Script::SttError)
        .with(1, Script::CoachError);
    let (pipeline, _) = start_pipeline(services, Duration::from_millis(10));

    for sequence in 0..3 {
        pipeline.segment_tx.send(segment(sequence)).await.unwrap();
    }
    drop(pipeline.segment_tx);

    let session = pipeline.run.await.unwrap();
    assert_eq!(session.turns.len(), 3);

    assert_eq!(session.turns[0].state, TurnState::Failed);
    assert_eq!(
        session.turns[0].error.as_ref().map(|(kind, _)| *kind),
        Some(ErrorKind::UpstreamService)
    );
    assert!(session.turns[0].user_text.is_none());

    // The coach failure keeps what the user said.
    assert_eq!(session.turns[1].state, TurnState::Failed);
    assert_eq!(session.turns[1].user_text.as_deref(), Some("utterance 1"));
    assert!(session.turns[1].ai_text.is_none());

    assert_eq!(session.turns[2].state, TurnState::Complete);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_transcript_completes_without_coach_call() {
    let services = ScriptedServices::new().with(0, Script::EmptyTranscript);
    let (pipeline, _) = start_pipeline(services, Duration::from_millis(10));

    pipeline.segment_tx.send(segment(0)).await.unwrap();
    drop(pipeline.segment_tx);

    let session = pipeline.run.await.unwrap();
    assert_eq!(session.turns.len(), 1);
    assert_eq!(session.turns[0].state, TurnState::Complete);
    assert_eq!(session.turns[0].user_text.as_deref(), Some(""));
    assert!(session.turns[0].ai_text.is_none());
    assert!(session.transcript_lines().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn barge_in_cancels_playback_and_promotes_new_segment() {
    let services = std::sync::Arc::new(ScriptedServices::new());
    let cancel = CancellationToken::new();
    let (segment_tx, segment_rx) = mpsc::channel(16);
    let (done_tx, done_rx) = mpsc::channel(16);
    let (interrupt_tx, mut interrupt_rx) = mpsc::channel(4);

    let playback = PlaybackQueue::spawn(
        FakeSink {
            hold: Duration::from_millis(400),
        },
        16_000,
        done_tx,
        cancel.clone(),
    );
    let orchestrator = TurnOrchestrator::new(services, playback, Session::new("user-1"))
        .with_interrupt_notifier(interrupt_tx);
    let run = tokio::spawn(orchestrator.run(segment_rx, done_rx, cancel.clone()));

    segment_tx.send(segment(0)).await.unwrap();
    // Let turn 0 reach playback, then speak over it.
    tokio::time::sleep(Duration::from_millis(150)).await;
    segment_tx.send(segment(1)).await.unwrap();
    drop(segment_tx);

    let session = run.await.unwrap();

    assert_eq!(session.turns.len(), 2);
    assert_eq!(session.turns[0].sequence, 0);
    assert_eq!(session.turns[0].state, TurnState::Cancelled);
    // The interrupted turn keeps its text.
    assert_eq!(session.turns[0].user_text.as_deref(), Some("utterance 0"));
    assert_eq!(session.turns[1].sequence, 1);
    assert_eq!(session.turns[1].state, TurnState::Complete);

    assert_eq!(interrupt_rx.recv().await, Some(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_the_call_cancels_the_playing_turn() {
    let (pipeline, _) = start_pipeline(ScriptedServices::new(), Duration::from_millis(400));

    pipeline.segment_tx.send(segment(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    pipeline.cancel.cancel();

    let session = pipeline.run.await.unwrap();
    assert_eq!(session.turns.len(), 1);
    assert_eq!(session.turns[0].state, TurnState::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn segments_sent_while_processing_are_queued_not_dropped() {
    let services = ScriptedServices::new();
    let (pipeline, _) = start_pipeline(services, Duration::from_millis(5));

    // Burst well past a single in-flight turn.
    for sequence in 0..8 {
        pipeline.segment_tx.send(segment(sequence)).await.unwrap();
    }
    drop(pipeline.segment_tx);

    let session = pipeline.run.await.unwrap();
    let sequences: Vec<u64> = session.turns.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, (0..8).collect::<Vec<u64>>());
    assert!(session.turns.iter().all(|t| t.state == TurnState::Complete));
}
