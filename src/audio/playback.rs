//! Ordered playback of synthesized replies.
//!
//! A single consumer task plays items strictly in enqueue order, one at a
//! time. Muting suppresses audible output but never alters queue order or
//! advancement; cancelling stops the currently playing item and advances.
//! Completion events feed the orchestrator's `Playing → Complete`
//! transition.

use crate::audio::f32_from_pcm16;
use crate::config::AudioConfig;
use crate::error::{CallError, Result};
use crate::messages::PlaybackDone;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Command queue depth for the playback task.
const COMMAND_CHANNEL_SIZE: usize = 32;

/// Per-item control flags shared with the sink while it plays.
#[derive(Clone)]
pub struct SinkControl {
    /// Suppress audible output; playback position keeps advancing.
    pub muted: Arc<AtomicBool>,
    /// Stop the current item immediately.
    pub cancelled: Arc<AtomicBool>,
}

/// Blocking audio output device.
///
/// `play` drains the samples and returns whether the item was cancelled
/// before it finished. Runs on a blocking thread; implementations may
/// sleep.
pub trait AudioSink: Send + 'static {
    /// Play one item to completion or cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the output stream fails.
    fn play(&mut self, samples: &[f32], sample_rate: u32, ctl: &SinkControl) -> Result<bool>;
}

/// Commands accepted by the playback task.
enum PlaybackCommand {
    Enqueue { sequence: u64, payload: Vec<u8> },
    Mute,
    Unmute,
    Cancel { sequence: u64 },
}

struct PlaybackItem {
    sequence: u64,
    payload: Vec<u8>,
}

/// Handle to the playback task.
#[derive(Clone)]
pub struct PlaybackQueue {
    cmd_tx: mpsc::Sender<PlaybackCommand>,
}

impl PlaybackQueue {
    /// Spawn the playback task over the given sink.
    ///
    /// Completion notices for every item (played out or cancelled) are
    /// delivered on `done_tx` in play order.
    #[must_use]
    pub fn spawn<S: AudioSink>(
        sink: S,
        sample_rate: u32,
        done_tx: mpsc::Sender<PlaybackDone>,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        tokio::spawn(run_playback(sink, sample_rate, cmd_rx, done_tx, cancel));
        Self { cmd_tx }
    }

    /// Append one turn's audio to the ordered playback list.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Channel`] if the playback task has stopped.
    pub async fn enqueue(&self, sequence: u64, payload: Vec<u8>) -> Result<()> {
        self.send(PlaybackCommand::Enqueue { sequence, payload }).await
    }

    /// Suppress audible output. Queue order and advancement are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Channel`] if the playback task has stopped.
    pub async fn mute(&self) -> Result<()> {
        self.send(PlaybackCommand::Mute).await
    }

    /// Resume audible output.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Channel`] if the playback task has stopped.
    pub async fn unmute(&self) -> Result<()> {
        self.send(PlaybackCommand::Unmute).await
    }

    /// Stop the given turn's item immediately if it is currently playing
    /// and advance to the next queued item. Used by barge-in.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Channel`] if the playback task has stopped.
    pub async fn cancel(&self, sequence: u64) -> Result<()> {
        self.send(PlaybackCommand::Cancel { sequence }).await
    }

    async fn send(&self, cmd: PlaybackCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| CallError::Channel("playback task stopped".into()))
    }
}

/// Single consumer loop: strictly ordered, one item at a time.
async fn run_playback<S: AudioSink>(
    mut sink: S,
    sample_rate: u32,
    mut cmd_rx: mpsc::Receiver<PlaybackCommand>,
    done_tx: mpsc::Sender<PlaybackDone>,
    cancel: CancellationToken,
) {
    let muted = Arc::new(AtomicBool::new(false));
    let mut queue: VecDeque<PlaybackItem> = VecDeque::new();

    loop {
        // Idle until an item is available.
        let item = match queue.pop_front() {
            Some(item) => item,
            None => {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => {
                            handle_idle_command(cmd, &mut queue, &muted);
                            continue;
                        }
                        None => return,
                    }
                }
            }
        };

        let sequence = item.sequence;
        let ctl = SinkControl {
            muted: Arc::clone(&muted),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let item_cancelled = Arc::clone(&ctl.cancelled);
        let samples = f32_from_pcm16(&item.payload);
        debug!("playing turn {sequence} ({} samples)", samples.len());

        let mut join = tokio::task::spawn_blocking(move || {
            let result = sink.play(&samples, sample_rate, &ctl);
            (sink, result)
        });

        // Serve commands while the sink drains this item.
        let joined = loop {
            tokio::select! {
                joined = &mut join => break joined,
                () = cancel.cancelled() => {
                    item_cancelled.store(true, Ordering::SeqCst);
                    break (&mut join).await;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(PlaybackCommand::Enqueue { sequence, payload }) => {
                        queue.push_back(PlaybackItem { sequence, payload });
                    }
                    Some(PlaybackCommand::Mute) => muted.store(true, Ordering::SeqCst),
                    Some(PlaybackCommand::Unmute) => muted.store(false, Ordering::SeqCst),
                    Some(PlaybackCommand::Cancel { sequence: target }) => {
                        if target == sequence {
                            item_cancelled.store(true, Ordering::SeqCst);
                        } else {
                            debug!("cancel for turn {target} ignored; not playing");
                        }
                    }
                    None => {
                        item_cancelled.store(true, Ordering::SeqCst);
                        break (&mut join).await;
                    }
                }
            }
        };

        let (returned_sink, play_result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!("playback worker panicked: {e}");
                let _ = done_tx
                    .send(PlaybackDone {
                        sequence,
                        cancelled: true,
                    })
                    .await;
                return;
            }
        };
        sink = returned_sink;

        let cancelled = match play_result {
            Ok(cancelled) => cancelled,
            Err(e) => {
                error!("playback failed for turn {sequence}: {e}");
                true
            }
        };

        if done_tx
            .send(PlaybackDone { sequence, cancelled })
            .await
            .is_err()
        {
            return;
        }

        if cancel.is_cancelled() {
            return;
        }
    }
}

fn handle_idle_command(
    cmd: PlaybackCommand,
    queue: &mut VecDeque<PlaybackItem>,
    muted: &Arc<AtomicBool>,
) {
    match cmd {
        PlaybackCommand::Enqueue { sequence, payload } => {
            queue.push_back(PlaybackItem { sequence, payload });
        }
        PlaybackCommand::Mute => muted.store(true, Ordering::SeqCst),
        PlaybackCommand::Unmute => muted.store(false, Ordering::SeqCst),
        PlaybackCommand::Cancel { sequence } => {
            debug!("cancel for turn {sequence} ignored; nothing playing");
        }
    }
}

/// Audio playback to system speakers via cpal.
pub struct CpalSink {
    device: cpal::Device,
    stream_config: StreamConfig,
}

impl CpalSink {
    /// Create a sink on the configured (or default) output device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| CallError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| CallError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| CallError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: config.playback_sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            stream_config,
        })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
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

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

impl AudioSink for CpalSink {
    fn play(&mut self, samples: &[f32], _sample_rate: u32, ctl: &SinkControl) -> Result<bool> {
        let buffer = Arc::new(Mutex::new(PlaybackBuffer {
            samples: samples.to_vec(),
            position: 0,
            finished: false,
        }));

        let buffer_clone = Arc::clone(&buffer);
        let muted = Arc::clone(&ctl.muted);

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut buf = match buffer_clone.lock() {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    let suppress = muted.load(Ordering::Relaxed);

                    for sample in data.iter_mut() {
                        if buf.position < buf.samples.len() {
                            // Muted output still advances the position so
                            // item timing and queue advancement hold.
                            *sample = if suppress { 0.0 } else { buf.samples[buf.position] };
                            buf.position += 1;
                        } else {
                            *sample = 0.0;
                            buf.finished = true;
                        }
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| CallError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| CallError::Audio(format!("failed to start output stream: {e}")))?;

        // Drain until played out or cancelled.
        loop {
            std::thread::sleep(Duration::from_millis(10));
            if ctl.cancelled.load(Ordering::SeqCst) {
                drop(stream);
                return Ok(true);
            }
            let finished = buffer
                .lock()
                .map(|b| b.finished)
                .map_err(|e| CallError::Audio(format!("playback buffer lock poisoned: {e}")))?;
            if finished {
                break;
            }
        }

        drop(stream);
        Ok(false)
    }
}
