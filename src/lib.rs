//! Voxcoach: real-time voice calls with an AI coach.
//!
//! This crate runs a cascaded voice-turn pipeline:
//! Microphone → silence segmentation → STT → coach reply → TTS → Speaker
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by async channels:
//! - **Audio capture**: Records from the microphone via `cpal`
//! - **Segmenter**: Cuts the stream into utterances at silence boundaries
//! - **Connection**: One logical channel to the backend, WebSocket-primary
//!   with HTTP-polling fallback and capped exponential reconnect backoff
//! - **Orchestrator**: Serializes turns (transcribe → reply → synthesize →
//!   play) with FIFO queueing and barge-in cancellation
//! - **Playback**: Plays coach audio via `cpal`, mutable mid-turn
//! - **Session**: Accumulates the turn log and persists it on hang-up

pub mod audio;
pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod messages;
pub mod orchestrator;
pub mod segmenter;
pub mod services;
pub mod session;

pub use call::CallSession;
pub use config::CallConfig;
pub use connection::{ConnectionManager, ConnectionMode, ConnectionState};
pub use error::{CallError, Result};
pub use orchestrator::turn::{Turn, TurnState};
pub use orchestrator::TurnOrchestrator;
pub use session::{Session, SessionRecord};
