//! # loopsync
//!
//! A real-time beat-synchronized loop player. It listens to a live audio
//! stream (microphone or a WAV file played at real time), tracks that
//! stream's tempo and beat phase continuously, and plays back a
//! pre-analyzed backing loop whose speed is time-stretched so its beats
//! land on the incoming stream's beats.
//!
//! ## Architecture
//!
//! - [`ring_buffer`]: the SPSC ring with BLOCK/INCREMENTAL/NOWAIT modes
//!   every other worker is built on top of.
//! - [`input_source`]: the microphone/file abstraction feeding both the
//!   pass-through path and the beat oracle's analysis queue.
//! - [`beat_oracle`]: the dual-tracker fusion worker.
//! - [`loop_source`]: the pre-analyzed backing loop and its beat grid.
//! - [`stretcher`]: the time-stretch boundary.
//! - [`sync_engine`]: the controller that ties the above together.
//! - [`config`]: persisted settings.
//! - [`monitoring`]: engine health/stats reporting.
//! - [`error`]: per-subsystem typed errors and the circuit breaker.
//! - [`realtime`]: real-time thread scheduling helpers.
//! - [`app`]: wires the pieces together into a running session.

pub mod app;
pub mod beat_oracle;
pub mod config;
pub mod error;
pub mod input_source;
pub mod loop_source;
pub mod monitoring;
pub mod realtime;
pub mod ring_buffer;
pub mod stretcher;
pub mod sync_engine;

pub use app::LoopSyncApp;
pub use config::AppConfig;
pub use error::EngineError;
pub use loop_source::{LoopBlob, LoopSource};
pub use monitoring::{EngineMonitor, EngineReport};
pub use sync_engine::SyncEngine;
