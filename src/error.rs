//! Typed errors for each subsystem, plus the circuit breaker that turns a
//! run of recoverable failures into a fatal shutdown signal.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{error, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingBufferError {
    #[error("put of {len} frames exceeds ring buffer capacity {capacity}")]
    ExceedsCapacity { len: usize, capacity: usize },
    #[error("operation would block")]
    WouldBlock,
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("failed to read loop file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode loop blob: {0}")]
    Decode(#[from] bincode::Error),
    #[error("loop blob has an empty beat grid")]
    EmptyBeatGrid,
    #[error("loop blob's beat grid is not strictly increasing")]
    UnsortedBeatGrid,
}

#[derive(Debug, Error)]
pub enum AudioBackendError {
    #[error("no default {0} device available")]
    NoDevice(&'static str),
    #[error("unsupported stream configuration: {0}")]
    UnsupportedConfig(String),
    #[error("failed to build {0} stream: {1}")]
    BuildStream(&'static str, String),
    #[error("failed to start {0} stream: {1}")]
    PlayStream(&'static str, String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to determine a config directory for this platform")]
    NoConfigDir,
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    RingBuffer(#[from] RingBufferError),
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error(transparent)]
    AudioBackend(#[from] AudioBackendError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The subsystem a recoverable failure came from. Kept small and specific
/// to this engine rather than a broad cross-cutting taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    AudioIo,
    BeatTracking,
    LoopLoad,
    ConfigIo,
}

impl FailureKind {
    fn label(self) -> &'static str {
        match self {
            FailureKind::AudioIo => "audio_io",
            FailureKind::BeatTracking => "beat_tracking",
            FailureKind::LoopLoad => "loop_load",
            FailureKind::ConfigIo => "config_io",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: CircuitState,
    failures_in_window: u32,
    window_start: Instant,
    last_failure: Option<Instant>,
}

impl Breaker {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures_in_window: 0,
            window_start: now,
            last_failure: None,
        }
    }
}

/// Escalates repeated failures of the same kind within one second from
/// "log and continue" to "trip fatal." One breaker per [`FailureKind`].
pub struct CircuitBreaker {
    breakers: Mutex<HashMap<FailureKind, Breaker>>,
    failure_threshold: u32,
    window: Duration,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold,
            window: Duration::from_secs(1),
            recovery_timeout: Duration::from_secs(10),
        }
    }

    /// Records a recoverable failure. Returns `true` if the breaker for
    /// this kind has now tripped open, meaning the caller should treat
    /// this failure as fatal rather than retrying.
    pub fn record_failure(&self, kind: FailureKind, message: &str) -> bool {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        let breaker = breakers.entry(kind).or_insert_with(|| Breaker::new(now));

        if now.duration_since(breaker.window_start) > self.window {
            breaker.window_start = now;
            breaker.failures_in_window = 0;
        }
        breaker.failures_in_window += 1;
        breaker.last_failure = Some(now);

        warn!(
            "{}: {} ({} failures this window)",
            kind.label(),
            message,
            breaker.failures_in_window
        );

        if breaker.failures_in_window >= self.failure_threshold {
            if breaker.state != CircuitState::Open {
                error!(
                    "circuit breaker tripped open for {}: {} failures within {:?}",
                    kind.label(),
                    breaker.failures_in_window,
                    self.window
                );
            }
            breaker.state = CircuitState::Open;
            true
        } else {
            false
        }
    }

    pub fn record_success(&self, kind: FailureKind) {
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        if let Some(breaker) = breakers.get_mut(&kind) {
            breaker.failures_in_window = 0;
            if breaker.state == CircuitState::HalfOpen {
                breaker.state = CircuitState::Closed;
            }
        }
    }

    pub fn state(&self, kind: FailureKind) -> CircuitState {
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        let now = Instant::now();
        match breakers.get_mut(&kind) {
            None => CircuitState::Closed,
            Some(breaker) => {
                if breaker.state == CircuitState::Open {
                    if let Some(last) = breaker.last_failure {
                        if now.duration_since(last) > self.recovery_timeout {
                            breaker.state = CircuitState::HalfOpen;
                        }
                    }
                }
                breaker.state
            }
        }
    }
}
