use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{GenerationParams, ModelSpec};
use crate::error::SessionError;
use crate::memory::DEFAULT_MEMORY_THRESHOLD_MB;

pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_PRESSURE_PAUSE: Duration = Duration::from_secs(1);
pub const DEFAULT_MODEL_PATH: &str = "models/gemma-3-4b-it-Q4_K_M.gguf";

/// How many times a question is tried and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Pause after a memory-pressure remediation.
    pub pressure_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            pressure_pause: DEFAULT_PRESSURE_PAUSE,
        }
    }
}

impl RetryPolicy {
    /// No waiting at all; handy when the engine is not real.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::ZERO,
            pressure_pause: Duration::ZERO,
        }
    }
}

/// Construction-time settings for a [`crate::session::Thinker`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThinkerConfig {
    pub model: ModelSpec,
    pub log_dir: PathBuf,
    pub output_dir: PathBuf,
    pub memory_threshold_mb: f64,
    pub retry: RetryPolicy,
    pub generation: GenerationParams,
}

impl Default for ThinkerConfig {
    fn default() -> Self {
        Self {
            model: ModelSpec::new(DEFAULT_MODEL_PATH, DEFAULT_CONTEXT_SIZE),
            log_dir: PathBuf::from("logs"),
            output_dir: PathBuf::from("output"),
            memory_threshold_mb: DEFAULT_MEMORY_THRESHOLD_MB,
            retry: RetryPolicy::default(),
            generation: GenerationParams::default(),
        }
    }
}

impl ThinkerConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.retry.max_retries == 0 {
            return Err(SessionError::Config("max_retries must be at least 1".into()));
        }
        if self.model.context_size == 0 {
            return Err(SessionError::Config("context_size must be non-zero".into()));
        }
        if self.model.options.n_threads == 0 || self.model.options.n_batch == 0 {
            return Err(SessionError::Config(
                "n_threads and n_batch must be non-zero".into(),
            ));
        }
        if self.memory_threshold_mb.is_nan() || self.memory_threshold_mb <= 0.0 {
            return Err(SessionError::Config(format!(
                "memory threshold must be positive, got {}",
                self.memory_threshold_mb
            )));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(SessionError::Config("temperature must be between 0.0 and 2.0".into()));
        }
        if !(0.0..=1.0).contains(&self.generation.top_p) {
            return Err(SessionError::Config("top_p must be between 0.0 and 1.0".into()));
        }
        Ok(())
    }
}
