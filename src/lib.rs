//! Resilient chain-of-thought question answering around a local llama.cpp model.

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod memory;
pub mod session;
pub mod shutdown;

#[cfg(feature = "llama")]
pub mod llama;

// Scripted engine and probe, used by the tests and by `--features mock` builds
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{RetryPolicy, ThinkerConfig};
pub use engine::{Completion, GenerationParams, InferenceEngine, LoadOptions, LoadedModel, ModelSpec};
pub use error::SessionError;
pub use lifecycle::ModelLifecycle;
pub use logger::SessionLog;
pub use memory::{MemoryMonitor, MemoryProbe};
pub use session::{AttemptRecord, SessionOutcome, Thinker};
