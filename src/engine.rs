//! The seam between the session manager and whatever actually runs the model.
//!
//! Engines report failures as plain strings; the lifecycle controller decides
//! whether a message becomes a load error or an inference error.

use std::path::PathBuf;

/// Model-level options applied at construction time.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub n_threads: u32,
    pub n_batch: u32,
    pub use_mlock: bool,
    pub use_mmap: bool,
    /// Layers to offload to the GPU; `None` keeps the backend default.
    pub n_gpu_layers: Option<u32>,
    pub seed: u32,
    /// Silence the backend's own diagnostic output.
    pub quiet: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            n_threads: 4,
            n_batch: 512,
            use_mlock: false,
            use_mmap: true,
            n_gpu_layers: None,
            seed: 1234,
            quiet: true,
        }
    }
}

/// Everything needed to build a handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub context_size: u32,
    pub options: LoadOptions,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>, context_size: u32) -> Self {
        Self {
            path: path.into(),
            context_size,
            options: LoadOptions::default(),
        }
    }
}

/// Per-call sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
    pub echo: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.95,
            stop: Vec::new(),
            echo: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub text: String,
}

/// Output of one inference call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    pub choices: Vec<Choice>,
}

impl Completion {
    pub fn single(text: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice { text: text.into() }],
        }
    }

    /// Text of the first choice, if the engine produced any.
    pub fn first_text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.text.as_str())
    }
}

/// Builds model handles.
pub trait InferenceEngine {
    type Handle: LoadedModel;

    fn load(&self, spec: &ModelSpec) -> Result<Self::Handle, String>;
}

/// A fully constructed, ready-to-use model.
pub trait LoadedModel {
    fn complete(&mut self, prompt: &str, params: &GenerationParams) -> Result<Completion, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_defaults() {
        let p = GenerationParams::default();
        assert_eq!(p.max_tokens, 1024);
        assert_eq!(p.temperature, 0.7);
        assert_eq!(p.top_p, 0.95);
        assert!(p.stop.is_empty());
        assert!(!p.echo);
    }

    #[test]
    fn test_load_defaults() {
        let o = LoadOptions::default();
        assert_eq!(o.n_threads, 4);
        assert_eq!(o.n_batch, 512);
        assert!(!o.use_mlock);
    }

    #[test]
    fn test_first_text() {
        assert_eq!(Completion::single(" 4 ").first_text(), Some(" 4 "));
        assert_eq!(Completion::default().first_text(), None);
    }
}
