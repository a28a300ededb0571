//! llama.cpp backend built on `llama-cpp-2`.
//!
//! A fresh context is created for every completion, so nothing but the model
//! weights survive between calls.

use std::num::NonZeroU32;
use std::sync::Arc;

use llama_cpp_2::{
    context::params::LlamaContextParams,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
};

use crate::engine::{Completion, GenerationParams, InferenceEngine, LoadOptions, LoadedModel, ModelSpec};

/// Owns the process-wide llama.cpp backend; it can only be initialised once.
pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
}

impl LlamaEngine {
    pub fn new(quiet: bool) -> Result<Self, String> {
        let mut backend = LlamaBackend::init().map_err(|e| format!("Failed to init backend: {e}"))?;
        if quiet {
            backend.void_logs();
        }
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl InferenceEngine for LlamaEngine {
    type Handle = LlamaHandle;

    fn load(&self, spec: &ModelSpec) -> Result<LlamaHandle, String> {
        if !spec.path.exists() {
            return Err(format!("Model file not found: {}", spec.path.display()));
        }

        let opts = &spec.options;
        let mut model_params = LlamaModelParams::default().with_use_mlock(opts.use_mlock);
        if !opts.use_mmap {
            log::warn!("use_mmap=false is not supported by this backend; weights stay memory-mapped");
        }
        if let Some(layers) = opts.n_gpu_layers {
            model_params = model_params.with_n_gpu_layers(layers);
        }

        let model = LlamaModel::load_from_file(&self.backend, &spec.path, &model_params)
            .map_err(|e| format!("Failed to load model: {e}"))?;

        Ok(LlamaHandle {
            backend: self.backend.clone(),
            model,
            context_size: spec.context_size,
            options: opts.clone(),
        })
    }
}

pub struct LlamaHandle {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    context_size: u32,
    options: LoadOptions,
}

impl LlamaHandle {
    fn create_sampler(&self, params: &GenerationParams) -> LlamaSampler {
        LlamaSampler::chain_simple([
            LlamaSampler::temp(params.temperature),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::dist(self.options.seed),
        ])
    }
}

impl LoadedModel for LlamaHandle {
    fn complete(&mut self, prompt: &str, params: &GenerationParams) -> Result<Completion, String> {
        let n_ctx = NonZeroU32::new(self.context_size).ok_or("Context size must be non-zero")?;
        let n_batch = self.options.n_batch.max(1);
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_batch)
            .with_n_threads(self.options.n_threads as i32)
            .with_n_threads_batch(self.options.n_threads as i32);

        let mut context = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| format!("Context creation failed: {e}"))?;

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| format!("Tokenization failed: {e}"))?;
        if tokens.is_empty() {
            return Err("Prompt produced no tokens".to_string());
        }
        if tokens.len() >= self.context_size as usize {
            return Err(format!(
                "Prompt has {} tokens, context holds {}",
                tokens.len(),
                self.context_size
            ));
        }

        // Evaluate the prompt in chunks no larger than n_batch.
        let mut batch = LlamaBatch::new(n_batch as usize, 1);
        let last = tokens.len() - 1;
        for (chunk_idx, chunk) in tokens.chunks(n_batch as usize).enumerate() {
            batch.clear();
            for (offset, &token) in chunk.iter().enumerate() {
                let pos = chunk_idx * n_batch as usize + offset;
                batch
                    .add(token, pos as i32, &[0], pos == last)
                    .map_err(|e| format!("Batch add failed: {e}"))?;
            }
            context
                .decode(&mut batch)
                .map_err(|e| format!("Initial decode failed: {e}"))?;
        }

        let mut sampler = self.create_sampler(params);
        let mut response = if params.echo { prompt.to_string() } else { String::new() };
        let mut generated = String::new();
        let mut token_pos = tokens.len() as i32;

        for n in 0..params.max_tokens {
            if token_pos as u32 >= self.context_size {
                log::warn!("Context full after {n} generated tokens");
                break;
            }

            let next_token = sampler.sample(&context, -1);
            if self.model.is_eog_token(next_token) {
                break;
            }

            match self.model.token_to_str(next_token, Special::Tokenize) {
                Ok(piece) => generated.push_str(&piece),
                Err(e) => log::debug!("Token {next_token} is not valid UTF-8: {e}"),
            }

            if let Some(cut) = params.stop.iter().filter_map(|s| generated.find(s.as_str())).min() {
                generated.truncate(cut);
                break;
            }

            batch.clear();
            batch
                .add(next_token, token_pos, &[0], true)
                .map_err(|e| format!("Batch add failed at token {n}: {e}"))?;
            context
                .decode(&mut batch)
                .map_err(|e| format!("Decode failed at token {n}: {e}"))?;
            token_pos += 1;
        }

        response.push_str(&generated);
        Ok(Completion::single(response))
    }
}
