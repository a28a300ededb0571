use std::time::Instant;

use crate::engine::{Completion, GenerationParams, InferenceEngine, LoadedModel, ModelSpec};
use crate::error::SessionError;
use crate::logger::SessionLog;
use crate::memory::MemoryMonitor;

/// A handle together with what it was built from.
struct ReadyModel<H> {
    handle: H,
    spec: ModelSpec,
    load_memory_mb: f64,
    loaded_at: Instant,
}

/// Either nothing, or a handle that is fully usable.
enum ModelState<H> {
    Uninitialized,
    Ready(ReadyModel<H>),
}

/// Owns the model handle and builds it on demand.
pub struct ModelLifecycle<E: InferenceEngine> {
    engine: E,
    spec: ModelSpec,
    memory: MemoryMonitor,
    state: ModelState<E::Handle>,
    load_count: u32,
}

impl<E: InferenceEngine> ModelLifecycle<E> {
    pub fn new(engine: E, spec: ModelSpec, memory: MemoryMonitor) -> Self {
        Self {
            engine,
            spec,
            memory,
            state: ModelState::Uninitialized,
            load_count: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ModelState::Ready(_))
    }

    /// Number of successful constructions so far.
    pub fn load_count(&self) -> u32 {
        self.load_count
    }

    /// Build the handle if there is none.
    ///
    /// Returns the memory the construction added in MB, or 0.0 when the model
    /// was already loaded.
    pub fn ensure_ready(&mut self, log: &SessionLog) -> Result<f64, SessionError> {
        if self.is_ready() {
            return Ok(0.0);
        }

        log.write(&format!("Carregando modelo de {}", self.spec.path.display()));
        log::info!(
            "Loading model from {} (n_ctx={}, threads={}, batch={})",
            self.spec.path.display(),
            self.spec.context_size,
            self.spec.options.n_threads,
            self.spec.options.n_batch
        );

        let memory_before = self.memory.current_usage()?;

        let handle = match self.engine.load(&self.spec) {
            Ok(handle) => handle,
            Err(e) => {
                let err = SessionError::ModelLoad(e);
                log.write(&err.to_string());
                log::error!("{err}");
                self.release();
                return Err(err);
            }
        };

        // Read before the handle is published so a failed read leaves nothing behind.
        let memory_after = match self.memory.current_usage() {
            Ok(mb) => mb,
            Err(e) => {
                drop(handle);
                self.release();
                return Err(e);
            }
        };
        let memory_used = memory_after - memory_before;

        self.state = ModelState::Ready(ReadyModel {
            handle,
            spec: self.spec.clone(),
            load_memory_mb: memory_used,
            loaded_at: Instant::now(),
        });
        self.load_count += 1;

        log.write(&format!("Memória usada para carregar o modelo: {memory_used:.2} MB"));
        log::info!("Model loaded successfully ({memory_used:.2} MB)");
        Ok(memory_used)
    }

    /// Run one completion on the loaded model.
    pub fn infer(&mut self, prompt: &str, params: &GenerationParams) -> Result<Completion, SessionError> {
        match &mut self.state {
            ModelState::Ready(ready) => ready.handle.complete(prompt, params).map_err(SessionError::Inference),
            ModelState::Uninitialized => Err(SessionError::Inference(
                "modelo não inicializado".to_string(),
            )),
        }
    }

    /// Drop the handle, whatever the current state, and hint the allocator.
    pub fn release(&mut self) {
        if let ModelState::Ready(ready) = std::mem::replace(&mut self.state, ModelState::Uninitialized) {
            log::info!(
                "Unloading model {} ({:.2} MB, loaded {:.1}s ago)",
                ready.spec.path.display(),
                ready.load_memory_mb,
                ready.loaded_at.elapsed().as_secs_f64()
            );
            drop(ready);
        }
        self.memory.reclaim();
    }
}

impl<E: InferenceEngine> Drop for ModelLifecycle<E> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeProbe, ScriptedEngine};
    use std::sync::Arc;

    const MB: u64 = 1024 * 1024;

    fn setup(engine: &ScriptedEngine, probe: &Arc<FakeProbe>) -> ModelLifecycle<ScriptedEngine> {
        let memory = MemoryMonitor::new(probe.clone(), 6000.0);
        ModelLifecycle::new(engine.clone(), ModelSpec::new("model.gguf", 2048), memory)
    }

    fn scratch_log() -> (tempfile::TempDir, SessionLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::open(dir.path().join("lifecycle.txt"));
        (dir, log)
    }

    #[test]
    fn test_ensure_ready_loads_once() {
        let probe = Arc::new(FakeProbe::new(100 * MB));
        let engine = ScriptedEngine::new().with_memory(probe.clone(), 300 * MB);
        let mut lifecycle = setup(&engine, &probe);
        let (_dir, log) = scratch_log();

        assert!(!lifecycle.is_ready());
        let first = lifecycle.ensure_ready(&log).unwrap();
        assert_eq!(first, 300.0);
        assert!(lifecycle.is_ready());

        let second = lifecycle.ensure_ready(&log).unwrap();
        assert_eq!(second, 0.0);
        assert_eq!(engine.load_count(), 1);
        assert_eq!(lifecycle.load_count(), 1);
    }

    #[test]
    fn test_release_then_ensure_ready_rebuilds() {
        let probe = Arc::new(FakeProbe::new(0));
        let engine = ScriptedEngine::new().with_memory(probe.clone(), 10 * MB);
        let mut lifecycle = setup(&engine, &probe);
        let (_dir, log) = scratch_log();

        lifecycle.ensure_ready(&log).unwrap();
        lifecycle.release();
        assert!(!lifecycle.is_ready());
        assert_eq!(engine.live_handles(), 0);

        let delta = lifecycle.ensure_ready(&log).unwrap();
        assert_eq!(delta, 10.0);
        assert_eq!(engine.load_count(), 2);
        assert_eq!(engine.live_handles(), 1);
    }

    #[test]
    fn test_release_is_idempotent_and_hints() {
        let probe = Arc::new(FakeProbe::new(0));
        let engine = ScriptedEngine::new();
        let mut lifecycle = setup(&engine, &probe);

        lifecycle.release();
        lifecycle.release();
        assert!(!lifecycle.is_ready());
        assert_eq!(probe.reclaim_count(), 2);
    }

    #[test]
    fn test_load_failure_stays_uninitialized() {
        let probe = Arc::new(FakeProbe::new(0));
        let engine = ScriptedEngine::new();
        engine.push_load(Err("invalid magic"));
        let mut lifecycle = setup(&engine, &probe);
        let (_dir, log) = scratch_log();

        match lifecycle.ensure_ready(&log) {
            Err(SessionError::ModelLoad(msg)) => assert!(msg.contains("invalid magic")),
            other => panic!("expected ModelLoad, got {other:?}"),
        }
        assert!(!lifecycle.is_ready());
        assert_eq!(engine.live_handles(), 0);

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.contains("Erro ao inicializar modelo"));
        assert!(text.contains("invalid magic"));
    }

    #[test]
    fn test_memory_read_failure_leaves_nothing_loaded() {
        let probe = Arc::new(FakeProbe::new(0));
        probe.fail_reads("no procfs");
        let engine = ScriptedEngine::new();
        let mut lifecycle = setup(&engine, &probe);
        let (_dir, log) = scratch_log();

        assert!(matches!(lifecycle.ensure_ready(&log), Err(SessionError::MemoryRead(_))));
        assert!(!lifecycle.is_ready());
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn test_infer_requires_ready() {
        let probe = Arc::new(FakeProbe::new(0));
        let engine = ScriptedEngine::new();
        let mut lifecycle = setup(&engine, &probe);

        let err = lifecycle
            .infer("prompt", &GenerationParams::default())
            .unwrap_err();
        assert!(matches!(err, SessionError::Inference(_)));
        assert!(engine.prompts().is_empty());
    }

    #[test]
    fn test_infer_maps_engine_errors() {
        let probe = Arc::new(FakeProbe::new(0));
        let engine = ScriptedEngine::new();
        engine.push_completion(Err("decode failed"));
        let mut lifecycle = setup(&engine, &probe);
        let (_dir, log) = scratch_log();

        lifecycle.ensure_ready(&log).unwrap();
        match lifecycle.infer("p", &GenerationParams::default()) {
            Err(SessionError::Inference(msg)) => assert_eq!(msg, "decode failed"),
            other => panic!("expected Inference, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_releases_handle() {
        let probe = Arc::new(FakeProbe::new(0));
        let engine = ScriptedEngine::new();
        {
            let mut lifecycle = setup(&engine, &probe);
            let (_dir, log) = scratch_log();
            lifecycle.ensure_ready(&log).unwrap();
            assert_eq!(engine.live_handles(), 1);
        }
        assert_eq!(engine.live_handles(), 0);
    }
}
