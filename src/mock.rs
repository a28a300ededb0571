//! Scripted engine and memory probe used to exercise the session manager
//! without a model file.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::{Completion, GenerationParams, InferenceEngine, LoadedModel, ModelSpec};
use crate::memory::{MemoryProbe, BYTES_TO_MB};

/// Memory probe with a settable reading.
#[derive(Debug, Default)]
pub struct FakeProbe {
    bytes: AtomicU64,
    failure: Mutex<Option<String>>,
    reclaims: AtomicUsize,
}

impl FakeProbe {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
            ..Default::default()
        }
    }

    pub fn set_resident_mb(&self, mb: f64) {
        self.bytes.store((mb * BYTES_TO_MB) as u64, Ordering::SeqCst);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn sub_bytes(&self, bytes: u64) {
        let _ = self
            .bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| Some(b.saturating_sub(bytes)));
    }

    /// Make every following read fail with `msg`.
    pub fn fail_reads(&self, msg: &str) {
        if let Ok(mut f) = self.failure.lock() {
            *f = Some(msg.to_string());
        }
    }

    pub fn reclaim_count(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl MemoryProbe for FakeProbe {
    fn resident_bytes(&self) -> Result<u64, String> {
        if let Some(msg) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(msg);
        }
        Ok(self.bytes.load(Ordering::SeqCst))
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Script {
    loads: VecDeque<Result<(), String>>,
    completions: VecDeque<Result<String, String>>,
    load_count: usize,
    live_handles: usize,
    prompts: Vec<String>,
    params: Vec<GenerationParams>,
    reclaims_at_completion: Vec<usize>,
}

/// Engine whose load and completion outcomes are queued up front.
///
/// Once a queue is empty, loads succeed and completions answer "ok".
/// Clones share the same script, so a test can keep one to inspect.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
    probe: Option<Arc<FakeProbe>>,
    load_bytes: u64,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            probe: None,
            load_bytes: 0,
        }
    }

    /// Each successful load grows `probe` by `load_bytes`; dropping the
    /// handle gives them back.
    pub fn with_memory(mut self, probe: Arc<FakeProbe>, load_bytes: u64) -> Self {
        self.probe = Some(probe);
        self.load_bytes = load_bytes;
        self
    }

    pub fn push_load(&self, result: Result<(), &str>) -> &Self {
        self.script
            .lock()
            .expect("script lock")
            .loads
            .push_back(result.map_err(str::to_string));
        self
    }

    pub fn push_completion(&self, result: Result<&str, &str>) -> &Self {
        self.script
            .lock()
            .expect("script lock")
            .completions
            .push_back(result.map(str::to_string).map_err(str::to_string));
        self
    }

    pub fn load_count(&self) -> usize {
        self.script.lock().expect("script lock").load_count
    }

    pub fn live_handles(&self) -> usize {
        self.script.lock().expect("script lock").live_handles
    }

    pub fn prompts(&self) -> Vec<String> {
        self.script.lock().expect("script lock").prompts.clone()
    }

    pub fn params(&self) -> Vec<GenerationParams> {
        self.script.lock().expect("script lock").params.clone()
    }

    /// Probe reclaim count observed at the start of each completion.
    pub fn reclaims_at_completion(&self) -> Vec<usize> {
        self.script.lock().expect("script lock").reclaims_at_completion.clone()
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for ScriptedEngine {
    type Handle = ScriptedHandle;

    fn load(&self, spec: &ModelSpec) -> Result<ScriptedHandle, String> {
        let mut script = self.script.lock().map_err(|_| "script poisoned".to_string())?;
        script.loads.pop_front().unwrap_or(Ok(())).map_err(|e| {
            format!("Failed to load model from {}: {e}", spec.path.display())
        })?;
        script.load_count += 1;
        script.live_handles += 1;
        if let Some(probe) = &self.probe {
            probe.add_bytes(self.load_bytes);
        }
        Ok(ScriptedHandle {
            script: self.script.clone(),
            probe: self.probe.clone(),
            bytes: self.load_bytes,
        })
    }
}

#[derive(Debug)]
pub struct ScriptedHandle {
    script: Arc<Mutex<Script>>,
    probe: Option<Arc<FakeProbe>>,
    bytes: u64,
}

impl LoadedModel for ScriptedHandle {
    fn complete(&mut self, prompt: &str, params: &GenerationParams) -> Result<Completion, String> {
        let mut script = self.script.lock().map_err(|_| "script poisoned".to_string())?;
        script.prompts.push(prompt.to_string());
        script.params.push(params.clone());
        if let Some(probe) = &self.probe {
            script.reclaims_at_completion.push(probe.reclaim_count());
        }
        let text = script.completions.pop_front().unwrap_or_else(|| Ok("ok".to_string()))?;
        Ok(Completion::single(text))
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        if let Ok(mut script) = self.script.lock() {
            script.live_handles = script.live_handles.saturating_sub(1);
        }
        if let Some(probe) = &self.probe {
            probe.sub_bytes(self.bytes);
        }
    }
}
