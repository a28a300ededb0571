use std::sync::{Arc, Mutex};

use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::SessionError;

/// Default resident-memory threshold above which an attempt is considered
/// under pressure.
pub const DEFAULT_MEMORY_THRESHOLD_MB: f64 = 6000.0;

pub const BYTES_TO_MB: f64 = 1024.0 * 1024.0;

/// Source of process memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size of the current process, in bytes.
    fn resident_bytes(&self) -> Result<u64, String>;

    /// Ask the allocator to hand unused pages back to the OS.
    fn reclaim(&self) {
        release_extra_memory();
    }
}

/// Best-effort "release extra memory" hint.
///
/// Only glibc exposes a way to compact the heap on demand (`malloc_trim`);
/// on every other target this does nothing.
pub fn release_extra_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim only walks allocator arenas; it takes no pointers.
        let trimmed = unsafe { libc::malloc_trim(0) };
        log::debug!("malloc_trim released memory: {}", trimmed != 0);
    }
}

/// Reads the RSS of this process through `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Result<Self, String> {
        let pid = sysinfo::get_current_pid().map_err(|e| format!("Cannot resolve own pid: {e}"))?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
        })
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&self) -> Result<u64, String> {
        let mut sys = self
            .system
            .lock()
            .map_err(|_| "Failed to lock sysinfo state".to_string())?;
        sys.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        sys.process(self.pid)
            .map(|p| p.memory())
            .ok_or_else(|| format!("Process {} not found", self.pid))
    }
}

/// Classifies current process memory against a fixed threshold.
#[derive(Clone)]
pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    threshold_mb: f64,
}

impl MemoryMonitor {
    pub fn new(probe: Arc<dyn MemoryProbe>, threshold_mb: f64) -> Self {
        Self { probe, threshold_mb }
    }

    /// Monitor backed by the live process reading.
    pub fn for_current_process(threshold_mb: f64) -> Result<Self, SessionError> {
        let probe = SysinfoProbe::new().map_err(SessionError::MemoryRead)?;
        Ok(Self::new(Arc::new(probe), threshold_mb))
    }

    pub fn threshold_mb(&self) -> f64 {
        self.threshold_mb
    }

    /// Current resident memory in megabytes.
    pub fn current_usage(&self) -> Result<f64, SessionError> {
        let bytes = self.probe.resident_bytes().map_err(SessionError::MemoryRead)?;
        Ok(bytes as f64 / BYTES_TO_MB)
    }

    pub fn is_critical(&self) -> Result<bool, SessionError> {
        Ok(self.current_usage()? > self.threshold_mb)
    }

    pub fn reclaim(&self) {
        self.probe.reclaim();
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("threshold_mb", &self.threshold_mb)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FakeProbe;

    #[test]
    fn test_usage_is_reported_in_megabytes() {
        let probe = Arc::new(FakeProbe::new(512 * 1024 * 1024));
        let monitor = MemoryMonitor::new(probe, DEFAULT_MEMORY_THRESHOLD_MB);
        assert_eq!(monitor.current_usage().unwrap(), 512.0);
    }

    #[test]
    fn test_threshold_is_strictly_greater() {
        let probe = Arc::new(FakeProbe::new(6000 * 1024 * 1024));
        let monitor = MemoryMonitor::new(probe.clone(), DEFAULT_MEMORY_THRESHOLD_MB);
        assert!(!monitor.is_critical().unwrap());

        probe.set_resident_mb(6001.0);
        assert!(monitor.is_critical().unwrap());
    }

    #[test]
    fn test_read_failure_is_not_zero() {
        let probe = Arc::new(FakeProbe::new(0));
        probe.fail_reads("procfs unavailable");
        let monitor = MemoryMonitor::new(probe, 1.0);

        match monitor.is_critical() {
            Err(SessionError::MemoryRead(msg)) => assert!(msg.contains("procfs")),
            other => panic!("expected MemoryRead, got {other:?}"),
        }
    }

    #[test]
    fn test_reclaim_reaches_probe() {
        let probe = Arc::new(FakeProbe::new(0));
        let monitor = MemoryMonitor::new(probe.clone(), 1.0);
        monitor.reclaim();
        monitor.reclaim();
        assert_eq!(probe.reclaim_count(), 2);
    }

    #[test]
    fn test_sysinfo_reads_own_process() {
        let probe = SysinfoProbe::new().unwrap();
        assert!(probe.resident_bytes().unwrap() > 0);
    }
}
