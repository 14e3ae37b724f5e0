use std::sync::{Arc, Mutex};

use sysinfo::{Pid, Process, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Raw numbers read from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostSample {
    /// This process's CPU share of the whole machine, 0–100.
    pub cpu_percent: f64,
    /// Resident memory of this process.
    pub memory_mb: f64,
    pub memory_total_mb: f64,
    /// One-minute load average; 0 where unsupported.
    pub load_average: f64,
}

/// Source of host usage samples.
pub trait UsageSampler: Send {
    fn sample(&mut self) -> HostSample;
}

/// Samples the current process with `sysinfo`.
pub struct HostSampler {
    system: System,
    pid: Option<Pid>,
    cores: f64,
}

impl std::fmt::Debug for HostSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSampler")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        Self {
            system,
            pid: sysinfo::get_current_pid().ok(),
            cores,
        }
    }
}

impl UsageSampler for HostSampler {
    fn sample(&mut self) -> HostSample {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        if let Some(pid) = self.pid {
            self.system
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }
        let process = self.pid.and_then(|pid| self.system.process(pid));

        // Per-process CPU is reported per core; fall back to the global
        // figure if our own process can't be found.
        let cpu_percent = match process {
            Some(p) => f64::from(p.cpu_usage()) / self.cores,
            None => f64::from(self.system.global_cpu_usage()),
        };
        let rss = process.map(Process::memory).unwrap_or(0);

        let load = System::load_average();
        HostSample {
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            memory_mb: rss as f64 / BYTES_PER_MB,
            memory_total_mb: self.system.total_memory() as f64 / BYTES_PER_MB,
            load_average: if load.one >= 0.0 { load.one } else { 0.0 },
        }
    }
}

/// Reports whatever sample it was last given. Useful for pinning usage in
/// tests and for hosts where sampling is undesirable.
#[derive(Debug, Clone, Default)]
pub struct StaticSampler {
    sample: Arc<Mutex<HostSample>>,
}

impl StaticSampler {
    pub fn new(sample: HostSample) -> Self {
        Self {
            sample: Arc::new(Mutex::new(sample)),
        }
    }

    /// An idle host with plenty of memory.
    pub fn idle() -> Self {
        Self::new(HostSample {
            memory_total_mb: 16_384.0,
            ..Default::default()
        })
    }

    /// Replace the reported sample. Clones share the same value.
    pub fn set(&self, sample: HostSample) {
        *self.sample.lock().unwrap_or_else(|p| p.into_inner()) = sample;
    }

    pub fn get(&self) -> HostSample {
        *self.sample.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl UsageSampler for StaticSampler {
    fn sample(&mut self) -> HostSample {
        self.get()
    }
}
