use std::path::{Path, PathBuf};

use serde::Serialize;

/// Host-level load, in percent.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// One-minute load average divided by the CPU count.
    pub load_average: f64,
}

pub trait SystemProbe: Send + Sync {
    fn sample(&self) -> SystemMetrics;
}

/// Reads `/proc/loadavg` and `/proc/meminfo`. Reports zeros where those are
/// unavailable.
#[derive(Debug, Clone)]
pub struct ProcProbe {
    root: PathBuf,
    cpus: usize,
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcProbe {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            cpus: num_cpus::get().max(1),
        }
    }

    fn load_per_cpu(&self) -> Option<f64> {
        let raw = std::fs::read_to_string(self.root.join("loadavg")).ok()?;
        let one_minute: f64 = raw.split_whitespace().next()?.parse().ok()?;
        Some(one_minute / self.cpus as f64)
    }

    fn memory_percent(&self) -> Option<f64> {
        let raw = std::fs::read_to_string(self.root.join("meminfo")).ok()?;
        let field = |name: &str| -> Option<f64> {
            raw.lines()
                .find(|l| l.starts_with(name))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()
        };
        let total = field("MemTotal:")?;
        let available = field("MemAvailable:")?;
        if total <= 0.0 {
            return None;
        }
        Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
    }
}

impl SystemProbe for ProcProbe {
    fn sample(&self) -> SystemMetrics {
        let load_average = self.load_per_cpu().unwrap_or(0.0);
        SystemMetrics {
            cpu_usage: (load_average * 100.0).clamp(0.0, 100.0),
            memory_usage: self.memory_percent().unwrap_or(0.0),
            load_average,
        }
    }
}

/// Probe that always reports the same numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe(pub SystemMetrics);

impl SystemProbe for FixedProbe {
    fn sample(&self) -> SystemMetrics {
        self.0
    }
}
