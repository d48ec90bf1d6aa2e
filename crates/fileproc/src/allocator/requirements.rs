use serde::{Deserialize, Serialize};

use crate::models::ProcessingType;

/// Amounts along the four tracked resource dimensions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Resources {
    #[serde(default = "default_cpu")]
    pub cpu_cores: f64,
    #[serde(default = "default_memory")]
    pub memory_mb: u64,
    #[serde(default = "default_disk")]
    pub disk_mb: u64,
    #[serde(default = "default_network")]
    pub network_mbps: u64,
}

fn default_cpu() -> f64 {
    8.0
}

fn default_memory() -> u64 {
    16_384
}

fn default_disk() -> u64 {
    50_000
}

fn default_network() -> u64 {
    1_000
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu_cores: default_cpu(),
            memory_mb: default_memory(),
            disk_mb: default_disk(),
            network_mbps: default_network(),
        }
    }
}

// Float slack so that repeated add/subtract of CPU shares does not reject
// an exact fit.
const CPU_EPSILON: f64 = 1e-9;

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu_cores: 0.0,
        memory_mb: 0,
        disk_mb: 0,
        network_mbps: 0,
    };

    pub fn new(cpu_cores: f64, memory_mb: u64, disk_mb: u64, network_mbps: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            disk_mb,
            network_mbps,
        }
    }

    /// Whether `need` fits on every dimension.
    pub fn covers(&self, need: &Resources) -> bool {
        self.cpu_cores + CPU_EPSILON >= need.cpu_cores
            && self.memory_mb >= need.memory_mb
            && self.disk_mb >= need.disk_mb
            && self.network_mbps >= need.network_mbps
    }

    /// Subtraction floored at zero on every dimension.
    pub fn minus(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: (self.cpu_cores - other.cpu_cores).max(0.0),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
            network_mbps: self.network_mbps.saturating_sub(other.network_mbps),
        }
    }

    /// Addition capped at `max` on every dimension.
    pub fn plus_capped(&self, other: &Resources, max: &Resources) -> Resources {
        Resources {
            cpu_cores: (self.cpu_cores + other.cpu_cores).min(max.cpu_cores),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb).min(max.memory_mb),
            disk_mb: self.disk_mb.saturating_add(other.disk_mb).min(max.disk_mb),
            network_mbps: self
                .network_mbps
                .saturating_add(other.network_mbps)
                .min(max.network_mbps),
        }
    }

    fn plus(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores + other.cpu_cores,
            memory_mb: self.memory_mb + other.memory_mb,
            disk_mb: self.disk_mb + other.disk_mb,
            network_mbps: self.network_mbps + other.network_mbps,
        }
    }
}

/// What one job needs, and how long it is expected to hold it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirements {
    pub resources: Resources,
    pub estimated_duration_seconds: u64,
}

/// Per-step cost of a processing type.
pub fn requirements_for(processing_type: ProcessingType) -> ResourceRequirements {
    let (cpu, memory, disk, network, duration) = match processing_type {
        ProcessingType::ImageResize => (1.0, 512, 100, 10, 30),
        ProcessingType::ImageFormatConvert => (1.5, 1024, 200, 10, 45),
        ProcessingType::DocumentTextExtract => (0.5, 256, 50, 5, 60),
        ProcessingType::DocumentPdfGenerate => (1.0, 512, 100, 5, 90),
        ProcessingType::VideoThumbnail => (2.0, 2048, 500, 50, 120),
        ProcessingType::VideoCompress => (4.0, 4096, 1000, 100, 600),
        ProcessingType::ContentAnalysis => (1.0, 1024, 100, 10, 180),
        ProcessingType::Custom => (2.0, 2048, 500, 20, 300),
    };
    ResourceRequirements {
        resources: Resources::new(cpu, memory, disk, network),
        estimated_duration_seconds: duration,
    }
}

/// Sum of every step's resources; duration is the longest single step.
pub fn total_requirements(processing_types: &[ProcessingType]) -> ResourceRequirements {
    processing_types.iter().fold(
        ResourceRequirements {
            resources: Resources::ZERO,
            estimated_duration_seconds: 0,
        },
        |acc, t| {
            let req = requirements_for(*t);
            ResourceRequirements {
                resources: acc.resources.plus(&req.resources),
                estimated_duration_seconds: acc
                    .estimated_duration_seconds
                    .max(req.estimated_duration_seconds),
            }
        },
    )
}

/// Complexity contribution to the priority score: Σ(cpu + memory/1024), capped at 20.
pub fn complexity_bonus(processing_types: &[ProcessingType]) -> f64 {
    let raw: f64 = processing_types
        .iter()
        .map(|t| {
            let r = requirements_for(*t).resources;
            r.cpu_cores + r.memory_mb as f64 / 1024.0
        })
        .sum();
    raw.min(20.0)
}
