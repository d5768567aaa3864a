use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuUsageSnapshot {
    pub overall: f32,
    pub per_core: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsageSnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

pub fn sample_cpu_usage() -> CpuUsageSnapshot {
    // One System instance for the process so sysinfo's internal baselines
    // are warmed once instead of on every stats call.
    static SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();

    let mut sys = SYSTEM
        .get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_cpu_usage();
            Mutex::new(sys)
        })
        .lock()
        .expect("cpu System mutex poisoned");
    sys.refresh_cpu_usage();

    let per_core: Vec<f32> = sys.cpus().iter().map(|c| c.cpu_usage()).collect();
    let overall = if per_core.is_empty() {
        0.0
    } else {
        per_core.iter().copied().sum::<f32>() / per_core.len() as f32
    };

    CpuUsageSnapshot { overall, per_core }
}

pub fn sample_memory_usage() -> MemoryUsageSnapshot {
    static SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();

    let mut sys = SYSTEM
        .get_or_init(|| Mutex::new(System::new()))
        .lock()
        .expect("memory System mutex poisoned");
    sys.refresh_memory();

    MemoryUsageSnapshot {
        total_bytes: sys.total_memory(),
        used_bytes: sys.used_memory(),
    }
}
