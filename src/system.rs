use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use sysinfo::{Disks, ProcessesToUpdate, System};

use crate::health::{DiskStats, MemoryStats, ProcessStats, SystemMetrics};

/// Source of host resource readings.
///
/// The monitor only depends on this trait so readings can be scripted in tests.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn sample(&self) -> anyhow::Result<SystemMetrics>;
}

/// Reads host metrics through `sysinfo`.
///
/// CPU usage is the delta between two refreshes, so the very first sample after construction
/// may read low; later samples cover the time since the previous monitor cycle.
pub struct SysinfoProbe {
    sys: Arc<Mutex<System>>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self {
            sys: Arc::new(Mutex::new(sys)),
        }
    }
}

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn sample(&self) -> anyhow::Result<SystemMetrics> {
        let sys = self.sys.clone();
        tokio::task::spawn_blocking(move || {
            let mut sys = sys.lock().unwrap_or_else(PoisonError::into_inner);
            read_metrics(&mut sys)
        })
        .await
        .context("system probe task failed")
    }
}

fn read_metrics(sys: &mut System) -> SystemMetrics {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total = sys.total_memory();
    let used = sys.used_memory();
    let memory = MemoryStats {
        total_bytes: total,
        used_bytes: used,
        free_bytes: sys.free_memory(),
        usage_percent: percent(used, total),
    };

    let load = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        load_average: [load.one, load.five, load.fifteen],
        cores: num_cpus::get(),
        memory,
        disk: root_disk(),
        process: current_process(sys),
        uptime_seconds: System::uptime(),
    }
}

fn root_disk() -> Option<DiskStats> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().iter().max_by_key(|d| d.total_space()))?;

    let total = disk.total_space();
    let available = disk.available_space();
    Some(DiskStats {
        total_bytes: total,
        available_bytes: available,
        usage_percent: percent(total.saturating_sub(available), total),
    })
}

fn current_process(sys: &mut System) -> Option<ProcessStats> {
    let pid = sysinfo::get_current_pid().ok()?;
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let process = sys.process(pid)?;
    Some(ProcessStats {
        pid: pid.as_u32(),
        cpu_percent: process.cpu_usage(),
        memory_bytes: process.memory(),
    })
}

fn percent(part: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64 * 100.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }

    #[tokio::test]
    async fn sysinfo_probe_reports_cores_and_memory() -> anyhow::Result<()> {
        let metrics = SysinfoProbe::new().sample().await?;
        assert!(metrics.cores >= 1);
        assert!(metrics.memory.total_bytes > 0);
        assert!((0.0..=100.0).contains(&metrics.memory.usage_percent));
        Ok(())
    }
}
