use async_trait::async_trait;
use sysinfo::{Disks, System};
use tokio::sync::Mutex;

use super::types::ResourceMonitor;
use crate::scheduler::types::{CpuStat, DiskStat, MemoryStat, Resources};

/// Reads host resources through `sysinfo`.
pub struct SysinfoMonitor {
    system: Mutex<System>,
}

impl SysinfoMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        SysinfoMonitor {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn get_stats(system: &System, disks: &Disks) -> Resources {
    let (total_space, available_space) = disks.iter().fold((0, 0), |(total, available), disk| {
        (total + disk.total_space(), available + disk.available_space())
    });

    Resources {
        cpu: CpuStat {
            cores: system.cpus().len() as u64,
            usage: (system.global_cpu_usage() * 100.0).round() / 100.0,
        },
        memory: MemoryStat {
            total: system.total_memory(),
            available: system.available_memory(),
        },
        disk: DiskStat {
            total: total_space,
            available: available_space,
        },
    }
}

#[async_trait]
impl ResourceMonitor for SysinfoMonitor {
    async fn resources(&self) -> Resources {
        let mut system = self.system.lock().await;
        system.refresh_cpu_usage();
        system.refresh_memory();
        get_stats(&system, &Disks::new_with_refreshed_list())
    }
}

/// Reports a fixed amount of resources.
pub struct StaticMonitor(pub Resources);

#[async_trait]
impl ResourceMonitor for StaticMonitor {
    async fn resources(&self) -> Resources {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_host_memory_and_cores() {
        let resources = SysinfoMonitor::new().resources().await;
        assert!(resources.cpu.cores >= 1);
        assert!(resources.memory.total > 0);
        assert!(resources.memory.available <= resources.memory.total);
    }
}
