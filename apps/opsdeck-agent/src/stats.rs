use opsdeck_shared::api::{AgentStats, CpuStats, DiskStats, MemoryStats, NetworkStats};
use sysinfo::{Disks, Networks, System};
use tokio::sync::Mutex;

/// Collect the current system statistics in the agent wire shape.
pub async fn collect(sys: &Mutex<System>, server_id: &str) -> AgentStats {
    let (cpu, memory) = {
        let mut sys = sys.lock().await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let load = System::load_average();
        let cpu = CpuStats {
            percent: sys.global_cpu_usage() as f64,
            count: Some(sys.cpus().len() as u32),
            load_avg: Some(vec![load.one, load.five, load.fifteen]),
        };

        let total = sys.total_memory();
        let used = sys.used_memory();
        let memory = MemoryStats {
            percent: if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            total,
            used,
            available: sys.available_memory(),
        };

        (cpu, memory)
    };

    AgentStats {
        timestamp: Some(chrono::Utc::now().to_rfc3339()),
        server_id: Some(server_id.to_string()),
        cpu,
        memory,
        disk: disk_stats(),
        network: network_stats(),
        uptime: System::uptime() as f64,
        agent_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    }
}

/// Root filesystem usage; falls back to the largest disk when nothing is
/// mounted at "/" (containers, unusual layouts).
fn disk_stats() -> DiskStats {
    let disks = Disks::new_with_refreshed_list();

    let mut total = 0u64;
    let mut free = 0u64;
    for disk in disks.list() {
        if disk.mount_point() == std::path::Path::new("/") {
            total = disk.total_space();
            free = disk.available_space();
            break;
        }
    }
    if total == 0 {
        if let Some(disk) = disks.list().iter().max_by_key(|d| d.total_space()) {
            total = disk.total_space();
            free = disk.available_space();
        }
    }

    let used = total.saturating_sub(free);
    DiskStats {
        percent: if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        },
        total,
        used,
        free,
    }
}

/// Totals across all interfaces, mirroring psutil's net_io_counters.
fn network_stats() -> NetworkStats {
    let networks = Networks::new_with_refreshed_list();

    let mut stats = NetworkStats {
        bytes_sent: 0,
        bytes_recv: 0,
        packets_sent: 0,
        packets_recv: 0,
    };
    for (_name, data) in networks.list() {
        stats.bytes_sent += data.total_transmitted();
        stats.bytes_recv += data.total_received();
        stats.packets_sent += data.total_packets_transmitted();
        stats.packets_recv += data.total_packets_received();
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysinfo::System;

    #[tokio::test]
    async fn collect_produces_sane_percentages() {
        let mut sys = System::new_all();
        sys.refresh_all();
        let sys = Mutex::new(sys);

        let stats = collect(&sys, "test-server").await;

        assert_eq!(stats.server_id.as_deref(), Some("test-server"));
        assert!(stats.memory.total > 0);
        assert!((0.0..=100.0).contains(&stats.memory.percent));
        assert!((0.0..=100.0).contains(&stats.disk.percent));
        assert!(stats.cpu.count.unwrap_or(0) > 0);
        assert!(stats.uptime >= 0.0);
    }
}
