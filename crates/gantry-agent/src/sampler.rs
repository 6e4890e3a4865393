//! Local resource sampling via `sysinfo`.

use std::path::{Path, PathBuf};

use gantry_state::ResourceSnapshot;
use sysinfo::{Disks, Networks, Pid, System};

const MB: u64 = 1024 * 1024;

/// Samples the node's CPU, memory, disk, and network counters.
///
/// Keeps the `sysinfo` handles alive between samples so CPU usage is
/// measured as a delta from the previous tick rather than since boot.
/// The first sample after construction reports near-zero CPU.
pub struct ResourceSampler {
    sys: System,
    disks: Disks,
    networks: Networks,
    data_dir: PathBuf,
}

impl ResourceSampler {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            sys: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Take a fresh node-level snapshot.
    pub fn sample(&mut self) -> ResourceSnapshot {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.disks.refresh();
        self.networks.refresh();

        let (disk_total_mb, disk_used_mb) = self.data_disk();
        let (network_rx_bytes, network_tx_bytes) = self.network_totals();

        ResourceSnapshot {
            cpu_cores: self.sys.cpus().len() as u32,
            cpu_usage_percent: self.sys.global_cpu_info().cpu_usage() as f64,
            memory_total_mb: self.sys.total_memory() / MB,
            memory_used_mb: self.sys.used_memory() / MB,
            disk_total_mb,
            disk_used_mb,
            network_rx_bytes,
            network_tx_bytes,
        }
    }

    /// CPU percent and resident memory for one process, if it is alive.
    pub fn process_stats(&mut self, pid: u32) -> Option<(f64, u64)> {
        let pid = Pid::from_u32(pid);
        if !self.sys.refresh_process(pid) {
            return None;
        }
        self.sys
            .process(pid)
            .map(|p| (p.cpu_usage() as f64, p.memory()))
    }

    /// Totals for the filesystem holding the server data directory: the
    /// mount whose path is the longest prefix of `data_dir`.
    fn data_disk(&self) -> (u64, u64) {
        let mut best: Option<&sysinfo::Disk> = None;
        for disk in self.disks.list() {
            if self.data_dir.starts_with(disk.mount_point()) {
                let longer = best.map_or(true, |b| {
                    disk.mount_point().as_os_str().len() > b.mount_point().as_os_str().len()
                });
                if longer {
                    best = Some(disk);
                }
            }
        }
        match best {
            Some(disk) => {
                let total = disk.total_space() / MB;
                let used = disk.total_space().saturating_sub(disk.available_space()) / MB;
                (total, used)
            }
            None => (0, 0),
        }
    }

    fn network_totals(&self) -> (u64, u64) {
        let mut rx = 0u64;
        let mut tx = 0u64;
        for (_name, data) in self.networks.list() {
            rx = rx.saturating_add(data.total_received());
            tx = tx.saturating_add(data.total_transmitted());
        }
        (rx, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_sane_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = ResourceSampler::new(dir.path());
        let snap = sampler.sample();

        assert!(snap.cpu_cores > 0);
        assert!(snap.memory_total_mb > 0);
        assert!(snap.memory_used_mb <= snap.memory_total_mb);
        assert!((0.0..=100.0).contains(&snap.cpu_usage_percent));
        assert!(snap.disk_used_mb <= snap.disk_total_mb);
    }

    #[test]
    fn network_counters_do_not_go_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = ResourceSampler::new(dir.path());
        let first = sampler.sample();
        let second = sampler.sample();
        assert!(second.network_rx_bytes >= first.network_rx_bytes);
        assert!(second.network_tx_bytes >= first.network_tx_bytes);
    }

    #[test]
    fn process_stats_for_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = ResourceSampler::new(dir.path());
        let (cpu, memory) = sampler
            .process_stats(std::process::id())
            .expect("own process is alive");
        assert!(cpu >= 0.0);
        assert!(memory > 0);
    }

    #[test]
    fn process_stats_for_dead_pid_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = ResourceSampler::new(dir.path());
        // PIDs near u32::MAX are not valid on any supported platform.
        assert!(sampler.process_stats(u32::MAX - 1).is_none());
    }
}
