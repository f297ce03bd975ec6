//! Device snapshot collection.
//!
//! Produces the read-only key/value bag attached to manifest requests and
//! exposed to scripts through the `dev` module. Host facts come from
//! `sysinfo`; anything unavailable is simply omitted.

use std::path::{Path, PathBuf};

use fleet_proto::{keys, DeviceSnapshot};
use sysinfo::{Disks, Networks, System};

/// Identity-related inputs to a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotContext<'a> {
    pub node_id: &'a str,
    pub working_dir: &'a Path,
    pub channel: Option<&'a str>,
}

/// Capacity of one mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountUsage {
    mount_point: PathBuf,
    total: u64,
    available: u64,
}

/// Collect a snapshot of this host.
pub fn collect(ctx: &SnapshotContext<'_>) -> DeviceSnapshot {
    let sys = System::new_all();

    let mut snapshot = DeviceSnapshot::new()
        .with(keys::UUID, ctx.node_id)
        .with(keys::OS, std::env::consts::OS)
        .with(keys::PLATFORM, std::env::consts::FAMILY)
        .with(keys::ARCH, std::env::consts::ARCH)
        .with(keys::CPU_CORES, cpu_count(&sys))
        .with(keys::BOOT_TIME, System::boot_time())
        .with(keys::WORKING_DIR, ctx.working_dir.display())
        .with(keys::VERSION, env!("CARGO_PKG_VERSION"));

    if let Some(hostname) = System::host_name().filter(|h| !h.trim().is_empty()) {
        snapshot.insert(keys::HOSTNAME, hostname.trim());
    }
    if let Some(version) = System::os_version() {
        snapshot.insert(keys::PLATFORM_VERSION, version);
    }
    if let Some(channel) = ctx.channel.filter(|c| !c.is_empty()) {
        snapshot.insert(keys::CHANNEL, channel);
    }

    if let Some(cpu) = sys.cpus().first() {
        snapshot.insert(keys::CPU_MODULE_NAME, cpu.brand().trim());
        snapshot.insert(keys::CPU_MHZ, cpu.frequency());
    }
    snapshot.insert(
        keys::CPU_USAGE,
        format!("{:.2}", sys.global_cpu_info().cpu_usage()),
    );

    if sys.total_memory() > 0 {
        snapshot.insert(keys::TOTAL_MEMORY, sys.total_memory());
        snapshot.insert(keys::AVAILABLE_MEMORY, sys.available_memory());
        snapshot.insert(keys::USED_MEMORY, sys.used_memory());
    }

    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<MountUsage> = disks
        .list()
        .iter()
        .map(|disk| MountUsage {
            mount_point: disk.mount_point().to_path_buf(),
            total: disk.total_space(),
            available: disk.available_space(),
        })
        .collect();
    if let Some(usage) = usage_for(&absolute(ctx.working_dir), &mounts) {
        snapshot.insert(keys::TOTAL_DISK, usage.total);
        snapshot.insert(keys::FREE_DISK, usage.available);
    }

    let networks = Networks::new_with_refreshed_list();
    let macs = format_macs(
        networks
            .iter()
            .filter(|(_, data)| !data.mac_address().is_unspecified())
            .map(|(name, data)| (name.as_str(), data.mac_address().to_string())),
    );
    if !macs.is_empty() {
        snapshot.insert(keys::MACS, macs);
    }

    snapshot
}

fn cpu_count(sys: &System) -> usize {
    match sys.cpus().len() {
        0 => std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1),
        n => n,
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::env::current_dir().map(|cwd| cwd.join(path)))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// The filesystem holding `path`: the mount with the longest matching prefix.
fn usage_for<'a>(path: &Path, mounts: &'a [MountUsage]) -> Option<&'a MountUsage> {
    mounts
        .iter()
        .filter(|m| m.total > 0 && path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
}

/// `name:mac` pairs joined by commas, sorted by interface name.
fn format_macs<'a>(interfaces: impl Iterator<Item = (&'a str, String)>) -> String {
    let mut pairs: Vec<(&str, String)> = interfaces.collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, mac)| format!("{name}:{mac}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(point: &str, total: u64) -> MountUsage {
        MountUsage {
            mount_point: PathBuf::from(point),
            total,
            available: total / 2,
        }
    }

    #[test]
    fn test_collect_includes_identity() {
        let dir = Path::new("/var/lib/fleet");
        let snapshot = collect(&SnapshotContext {
            node_id: "node-1",
            working_dir: dir,
            channel: Some("beta"),
        });

        assert_eq!(snapshot.uuid(), Some("node-1"));
        assert_eq!(snapshot.get(keys::CHANNEL), Some("beta"));
        assert_eq!(snapshot.get(keys::OS), Some(std::env::consts::OS));
        assert!(snapshot.get_parsed::<usize>(keys::CPU_CORES).unwrap() >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_collect_reports_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = collect(&SnapshotContext {
            node_id: "node-1",
            working_dir: dir.path(),
            channel: None,
        });

        assert!(snapshot.get_parsed::<u64>(keys::TOTAL_MEMORY).unwrap() > 0);
        let total = snapshot.get_parsed::<u64>(keys::TOTAL_DISK).unwrap();
        let free = snapshot.get_parsed::<u64>(keys::FREE_DISK).unwrap();
        assert!(total > 0);
        assert!(free <= total);
        assert!(snapshot.get_parsed::<u64>(keys::BOOT_TIME).is_some());
    }

    #[test]
    fn test_empty_channel_omitted() {
        let snapshot = collect(&SnapshotContext {
            node_id: "node-1",
            working_dir: Path::new("."),
            channel: Some(""),
        });
        assert_eq!(snapshot.get(keys::CHANNEL), None);
    }

    #[test]
    fn test_usage_prefers_deepest_mount() {
        let mounts = vec![mount("/", 100), mount("/data", 500), mount("/data/tmp", 0)];

        let usage = usage_for(Path::new("/data/tmp/fleet"), &mounts).unwrap();
        assert_eq!(usage.total, 500);
        assert_eq!(usage_for(Path::new("/srv"), &mounts).unwrap().total, 100);
        assert_eq!(usage_for(Path::new("/srv"), &[]), None);
    }

    #[test]
    fn test_usage_does_not_match_partial_component() {
        let mounts = vec![mount("/", 100), mount("/data", 500)];
        assert_eq!(usage_for(Path::new("/database"), &mounts).unwrap().total, 100);
    }

    #[test]
    fn test_format_macs_sorted() {
        let macs = format_macs(
            [
                ("eth1", "aa:bb:cc:dd:ee:02".to_string()),
                ("eth0", "aa:bb:cc:dd:ee:01".to_string()),
            ]
            .into_iter(),
        );
        assert_eq!(macs, "eth0:aa:bb:cc:dd:ee:01,eth1:aa:bb:cc:dd:ee:02");
        assert_eq!(format_macs(std::iter::empty()), "");
    }
}
