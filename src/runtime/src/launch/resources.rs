//! Guest sizing from explicit overrides, cgroup limits and defaults.

use std::path::Path;

/// vCPUs when neither an override nor a CPU limit applies.
pub const DEFAULT_VCPUS: u32 = 2;

/// Memory (MiB) when neither an override nor a memory limit applies.
pub const DEFAULT_MEM_MIB: u32 = 1024;

/// cgroup v1 reports "no limit" as the largest page-aligned i64.
const V1_UNLIMITED_MEMORY: u64 = 9_223_372_036_854_771_712;

const MIB: u64 = 1024 * 1024;

/// Limits imposed on the launcher's cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupLimits {
    /// CPU bandwidth as (quota, period) in microseconds
    pub cpu: Option<(u64, u64)>,
    /// Memory limit in bytes
    pub memory_bytes: Option<u64>,
}

impl CgroupLimits {
    /// Read limits from a cgroup filesystem mounted at `root`.
    ///
    /// v2 (`cpu.max`, `memory.max`) is preferred; v1 controller
    /// directories are used otherwise. Unreadable files mean no limit.
    pub fn read(root: &Path) -> Self {
        if root.join("cpu.max").exists() || root.join("memory.max").exists() {
            return Self {
                cpu: read(root, "cpu.max").and_then(|v| parse_v2_cpu(&v)),
                memory_bytes: read(root, "memory.max").and_then(|v| parse_v2_memory(&v)),
            };
        }

        let quota = read(root, "cpu/cpu.cfs_quota_us")
            .or_else(|| read(root, "cpu,cpuacct/cpu.cfs_quota_us"));
        let period = read(root, "cpu/cpu.cfs_period_us")
            .or_else(|| read(root, "cpu,cpuacct/cpu.cfs_period_us"));
        let memory = read(root, "memory/memory.limit_in_bytes");
        Self {
            cpu: match (quota, period) {
                (Some(q), Some(p)) => parse_v1_cpu(&q, &p),
                _ => None,
            },
            memory_bytes: memory.and_then(|v| parse_v1_memory(&v)),
        }
    }

    /// vCPUs allowed by the CPU quota, rounded up.
    pub fn vcpus(&self) -> Option<u32> {
        let (quota, period) = self.cpu?;
        if period == 0 {
            return None;
        }
        u32::try_from(quota.div_ceil(period)).ok().map(|n| n.max(1))
    }

    /// Memory limit in whole MiB.
    pub fn mem_mib(&self) -> Option<u32> {
        let bytes = self.memory_bytes?;
        u32::try_from(bytes / MIB).ok().filter(|m| *m > 0)
    }
}

fn read(root: &Path, file: &str) -> Option<String> {
    std::fs::read_to_string(root.join(file)).ok()
}

fn parse_v2_cpu(value: &str) -> Option<(u64, u64)> {
    let mut parts = value.split_whitespace();
    let quota = parts.next()?;
    if quota == "max" {
        return None;
    }
    let period = parts.next().unwrap_or("100000");
    Some((quota.parse().ok()?, period.parse().ok()?))
}

fn parse_v2_memory(value: &str) -> Option<u64> {
    let value = value.trim();
    if value == "max" {
        return None;
    }
    value.parse().ok()
}

fn parse_v1_cpu(quota: &str, period: &str) -> Option<(u64, u64)> {
    let quota: i64 = quota.trim().parse().ok()?;
    if quota < 0 {
        return None;
    }
    Some((quota as u64, period.trim().parse().ok()?))
}

fn parse_v1_memory(value: &str) -> Option<u64> {
    let bytes: u64 = value.trim().parse().ok()?;
    (bytes < V1_UNLIMITED_MEMORY).then_some(bytes)
}

/// Final guest sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePlan {
    pub vcpus: u32,
    pub mem_mib: u32,
    pub ht_enabled: bool,
}

impl ResourcePlan {
    /// Override beats cgroup limit beats default, independently per resource.
    pub fn resolve(
        vcpu_override: Option<u32>,
        mem_override_mib: Option<u32>,
        ht_enabled: bool,
        limits: &CgroupLimits,
    ) -> Self {
        Self {
            vcpus: vcpu_override
                .or_else(|| limits.vcpus())
                .unwrap_or(DEFAULT_VCPUS),
            mem_mib: mem_override_mib
                .or_else(|| limits.mem_mib())
                .unwrap_or(DEFAULT_MEM_MIB),
            ht_enabled,
        }
    }
}
