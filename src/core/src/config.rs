//! Build and launch configuration.
//!
//! Launch-time settings are read from `FIREBOX_*` environment variables so
//! the launcher can be driven by a container runtime without extra flags.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::{BoxError, Result};

/// Prefix reserved for launcher settings; never exported into the guest.
pub const ENV_PREFIX: &str = "FIREBOX_";

pub const ENV_KERNEL_LOGLEVEL: &str = "FIREBOX_KERNEL_LOGLEVEL";
pub const ENV_BOOT_ARGS: &str = "FIREBOX_BOOT_ARGS";
pub const ENV_EPHEMERAL_STORAGE: &str = "FIREBOX_EPHEMERAL_STORAGE";
pub const ENV_VCPU_COUNT: &str = "FIREBOX_VCPU_COUNT";
pub const ENV_MEM_SIZE_MIB: &str = "FIREBOX_MEM_SIZE_MIB";
pub const ENV_HT_ENABLED: &str = "FIREBOX_HT_ENABLED";
pub const ENV_UID: &str = "FIREBOX_UID";
pub const ENV_GUEST_IP: &str = "FIREBOX_GUEST_IP";
pub const ENV_UPLINK: &str = "FIREBOX_UPLINK";
pub const ENV_FIRECRACKER: &str = "FIREBOX_FIRECRACKER";
pub const ENV_CACHE_DIR: &str = "FIREBOX_CACHE_DIR";
pub const ENV_BUSYBOX_URL: &str = "FIREBOX_BUSYBOX_URL";

/// Static busybox used to fill in missing guest tools.
pub const DEFAULT_BUSYBOX_URL: &str =
    "https://busybox.net/downloads/binaries/1.35.0-x86_64-linux-musl/busybox";

/// How the rootfs is grown before boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EphemeralStorage {
    /// Double the used block count reported by the filesystem check.
    #[default]
    Double,
    /// Resize to exactly this many bytes.
    Explicit(u64),
    /// Leave the image as built.
    Disabled,
}

impl EphemeralStorage {
    /// Parse the `FIREBOX_EPHEMERAL_STORAGE` value. `0` disables resizing.
    pub fn parse(value: &str) -> Result<Self> {
        let bytes = parse_size_bytes(value).map_err(BoxError::ConfigError)?;
        if bytes == 0 {
            Ok(Self::Disabled)
        } else {
            Ok(Self::Explicit(bytes))
        }
    }
}

/// Launch-time settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Kernel `loglevel=` value
    pub kernel_loglevel: u8,

    /// Extra kernel arguments appended verbatim
    pub extra_boot_args: String,

    /// Rootfs resize policy
    pub ephemeral_storage: EphemeralStorage,

    /// Explicit vCPU count (wins over cgroup inference)
    pub vcpu_override: Option<u32>,

    /// Explicit memory size in MiB (wins over cgroup inference)
    pub mem_override_mib: Option<u32>,

    /// Enable simultaneous multithreading in the guest
    pub ht_enabled: bool,

    /// UID the guest workload drops to (0 = stay root)
    pub uid: u32,

    /// Fixed guest address; random in 172.16.0.0/12 when unset
    pub guest_ip: Option<Ipv4Addr>,

    /// Host uplink interface; default route interface when unset
    pub uplink: Option<String>,

    /// Hypervisor binary
    pub firecracker: PathBuf,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            kernel_loglevel: 0,
            extra_boot_args: String::new(),
            ephemeral_storage: EphemeralStorage::Double,
            vcpu_override: None,
            mem_override_mib: None,
            ht_enabled: false,
            uid: 0,
            guest_ip: None,
            uplink: None,
            firecracker: PathBuf::from("firecracker"),
        }
    }
}

impl LaunchConfig {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup function.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(v) = get(ENV_KERNEL_LOGLEVEL) {
            config.kernel_loglevel = parse_number(ENV_KERNEL_LOGLEVEL, &v)?;
        }
        if let Some(v) = lookup(ENV_BOOT_ARGS) {
            config.extra_boot_args = v;
        }
        if let Some(v) = get(ENV_EPHEMERAL_STORAGE) {
            config.ephemeral_storage = EphemeralStorage::parse(&v)?;
        }
        if let Some(v) = get(ENV_VCPU_COUNT) {
            config.vcpu_override = Some(parse_number(ENV_VCPU_COUNT, &v)?);
        }
        if let Some(v) = get(ENV_MEM_SIZE_MIB) {
            config.mem_override_mib = Some(parse_number(ENV_MEM_SIZE_MIB, &v)?);
        }
        if let Some(v) = get(ENV_HT_ENABLED) {
            config.ht_enabled = parse_bool(&v);
        }
        if let Some(v) = get(ENV_UID) {
            config.uid = parse_number(ENV_UID, &v)?;
        }
        if let Some(v) = get(ENV_GUEST_IP) {
            let ip = v.parse::<Ipv4Addr>().map_err(|e| {
                BoxError::ConfigError(format!("{}: invalid IPv4 address '{}': {}", ENV_GUEST_IP, v, e))
            })?;
            config.guest_ip = Some(ip);
        }
        config.uplink = get(ENV_UPLINK);
        if let Some(v) = get(ENV_FIRECRACKER) {
            config.firecracker = PathBuf::from(v);
        }

        Ok(config)
    }
}

/// Image-to-artifact conversion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Directory receiving the artifact directory
    pub output_dir: PathBuf,

    /// Explicit filesystem size in bytes; auto-minimized when unset
    pub size_bytes: Option<u64>,

    /// Replaces the image ENTRYPOINT and clears CMD
    pub entrypoint_override: Option<Vec<String>>,

    /// Cache for downloaded guest tools
    pub cache_dir: PathBuf,

    /// Where the static busybox is fetched from
    pub busybox_url: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            size_bytes: None,
            entrypoint_override: None,
            cache_dir: default_cache_dir(None),
            busybox_url: DEFAULT_BUSYBOX_URL.to_string(),
        }
    }
}

impl BuildConfig {
    /// Default settings with cache location and busybox URL taken from the environment.
    pub fn from_env() -> Self {
        let mut config = Self {
            cache_dir: default_cache_dir(std::env::var_os(ENV_CACHE_DIR).map(PathBuf::from)),
            ..Default::default()
        };
        if let Ok(url) = std::env::var(ENV_BUSYBOX_URL) {
            if !url.trim().is_empty() {
                config.busybox_url = url.trim().to_string();
            }
        }
        config
    }
}

fn default_cache_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        dirs::cache_dir()
            .map(|d| d.join("firebox"))
            .unwrap_or_else(|| PathBuf::from(".firebox-cache"))
    })
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| BoxError::ConfigError(format!("{}: invalid value '{}': {}", key, value, e)))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parse a size string like "500m", "10g", "1t" into bytes.
///
/// Supported suffixes (case-insensitive): `b`, `k`/`kb`, `m`/`mb`, `g`/`gb`, `t`/`tb`.
/// No suffix assumes bytes.
pub fn parse_size_bytes(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("tb") {
        (n, TB)
    } else if let Some(n) = s.strip_suffix('t') {
        (n, TB)
    } else if let Some(n) = s.strip_suffix("gb") {
        (n, GB)
    } else if let Some(n) = s.strip_suffix('g') {
        (n, GB)
    } else if let Some(n) = s.strip_suffix("mb") {
        (n, MB)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, MB)
    } else if let Some(n) = s.strip_suffix("kb") {
        (n, KB)
    } else if let Some(n) = s.strip_suffix('k') {
        (n, KB)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid size value: {s}"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size value out of range: {s}"))
}
