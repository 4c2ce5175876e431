//! Firecracker configuration document (`--config-file`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use firebox_core::error::Result;

use super::network::GuestNetwork;
use super::resources::ResourcePlan;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub ht_enabled: bool,
}

/// Complete VM description for a single guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
}

impl VmConfig {
    pub fn new(
        kernel: &Path,
        boot_args: String,
        rootfs: &Path,
        network: &GuestNetwork,
        resources: &ResourcePlan,
    ) -> Self {
        Self {
            boot_source: BootSource {
                kernel_image_path: kernel.to_path_buf(),
                boot_args,
            },
            drives: vec![Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: rootfs.to_path_buf(),
                is_root_device: true,
                is_read_only: false,
            }],
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: network.guest_mac.clone(),
                host_dev_name: network.tap_device.clone(),
            }],
            machine_config: MachineConfig {
                vcpu_count: resources.vcpus,
                mem_size_mib: resources.mem_mib,
                ht_enabled: resources.ht_enabled,
            },
        }
    }

    /// Write the document as pretty JSON.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}
