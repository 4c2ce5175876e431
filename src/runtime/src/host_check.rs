//! Host preconditions for launching a guest.
//!
//! - IPv4 forwarding must be on, otherwise guest traffic never leaves the tap.
//! - KVM should be usable; its absence only warns since the hypervisor
//!   reports the definitive error itself.

use std::path::Path;

use firebox_core::error::{BoxError, Result};

/// Sysctl controlling IPv4 forwarding.
pub const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// KVM device node.
pub const KVM_PATH: &str = "/dev/kvm";

/// Information about virtualization support.
#[derive(Debug, Clone)]
pub struct VirtualizationSupport {
    /// Human-readable description of the virtualization backend.
    pub backend: String,
    /// Additional details about the support.
    pub details: String,
}

/// Fail unless `path` exists and is a regular file.
pub fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    Err(BoxError::ValidationError {
        message: format!("{} not found: {}", what, path.display()),
        hint: Some(format!("Check the {} path", what)),
    })
}

/// Fail unless the sysctl at `path` reads `1`.
pub fn check_ip_forwarding(path: &Path) -> Result<()> {
    let value = std::fs::read_to_string(path).map_err(|e| BoxError::ValidationError {
        message: format!("Cannot read {}: {}", path.display(), e),
        hint: None,
    })?;
    if value.trim() == "1" {
        return Ok(());
    }
    Err(BoxError::ValidationError {
        message: "IPv4 forwarding is disabled".to_string(),
        hint: Some("Enable it with: sysctl -w net.ipv4.ip_forward=1".to_string()),
    })
}

/// Check that KVM is present and accessible at `kvm_path`.
pub fn check_kvm(kvm_path: &Path) -> Result<VirtualizationSupport> {
    if !kvm_path.exists() {
        return Err(BoxError::ValidationError {
            message: format!("KVM is not available: {} not found", kvm_path.display()),
            hint: Some(
                "Ensure KVM kernel modules are loaded (modprobe kvm kvm_intel or kvm_amd)"
                    .to_string(),
            ),
        });
    }

    match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(kvm_path)
    {
        Ok(_) => Ok(VirtualizationSupport {
            backend: "KVM".to_string(),
            details: "Linux KVM hardware virtualization is available".to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(BoxError::ValidationError {
                message: format!("KVM access denied: {}", e),
                hint: Some("Add your user to the 'kvm' group: sudo usermod -aG kvm $USER".to_string()),
            })
        }
        Err(e) => Err(BoxError::ValidationError {
            message: format!("Failed to access {}: {}", kvm_path.display(), e),
            hint: None,
        }),
    }
}

/// Log a warning when KVM is unusable. Never fails.
pub fn warn_if_no_kvm(kvm_path: &Path) {
    match check_kvm(kvm_path) {
        Ok(support) => tracing::debug!(backend = %support.backend, "{}", support.details),
        Err(e) => tracing::warn!(error = %e, "Hypervisor may fail to start"),
    }
}
