//! Single-guest launch.
//!
//! ```text
//! Validate -> Resize -> ComputeBootConfig -> InjectEnv -> SetupNetwork -> Launch -> Teardown
//! ```
//!
//! Nothing on the host is modified before validation passes. Teardown is
//! the drop of the network guard and the run directory, so it happens on
//! every exit path after `SetupNetwork`. SIGINT and SIGTERM stop the
//! hypervisor and fall through to teardown.

use std::ffi::OsString;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use firebox_core::config::{EphemeralStorage, LaunchConfig};
use firebox_core::error::{BoxError, Result};

use crate::host_check::{self, IP_FORWARD_PATH, KVM_PATH};
use crate::init::{ENV_FILE_PATH, INIT_ENTRYPOINT_CANDIDATES};
use crate::signal::ShutdownSignals;
use crate::tools::{E2fsTools, Ext4Tools, ResizeTarget};

use super::boot::BootArgs;
use super::env::{infer_guest_env, join_init_args, render_env_file};
use super::network::{detect_uplink, GuestNetwork, HostCommand, NetworkGuard, SystemCommand};
use super::resources::{CgroupLimits, ResourcePlan};
use super::vmconfig::VmConfig;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const VMCONFIG_FILE: &str = "vmconfig.json";
const ENV_FILE: &str = "guest-env.sh";

/// What to boot.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    /// Positional arguments passed to the workload via `INIT_ARGS`
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Validate,
    Resize,
    ComputeBootConfig,
    InjectEnv,
    SetupNetwork,
    Launch,
    Teardown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::Resize => "resize",
            Stage::ComputeBootConfig => "compute-boot-config",
            Stage::InjectEnv => "inject-env",
            Stage::SetupNetwork => "setup-network",
            Stage::Launch => "launch",
            Stage::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

fn enter(stage: Stage) {
    tracing::debug!(stage = %stage, "Entering launch stage");
}

/// Everything derived before host state is touched.
struct BootPlan {
    network: GuestNetwork,
    resources: ResourcePlan,
    boot_args: String,
}

/// Boots one rootfs image under Firecracker.
pub struct LaunchOrchestrator {
    config: LaunchConfig,
    ext4: Arc<dyn Ext4Tools>,
    host: Arc<dyn HostCommand>,
    env: Vec<(OsString, OsString)>,
    cgroup_root: PathBuf,
    ip_forward_path: PathBuf,
    kvm_path: PathBuf,
    run_root: PathBuf,
}

impl LaunchOrchestrator {
    /// Orchestrator using host tools and the current process environment.
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            ext4: Arc::new(E2fsTools::default()),
            host: Arc::new(SystemCommand),
            env: std::env::vars_os().collect(),
            cgroup_root: PathBuf::from(CGROUP_ROOT),
            ip_forward_path: PathBuf::from(IP_FORWARD_PATH),
            kvm_path: PathBuf::from(KVM_PATH),
            run_root: std::env::temp_dir(),
        }
    }

    pub fn with_ext4_tools(mut self, ext4: Arc<dyn Ext4Tools>) -> Self {
        self.ext4 = ext4;
        self
    }

    pub fn with_host_command(mut self, host: Arc<dyn HostCommand>) -> Self {
        self.host = host;
        self
    }

    /// Replace the environment the guest env is inferred from.
    pub fn with_env(mut self, env: Vec<(OsString, OsString)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cgroup_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.cgroup_root = path.into();
        self
    }

    pub fn with_ip_forward_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ip_forward_path = path.into();
        self
    }

    pub fn with_kvm_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kvm_path = path.into();
        self
    }

    /// Parent of the per-instance run directory.
    pub fn with_run_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_root = path.into();
        self
    }

    /// Boot the guest and wait for the hypervisor to exit.
    ///
    /// Returns the hypervisor's exit code (128 + signal when killed).
    ///
    /// # Errors
    ///
    /// `ValidationError` before any host change; `NetworkSetupError` or
    /// `LaunchError` afterwards, with host networking already removed.
    /// A signal yields `LaunchError` once the guest is stopped.
    pub async fn launch(&self, request: &LaunchRequest) -> Result<i32> {
        let mut signals = ShutdownSignals::listen()?;
        self.launch_until(request, signals.recv()).await
    }

    /// [`LaunchOrchestrator::launch`] with the guest stopped when `shutdown`
    /// resolves (to the reason reported in the error).
    pub async fn launch_until<S>(&self, request: &LaunchRequest, shutdown: S) -> Result<i32>
    where
        S: Future<Output = &'static str>,
    {
        enter(Stage::Validate);
        self.validate(request)?;

        enter(Stage::Resize);
        if let Err(e) = self.resize_rootfs(&request.rootfs) {
            tracing::warn!(rootfs = %request.rootfs.display(), error = %e, "Rootfs resize skipped");
        }

        enter(Stage::ComputeBootConfig);
        let plan = self.plan(request)?;

        let run_dir = tempfile::Builder::new()
            .prefix("firebox-")
            .tempdir_in(&self.run_root)
            .map_err(|e| BoxError::LaunchError {
                message: format!(
                    "Failed to create run directory in {}: {}",
                    self.run_root.display(),
                    e
                ),
                hint: None,
            })?;

        enter(Stage::InjectEnv);
        self.inject_env(request, run_dir.path())?;

        enter(Stage::SetupNetwork);
        let uplink = match &self.config.uplink {
            Some(uplink) => uplink.clone(),
            None => detect_uplink(self.host.as_ref())?,
        };
        let guard = NetworkGuard::setup(self.host.as_ref(), plan.network, &uplink)?;

        enter(Stage::Launch);
        let vm = VmConfig::new(
            &request.kernel,
            plan.boot_args,
            &request.rootfs,
            guard.network(),
            &plan.resources,
        );
        let result = self.run_firecracker(&vm, run_dir.path(), shutdown).await;

        enter(Stage::Teardown);
        drop(guard);
        if let Err(e) = run_dir.close() {
            tracing::warn!(error = %e, "Failed to remove run directory");
        }
        result
    }

    fn validate(&self, request: &LaunchRequest) -> Result<()> {
        host_check::require_file(&request.kernel, "kernel")?;
        host_check::require_file(&request.rootfs, "rootfs")?;
        host_check::check_ip_forwarding(&self.ip_forward_path)?;
        host_check::warn_if_no_kvm(&self.kvm_path);
        Ok(())
    }

    fn resize_rootfs(&self, rootfs: &Path) -> Result<()> {
        let report = self.ext4.check(rootfs)?;
        let (target, bytes) = match self.config.ephemeral_storage {
            EphemeralStorage::Disabled => return Ok(()),
            EphemeralStorage::Double => {
                // Grow only; an image already larger than twice its usage keeps its size.
                let blocks = (report.used_blocks * 2).max(report.total_blocks);
                if blocks == report.total_blocks {
                    tracing::debug!(rootfs = %rootfs.display(), blocks, "Rootfs already large enough");
                    return Ok(());
                }
                let block_size = self.ext4.block_size(rootfs)?;
                (ResizeTarget::Blocks(blocks), blocks * block_size)
            }
            EphemeralStorage::Explicit(bytes) => (ResizeTarget::Bytes(bytes), bytes),
        };

        let file = std::fs::OpenOptions::new().write(true).open(rootfs)?;
        let current = file.metadata()?.len();
        if bytes > current {
            file.set_len(bytes)?;
        }
        self.ext4.resize(rootfs, target)?;
        if bytes < current {
            file.set_len(bytes)?;
        }
        tracing::info!(rootfs = %rootfs.display(), from = current, to = bytes, "Resized rootfs");
        Ok(())
    }

    fn plan(&self, request: &LaunchRequest) -> Result<BootPlan> {
        let network = GuestNetwork::allocate(self.config.guest_ip)?;
        let resources = ResourcePlan::resolve(
            self.config.vcpu_override,
            self.config.mem_override_mib,
            self.config.ht_enabled,
            &CgroupLimits::read(&self.cgroup_root),
        );
        let boot_args = BootArgs {
            loglevel: self.config.kernel_loglevel,
            guest_ip: network.guest_ip,
            gateway_ip: network.gateway_ip,
            init: self.find_init(&request.rootfs),
            extra: self.config.extra_boot_args.clone(),
        }
        .render();

        tracing::info!(
            vcpus = resources.vcpus,
            mem_mib = resources.mem_mib,
            guest_ip = %network.guest_ip,
            "Boot configuration ready"
        );
        tracing::debug!(boot_args = %boot_args, "Kernel command line");
        Ok(BootPlan {
            network,
            resources,
            boot_args,
        })
    }

    fn find_init(&self, rootfs: &Path) -> Option<String> {
        for candidate in INIT_ENTRYPOINT_CANDIDATES {
            match self.ext4.exists_in_image(rootfs, candidate) {
                Ok(true) => return Some(candidate.to_string()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(path = candidate, error = %e, "Failed to probe rootfs");
                }
            }
        }
        None
    }

    fn inject_env(&self, request: &LaunchRequest, run_dir: &Path) -> Result<()> {
        let vars = infer_guest_env(self.env.iter().cloned());
        let init_args = join_init_args(&request.args);
        let contents = render_env_file(&vars, self.config.uid, init_args.as_deref());

        let host_file = run_dir.join(ENV_FILE);
        std::fs::write(&host_file, contents)?;
        self.ext4
            .write_into_image(&request.rootfs, &host_file, ENV_FILE_PATH)?;
        tracing::debug!(count = vars.len(), uid = self.config.uid, "Guest environment written");
        Ok(())
    }

    async fn run_firecracker<S>(&self, vm: &VmConfig, run_dir: &Path, shutdown: S) -> Result<i32>
    where
        S: Future<Output = &'static str>,
    {
        let config_path = run_dir.join(VMCONFIG_FILE);
        vm.write_to(&config_path)?;

        tracing::info!(
            firecracker = %self.config.firecracker.display(),
            config = %config_path.display(),
            "Starting guest"
        );
        let mut child = tokio::process::Command::new(&self.config.firecracker)
            .arg("--no-api")
            .arg("--config-file")
            .arg(&config_path)
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BoxError::LaunchError {
                message: format!(
                    "Failed to start {}: {}",
                    self.config.firecracker.display(),
                    e
                ),
                hint: Some("Install firecracker or set FIREBOX_FIRECRACKER".to_string()),
            })?;

        let outcome = tokio::select! {
            biased;
            reason = shutdown => Err(reason),
            status = child.wait() => Ok(status),
        };
        let status = match outcome {
            Ok(status) => status.map_err(|e| BoxError::LaunchError {
                message: format!("Failed to wait for firecracker: {}", e),
                hint: None,
            })?,
            Err(reason) => {
                tracing::warn!(reason, "Stopping guest");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill firecracker");
                }
                return Err(BoxError::LaunchError {
                    message: format!("Guest stopped: interrupted by {}", reason),
                    hint: None,
                });
            }
        };

        let code = status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(1);
        tracing::info!(code, "Guest exited");
        Ok(code)
    }
}
