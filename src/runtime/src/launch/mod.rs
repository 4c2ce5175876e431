//! Booting an artifact's rootfs as a Firecracker guest.

pub mod boot;
pub mod env;
pub mod network;
mod orchestrator;
pub mod resources;
pub mod vmconfig;

pub use boot::{BootArgs, BASE_BOOT_ARGS};
pub use env::{infer_guest_env, render_env_file, ENV_DENYLIST};
pub use network::{GuestNetwork, HostCommand, NetworkGuard, SystemCommand};
pub use orchestrator::{LaunchOrchestrator, LaunchRequest};
pub use resources::{CgroupLimits, ResourcePlan, DEFAULT_MEM_MIB, DEFAULT_VCPUS};
pub use vmconfig::VmConfig;
