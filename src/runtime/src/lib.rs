//! Firebox Runtime - container image to Firecracker microVM.
//!
//! This crate provides the conversion pipeline (image source, rootfs
//! assembly, init synthesis, ext4 packaging) and the launch orchestrator
//! that boots the resulting artifact.

#![allow(clippy::result_large_err)]

pub mod builder;
pub mod host_check;
pub mod init;
pub mod launch;
pub mod oci;
pub mod package;
pub mod rootfs;
pub mod signal;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use builder::{Artifact, ArtifactBuilder, ArtifactMetadata, ARTIFACT_FILE, ROOTFS_FILE};
pub use host_check::{check_ip_forwarding, check_kvm, VirtualizationSupport};
pub use init::{InitProgram, InitSynthesizer};
pub use launch::{LaunchOrchestrator, LaunchRequest, VmConfig};
pub use oci::{open_source, ArchiveImage, ImageReference, ImageSource, RegistryClient, RegistryImage};
pub use package::{Packager, RootfsImage};
pub use rootfs::{PermissionAnomalySet, RootfsAssembler};
pub use signal::ShutdownSignals;

/// Firebox Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
