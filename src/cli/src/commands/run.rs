//! `firebox run` command - boot an artifact under Firecracker.

use std::path::{Path, PathBuf};

use clap::Args;
use firebox_core::LaunchConfig;
use firebox_runtime::{Artifact, LaunchOrchestrator, LaunchRequest};

#[derive(Args)]
pub struct RunArgs {
    /// Artifact directory produced by `firebox build`, or an ext4 image
    pub target: PathBuf,

    /// Uncompressed guest kernel (vmlinux)
    #[arg(long, env = "FIREBOX_KERNEL")]
    pub kernel: PathBuf,

    /// Arguments appended to the image command (after `--`)
    #[arg(last = true)]
    pub args: Vec<String>,
}

pub async fn execute(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let config = LaunchConfig::from_env()?;
    let request = LaunchRequest {
        kernel: args.kernel,
        rootfs: resolve_rootfs(&args.target)?,
        args: args.args,
    };
    tracing::info!(rootfs = %request.rootfs.display(), "Launching");

    let code = LaunchOrchestrator::new(config).launch(&request).await?;
    Ok(code)
}

/// The rootfs of an artifact directory, or `target` itself.
fn resolve_rootfs(target: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if target.is_dir() {
        let artifact = Artifact::load(target)?;
        return Ok(artifact.rootfs);
    }
    Ok(target.to_path_buf())
}
