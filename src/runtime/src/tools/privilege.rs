//! Privilege emulation for subprocesses that must observe root ownership.
//!
//! When the pipeline runs unprivileged, layer extraction and `mkfs.ext4 -d`
//! share one `fakeroot` state file so files unpacked by `tar` show up as
//! root-owned (with their recorded uid/gid) when the filesystem is built.

use std::path::{Path, PathBuf};

use firebox_core::error::{BoxError, Result};

/// How external tools are wrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegeMode {
    /// Already running as root; tools run directly.
    Native,
    /// Tools run under `fakeroot`, persisting ownership in `state_file`.
    Fakeroot { state_file: PathBuf },
}

impl PrivilegeMode {
    /// Pick the mode for the current process.
    ///
    /// The fakeroot state file is created empty so the first `-i` load succeeds.
    pub fn detect(state_file: impl Into<PathBuf>) -> Result<Self> {
        if is_root() {
            return Ok(Self::Native);
        }

        let state_file = state_file.into();
        if !state_file.exists() {
            if let Some(parent) = state_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&state_file, b"").map_err(|e| {
                BoxError::Other(format!(
                    "Failed to create fakeroot state {}: {}",
                    state_file.display(),
                    e
                ))
            })?;
        }
        tracing::debug!(state = %state_file.display(), "Using fakeroot privilege emulation");
        Ok(Self::Fakeroot { state_file })
    }

    /// Program and leading arguments needed to run `program` in this mode.
    pub fn wrap(&self, program: &str) -> (String, Vec<String>) {
        match self {
            Self::Native => (program.to_string(), Vec::new()),
            Self::Fakeroot { state_file } => {
                let state = state_file.display().to_string();
                (
                    "fakeroot".to_string(),
                    vec![
                        "-i".to_string(),
                        state.clone(),
                        "-s".to_string(),
                        state,
                        "--".to_string(),
                        program.to_string(),
                    ],
                )
            }
        }
    }

    /// Blocking command for `program`.
    pub fn command(&self, program: &str) -> std::process::Command {
        let (program, prefix) = self.wrap(program);
        let mut cmd = std::process::Command::new(program);
        cmd.args(prefix);
        cmd
    }

    /// Async command for `program`.
    pub fn async_command(&self, program: &str) -> tokio::process::Command {
        let (program, prefix) = self.wrap(program);
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(prefix);
        cmd
    }

    /// State file backing the emulation, if any.
    pub fn state_file(&self) -> Option<&Path> {
        match self {
            Self::Native => None,
            Self::Fakeroot { state_file } => Some(state_file),
        }
    }
}

/// Whether the process runs with effective uid 0.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
