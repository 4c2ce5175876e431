//! ext4 image tooling (e2fsprogs).

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};

use firebox_core::error::{BoxError, Result};

use super::privilege::PrivilegeMode;

/// Block counts reported by a filesystem check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsckReport {
    pub used_blocks: u64,
    pub total_blocks: u64,
}

/// Target of a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeTarget {
    /// Exactly this many filesystem blocks
    Blocks(u64),
    /// Exactly this many bytes (rounded down to whole blocks by resize2fs)
    Bytes(u64),
    /// As small as the contents allow
    Minimum,
}

/// Operations on ext4 image files.
pub trait Ext4Tools: Send + Sync {
    /// Populate an already-sized image file from `source`.
    fn mkfs(&self, image: &Path, source: &Path) -> Result<()>;

    /// Force a full check, repairing what can be repaired.
    fn check(&self, image: &Path) -> Result<FsckReport>;

    /// Grow or shrink the filesystem. The file must already be large enough.
    fn resize(&self, image: &Path, target: ResizeTarget) -> Result<()>;

    /// Filesystem block size in bytes.
    fn block_size(&self, image: &Path) -> Result<u64>;

    /// Whether `guest_path` exists inside the image.
    fn exists_in_image(&self, image: &Path, guest_path: &str) -> Result<bool>;

    /// Replace `guest_path` inside the image with the contents of `host_file`,
    /// creating its parent directories.
    fn write_into_image(&self, image: &Path, host_file: &Path, guest_path: &str) -> Result<()>;
}

/// e2fsprogs-backed implementation.
pub struct E2fsTools {
    privilege: PrivilegeMode,
}

impl E2fsTools {
    /// `privilege` only wraps `mkfs.ext4`, which reads ownership from the tree.
    pub fn new(privilege: PrivilegeMode) -> Self {
        Self { privilege }
    }
}

impl Default for E2fsTools {
    fn default() -> Self {
        Self::new(PrivilegeMode::Native)
    }
}

fn run(mut cmd: Command, what: &str) -> Result<Output> {
    let output = cmd
        .output()
        .map_err(|e| BoxError::PackagingError(format!("Failed to run {}: {}", what, e)))?;
    Ok(output)
}

fn failure(what: &str, output: &Output) -> BoxError {
    BoxError::PackagingError(format!(
        "{} exited with {}: {}",
        what,
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

impl Ext4Tools for E2fsTools {
    fn mkfs(&self, image: &Path, source: &Path) -> Result<()> {
        let mut cmd = self.privilege.command("mkfs.ext4");
        cmd.args(["-F", "-q", "-d"]).arg(source).arg(image);
        let output = run(cmd, "mkfs.ext4")?;
        if !output.status.success() {
            return Err(failure("mkfs.ext4", &output));
        }
        Ok(())
    }

    fn check(&self, image: &Path) -> Result<FsckReport> {
        let mut cmd = Command::new("e2fsck");
        cmd.arg("-fy").arg(image);
        let output = run(cmd, "e2fsck")?;

        // 1 and 2 mean errors were corrected; 4 and up mean they were not.
        let code = output.status.code().unwrap_or(8);
        if code >= 4 {
            return Err(failure("e2fsck", &output));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_fsck_summary(&stdout).ok_or_else(|| {
            BoxError::PackagingError(format!(
                "e2fsck printed no block summary for {}",
                image.display()
            ))
        })
    }

    fn resize(&self, image: &Path, target: ResizeTarget) -> Result<()> {
        let mut cmd = Command::new("resize2fs");
        match target {
            ResizeTarget::Blocks(n) => cmd.arg(image).arg(n.to_string()),
            ResizeTarget::Bytes(n) => cmd.arg(image).arg(format!("{}K", n / 1024)),
            ResizeTarget::Minimum => cmd.arg("-M").arg(image),
        };
        let output = run(cmd, "resize2fs")?;
        if !output.status.success() {
            return Err(failure("resize2fs", &output));
        }
        Ok(())
    }

    fn block_size(&self, image: &Path) -> Result<u64> {
        let mut cmd = Command::new("tune2fs");
        cmd.arg("-l").arg(image);
        let output = run(cmd, "tune2fs")?;
        if !output.status.success() {
            return Err(failure("tune2fs", &output));
        }
        parse_block_size(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            BoxError::PackagingError(format!("No block size reported for {}", image.display()))
        })
    }

    fn exists_in_image(&self, image: &Path, guest_path: &str) -> Result<bool> {
        let mut cmd = Command::new("debugfs");
        cmd.arg("-R").arg(format!("stat {}", guest_path)).arg(image);
        let output = run(cmd, "debugfs")?;
        if !output.status.success() {
            return Err(failure("debugfs", &output));
        }
        // debugfs exits 0 either way; a found inode prints its header.
        Ok(String::from_utf8_lossy(&output.stdout).contains("Inode:"))
    }

    fn write_into_image(&self, image: &Path, host_file: &Path, guest_path: &str) -> Result<()> {
        let mut script = tempfile::NamedTempFile::new()?;
        script.write_all(debugfs_write_script(host_file, guest_path).as_bytes())?;
        script.flush()?;

        let mut cmd = Command::new("debugfs");
        cmd.arg("-w").arg("-f").arg(script.path()).arg(image);
        let output = run(cmd, "debugfs")?;
        if !output.status.success() {
            return Err(failure("debugfs", &output));
        }

        if !self.exists_in_image(image, guest_path)? {
            return Err(BoxError::PackagingError(format!(
                "debugfs did not create {} in {}",
                guest_path,
                image.display()
            )));
        }
        Ok(())
    }
}

/// Request file for `debugfs -f`: create parents, drop any old copy, write.
///
/// Failing `mkdir`/`rm` requests (already exists, absent) are harmless.
fn debugfs_write_script(host_file: &Path, guest_path: &str) -> String {
    let mut script = String::new();
    let mut parent = String::new();
    let components: Vec<&str> = guest_path.split('/').filter(|c| !c.is_empty()).collect();
    if let Some((_, dirs)) = components.split_last() {
        for dir in dirs {
            parent.push('/');
            parent.push_str(dir);
            script.push_str(&format!("mkdir {}\n", parent));
        }
    }
    script.push_str(&format!("rm {}\n", guest_path));
    script.push_str(&format!("write {} {}\n", host_file.display(), guest_path));
    script
}

/// Parse `e2fsck` output for `<used>/<total> blocks`.
pub fn parse_fsck_summary(output: &str) -> Option<FsckReport> {
    for line in output.lines() {
        let mut prev: Option<&str> = None;
        for token in line.split_whitespace() {
            if token.trim_end_matches(|c: char| !c.is_alphabetic()) == "blocks" {
                if let Some((used, total)) = prev.and_then(|p| p.split_once('/')) {
                    if let (Ok(used), Ok(total)) = (used.parse(), total.parse()) {
                        return Some(FsckReport {
                            used_blocks: used,
                            total_blocks: total,
                        });
                    }
                }
            }
            prev = Some(token.trim_end_matches(','));
        }
    }
    None
}

/// Parse `tune2fs -l` output for the `Block size:` line.
pub fn parse_block_size(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "Block size" {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fsck_summary() {
        let output = "Pass 1: Checking inodes, blocks, and sizes\n\
                      Pass 5: Checking group summary information\n\
                      rootfs.ext4: 1153/6400 files (0.2% non-contiguous), 9132/25600 blocks\n";
        assert_eq!(
            parse_fsck_summary(output),
            Some(FsckReport {
                used_blocks: 9132,
                total_blocks: 25600
            })
        );
    }

    #[test]
    fn test_parse_fsck_summary_missing() {
        assert_eq!(parse_fsck_summary("Pass 1: Checking inodes, blocks"), None);
        assert_eq!(parse_fsck_summary(""), None);
    }

    #[test]
    fn test_parse_block_size() {
        let output = "Filesystem volume name:   <none>\n\
                      Block count:              25600\n\
                      Block size:               4096\n\
                      Fragment size:            4096\n";
        assert_eq!(parse_block_size(output), Some(4096));
        assert_eq!(parse_block_size("Block count: 10"), None);
    }

    #[test]
    fn test_debugfs_write_script() {
        let script = debugfs_write_script(
            Path::new("/tmp/env.sh"),
            "/etc/profile.d/01-container-env-vars.sh",
        );
        assert_eq!(
            script,
            "mkdir /etc\n\
             mkdir /etc/profile.d\n\
             rm /etc/profile.d/01-container-env-vars.sh\n\
             write /tmp/env.sh /etc/profile.d/01-container-env-vars.sh\n"
        );
    }
}
