//! ext4 packaging of an assembled tree.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use firebox_core::error::{BoxError, Result};

use crate::tools::{Ext4Tools, ResizeTarget};

const MIB: u64 = 1024 * 1024;

/// Smallest image ever created.
pub const MIN_IMAGE_SIZE: u64 = 16 * MIB;

/// Headroom over measured usage for filesystem metadata.
const SIZE_FACTOR_NUM: u64 = 6;
const SIZE_FACTOR_DEN: u64 = 5;

/// A packaged filesystem image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsImage {
    pub path: PathBuf,
    pub block_count: u64,
    pub block_size: u64,
}

impl RootfsImage {
    pub fn size_bytes(&self) -> u64 {
        self.block_count * self.block_size
    }
}

/// Bytes allocated on disk under `path`, symlinks not followed.
///
/// Hard-linked files are counted once.
pub fn disk_usage(path: &Path) -> std::io::Result<u64> {
    let mut seen = std::collections::HashSet::new();
    disk_usage_inner(path, &mut seen)
}

fn disk_usage_inner(
    path: &Path,
    seen: &mut std::collections::HashSet<(u64, u64)>,
) -> std::io::Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.nlink() > 1 && !meta.is_dir() && !seen.insert((meta.dev(), meta.ino())) {
        return Ok(0);
    }
    let mut total = meta.blocks() * 512;
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            total += disk_usage_inner(&entry?.path(), seen)?;
        }
    }
    Ok(total)
}

/// Image size for `usage` bytes: 1.2× rounded up to whole MiB, at least 16 MiB.
pub fn auto_size(usage: u64) -> u64 {
    let padded = usage.saturating_mul(SIZE_FACTOR_NUM).div_ceil(SIZE_FACTOR_DEN);
    (padded.div_ceil(MIB) * MIB).max(MIN_IMAGE_SIZE)
}

/// Removes the in-progress image unless disarmed.
struct PartialImage {
    path: PathBuf,
    armed: bool,
}

impl PartialImage {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn commit(mut self, dest: &Path) -> Result<()> {
        std::fs::rename(&self.path, dest).map_err(|e| {
            BoxError::PackagingError(format!(
                "Failed to move image into place at {}: {}",
                dest.display(),
                e
            ))
        })?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialImage {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove partial image");
                }
            }
        }
    }
}

/// Builds ext4 images from directory trees.
pub struct Packager {
    tools: Arc<dyn Ext4Tools>,
}

impl Packager {
    pub fn new(tools: Arc<dyn Ext4Tools>) -> Self {
        Self { tools }
    }

    /// Package `tree` into `image`.
    ///
    /// Without `requested_size` the image is sized from disk usage and then
    /// shrunk to the blocks actually used. The image is built beside its
    /// destination as `<image>.partial` and renamed on success.
    pub fn package(
        &self,
        tree: &Path,
        image: &Path,
        requested_size: Option<u64>,
    ) -> Result<RootfsImage> {
        let size = match requested_size {
            Some(size) => size,
            None => {
                let usage = disk_usage(tree).map_err(|e| {
                    BoxError::PackagingError(format!(
                        "Failed to measure {}: {}",
                        tree.display(),
                        e
                    ))
                })?;
                let size = auto_size(usage);
                tracing::debug!(usage, size, "Sized rootfs image");
                size
            }
        };

        let partial_path = partial_path(image);
        let partial = PartialImage::new(partial_path.clone());
        let file = std::fs::File::create(&partial_path)?;
        file.set_len(size)?;
        drop(file);

        self.tools.mkfs(&partial_path, tree)?;
        let report = self.tools.check(&partial_path)?;
        let block_size = self.tools.block_size(&partial_path)?;

        let block_count = if requested_size.is_some() {
            report.total_blocks
        } else {
            self.shrink(&partial_path, report.used_blocks, block_size)?
        };

        partial.commit(image)?;
        tracing::info!(
            image = %image.display(),
            blocks = block_count,
            block_size,
            "Packaged rootfs"
        );
        Ok(RootfsImage {
            path: image.to_path_buf(),
            block_count,
            block_size,
        })
    }

    fn shrink(&self, image: &Path, used_blocks: u64, block_size: u64) -> Result<u64> {
        let block_count = match self.tools.resize(image, ResizeTarget::Blocks(used_blocks)) {
            Ok(()) => used_blocks,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    used_blocks,
                    "Shrink to used blocks failed; shrinking to minimum"
                );
                self.tools.resize(image, ResizeTarget::Minimum)?;
                self.tools.check(image)?.total_blocks
            }
        };

        let file = std::fs::OpenOptions::new().write(true).open(image)?;
        file.set_len(block_count * block_size)?;
        Ok(block_count)
    }
}

fn partial_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Ext4Call, FakeExt4Tools};
    use tempfile::TempDir;

    fn tree_with(bytes: usize) -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("usr/bin")).unwrap();
        std::fs::write(tmp.path().join("usr/bin/app"), vec![1u8; bytes]).unwrap();
        tmp
    }

    #[test]
    fn test_auto_size() {
        assert_eq!(auto_size(0), MIN_IMAGE_SIZE);
        assert_eq!(auto_size(10 * MIB), MIN_IMAGE_SIZE);
        // 100 MiB * 1.2 = 120 MiB exactly
        assert_eq!(auto_size(100 * MIB), 120 * MIB);
        // 100 MiB + 1 byte rounds up to the next MiB
        assert_eq!(auto_size(100 * MIB + 1), 121 * MIB);
    }

    #[test]
    fn test_disk_usage_counts_allocated_blocks() {
        let tree = tree_with(64 * 1024);
        let usage = disk_usage(tree.path()).unwrap();
        assert!(usage >= 64 * 1024, "usage {} too small", usage);
    }

    #[test]
    fn test_disk_usage_ignores_symlink_targets() {
        let tree = tree_with(1024);
        let big = TempDir::new().unwrap();
        std::fs::write(big.path().join("big"), vec![0u8; 1024 * 1024]).unwrap();
        let before = disk_usage(tree.path()).unwrap();
        std::os::unix::fs::symlink(big.path().join("big"), tree.path().join("link")).unwrap();
        let after = disk_usage(tree.path()).unwrap();
        assert!(after - before < 1024 * 1024);
    }

    #[test]
    fn test_auto_size_shrinks_to_used_blocks() {
        let tree = tree_with(4096);
        let out = TempDir::new().unwrap();
        let image = out.path().join("rootfs.ext4");
        let tools = Arc::new(FakeExt4Tools::new(1000));

        let result = Packager::new(tools.clone())
            .package(tree.path(), &image, None)
            .unwrap();

        assert_eq!(result.block_count, 1000);
        assert_eq!(result.block_size, 4096);
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 1000 * 4096);
        assert!(!partial_path(&image).exists());

        let calls = tools.calls();
        assert!(matches!(
            &calls[0],
            Ext4Call::Mkfs { size, .. } if *size == MIN_IMAGE_SIZE
        ));
        assert!(calls.contains(&Ext4Call::Resize(ResizeTarget::Blocks(1000))));
    }

    #[test]
    fn test_shrink_falls_back_to_minimum() {
        let tree = tree_with(4096);
        let out = TempDir::new().unwrap();
        let image = out.path().join("rootfs.ext4");
        let mut fake = FakeExt4Tools::new(1000);
        fake.fail_resize_to_blocks = true;
        let tools = Arc::new(fake);

        let result = Packager::new(tools.clone())
            .package(tree.path(), &image, None)
            .unwrap();

        assert_eq!(result.block_count, 1016);
        assert!(tools.calls().contains(&Ext4Call::Resize(ResizeTarget::Minimum)));
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 1016 * 4096);
    }

    #[test]
    fn test_explicit_size_skips_shrink() {
        let tree = tree_with(4096);
        let out = TempDir::new().unwrap();
        let image = out.path().join("rootfs.ext4");
        let tools = Arc::new(FakeExt4Tools::new(1000));

        let result = Packager::new(tools.clone())
            .package(tree.path(), &image, Some(64 * MIB))
            .unwrap();

        assert_eq!(result.size_bytes(), 64 * MIB);
        assert!(!tools
            .calls()
            .iter()
            .any(|c| matches!(c, Ext4Call::Resize(_))));
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 64 * MIB);
    }

    #[test]
    fn test_failure_removes_partial() {
        let tree = tree_with(4096);
        let out = TempDir::new().unwrap();
        let image = out.path().join("rootfs.ext4");
        let mut fake = FakeExt4Tools::new(1000);
        fake.fail_check = true;

        let err = Packager::new(Arc::new(fake))
            .package(tree.path(), &image, None)
            .unwrap_err();

        assert!(matches!(err, BoxError::PackagingError(_)));
        assert!(!image.exists());
        assert!(!partial_path(&image).exists());
    }
}
