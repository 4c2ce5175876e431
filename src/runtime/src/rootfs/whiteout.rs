//! Layer whiteouts.
//!
//! A layer deletes a lower-layer path by shipping an empty `.wh.<name>`
//! sibling. After the layer is unpacked, each marker removes its target and
//! then itself. `.wh..wh..opq` markers are only removed; the lower contents
//! they hide are left in place.

use std::fs;
use std::path::{Path, PathBuf};

use firebox_core::error::{BoxError, Result};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// What a whiteout pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WhiteoutReport {
    pub targets_removed: usize,
    pub markers_removed: usize,
}

/// Apply and remove every whiteout marker under `root`.
pub fn apply_whiteouts(root: &Path) -> Result<WhiteoutReport> {
    let mut markers = Vec::new();
    collect_markers(root, &mut markers)?;

    let mut report = WhiteoutReport::default();
    for marker in markers {
        let Some(name) = marker.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };

        if name != OPAQUE_WHITEOUT {
            let target_name = &name[WHITEOUT_PREFIX.len()..];
            if !target_name.is_empty() && target_name != "." && target_name != ".." {
                if let Some(parent) = marker.parent() {
                    if remove_path(&parent.join(target_name))? {
                        report.targets_removed += 1;
                    }
                }
            }
        }

        // The marker may sit inside a directory an earlier marker removed.
        if remove_path(&marker)? {
            report.markers_removed += 1;
        }
    }

    if report.markers_removed > 0 {
        tracing::debug!(
            root = %root.display(),
            targets = report.targets_removed,
            markers = report.markers_removed,
            "Applied whiteouts"
        );
    }
    Ok(report)
}

fn collect_markers(dir: &Path, markers: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| {
        BoxError::ExtractionError(format!("Failed to read {}: {}", dir.display(), e))
    })?;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if entry.file_name().to_string_lossy().starts_with(WHITEOUT_PREFIX) {
            markers.push(entry.path());
        } else if file_type.is_dir() {
            collect_markers(&entry.path(), markers)?;
        }
    }
    Ok(())
}

/// Remove a file, symlink or directory tree. Returns false if nothing was there.
fn remove_path(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let result = if meta.file_type().is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| {
        BoxError::ExtractionError(format!("Failed to remove {}: {}", path.display(), e))
    })?;
    Ok(true)
}
