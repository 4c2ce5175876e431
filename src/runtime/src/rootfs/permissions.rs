//! Permission normalization between layers.
//!
//! Images routinely ship directories without owner-write (`/proc`, `/sys`,
//! read-only app dirs) and files without owner-read (`/etc/shadow`). An
//! unprivileged extractor could neither unpack later layers into those
//! directories nor apply whiteouts inside them, nor could the packager read
//! those files. Directories are opened up temporarily and restored at the
//! end; unreadable files are opened up for good.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use firebox_core::error::{BoxError, Result};

const OWNER_READ: u32 = 0o400;
const OWNER_WRITE: u32 = 0o200;
const OWNER_EXEC: u32 = 0o100;

/// Directories made writable, with the mode they had before.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionAnomalySet {
    dirs: BTreeMap<PathBuf, u32>,
}

impl PermissionAnomalySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.dirs.contains_key(path)
    }

    /// Original mode recorded for `path`.
    pub fn original_mode(&self, path: &Path) -> Option<u32> {
        self.dirs.get(path).copied()
    }

    fn record(&mut self, path: PathBuf, mode: u32) {
        self.dirs.insert(path, mode);
    }
}

/// What a normalization pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub dirs_made_writable: usize,
    pub dirs_made_traversable: usize,
    pub files_made_readable: usize,
    pub shadow_backups_removed: usize,
}

impl NormalizeReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Backup copies of shadow databases (`shadow-`, `gshadow-`, `*shadow-`).
///
/// They are unreadable by design and useless in a guest, so they are
/// dropped rather than exposed.
pub fn is_shadow_backup(name: &str) -> bool {
    name == "shadow-" || name == "gshadow-" || name.ends_with("shadow-")
}

/// Open up every anomaly under `root`, recording directories in `anomalies`.
///
/// Symlinks are never followed.
pub fn normalize(root: &Path, anomalies: &mut PermissionAnomalySet) -> Result<NormalizeReport> {
    let mut report = NormalizeReport::default();
    normalize_dir(root, anomalies, &mut report)?;
    if !report.is_clean() {
        tracing::debug!(root = %root.display(), ?report, "Normalized permissions");
    }
    Ok(report)
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        BoxError::ExtractionError(format!(
            "Failed to chmod {:o} {}: {}",
            mode,
            path.display(),
            e
        ))
    })
}

fn normalize_dir(
    dir: &Path,
    anomalies: &mut PermissionAnomalySet,
    report: &mut NormalizeReport,
) -> Result<()> {
    let mode = fs::symlink_metadata(dir)?.permissions().mode() & 0o7777;
    let mut fixed = mode;
    if mode & OWNER_WRITE == 0 {
        fixed |= OWNER_WRITE;
        if !anomalies.contains(dir) {
            anomalies.record(dir.to_path_buf(), mode);
        }
        report.dirs_made_writable += 1;
    }
    if mode & (OWNER_READ | OWNER_EXEC) != (OWNER_READ | OWNER_EXEC) {
        fixed |= OWNER_READ | OWNER_EXEC;
        report.dirs_made_traversable += 1;
    }
    if fixed != mode {
        set_mode(dir, fixed)?;
    }

    let entries = fs::read_dir(dir).map_err(|e| {
        BoxError::ExtractionError(format!("Failed to read {}: {}", dir.display(), e))
    })?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            normalize_dir(&path, anomalies, report)?;
        } else if file_type.is_file() {
            let mode = entry.metadata()?.permissions().mode() & 0o7777;
            if mode & OWNER_READ != 0 {
                continue;
            }
            if is_shadow_backup(&entry.file_name().to_string_lossy()) {
                fs::remove_file(&path)?;
                report.shadow_backups_removed += 1;
            } else {
                set_mode(&path, mode | OWNER_READ)?;
                report.files_made_readable += 1;
            }
        }
    }
    Ok(())
}

/// Put recorded directories back to their original modes.
///
/// Owner read/execute stays set: only the write bit is taken away again.
/// Directories removed by later layers are skipped. Deepest paths go first
/// so parents stay writable until their children are done.
pub fn restore(anomalies: &PermissionAnomalySet) -> Result<usize> {
    let mut restored = 0;
    for (path, mode) in anomalies.dirs.iter().rev() {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_dir() => {
                set_mode(path, *mode | OWNER_READ | OWNER_EXEC)?;
                restored += 1;
            }
            _ => continue,
        }
    }
    Ok(restored)
}

/// Make every directory under `root` owner-writable so the tree can be deleted.
pub fn make_removable(root: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(root)?;
    if !meta.file_type().is_dir() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        fs::set_permissions(root, fs::Permissions::from_mode(mode | 0o700))?;
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            make_removable(&entry.path())?;
        }
    }
    Ok(())
}
