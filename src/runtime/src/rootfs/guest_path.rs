//! Resolve guest paths against an unpacked root without escaping it.
//!
//! Absolute symlinks in an image point into the image, not the host, so
//! every link is re-anchored at the root while walking.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

const MAX_SYMLINK_HOPS: usize = 40;

fn push_components(path: &Path, out: &mut Vec<OsString>) {
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part.to_os_string()),
            Component::ParentDir => out.push(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
}

fn host_path(root: &Path, resolved: &[OsString]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(resolved);
    path
}

/// Host path of `guest_path` inside `root`, following symlinks within the root.
///
/// Returns `None` when any component is missing or links loop.
pub fn resolve_in_root(root: &Path, guest_path: &str) -> Option<PathBuf> {
    let mut initial = Vec::new();
    push_components(Path::new(guest_path), &mut initial);
    let mut pending: VecDeque<OsString> = initial.into();
    let mut resolved: Vec<OsString> = Vec::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let candidate = host_path(root, &resolved).join(&part);
        let meta = fs::symlink_metadata(&candidate).ok()?;
        if !meta.file_type().is_symlink() {
            resolved.push(part);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return None;
        }
        let target = fs::read_link(&candidate).ok()?;
        if target.is_absolute() {
            resolved.clear();
        }
        let mut parts = Vec::new();
        push_components(&target, &mut parts);
        for part in parts.into_iter().rev() {
            pending.push_front(part);
        }
    }

    Some(host_path(root, &resolved))
}

/// Host directory for `guest_dir`, created (with parents) if it does not resolve.
///
/// Creation happens only below the deepest existing ancestor, itself
/// resolved inside the root, so symlinked directories like `/sbin -> usr/sbin`
/// are honoured.
pub fn ensure_dir_in_root(root: &Path, guest_dir: &str) -> std::io::Result<PathBuf> {
    if let Some(path) = resolve_in_root(root, guest_dir) {
        if path.is_dir() {
            return Ok(path);
        }
    }

    let mut parts = Vec::new();
    push_components(Path::new(guest_dir), &mut parts);
    let mut base = root.to_path_buf();
    let mut guest = String::new();
    for part in parts {
        guest.push('/');
        guest.push_str(&part.to_string_lossy());
        base = match resolve_in_root(root, &guest) {
            Some(path) if path.is_dir() => path,
            _ => {
                let next = base.join(&part);
                fs::create_dir(&next)?;
                next
            }
        };
    }
    Ok(base)
}
