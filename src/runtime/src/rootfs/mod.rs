//! Rootfs assembly from image layers.
//!
//! Layers are unpacked in order into one directory tree; permission
//! anomalies are opened up so later layers and whiteouts can be applied,
//! then restored once the tree is complete.

mod assembler;
pub mod guest_path;
pub mod permissions;
pub mod whiteout;

pub use assembler::RootfsAssembler;
pub use guest_path::{ensure_dir_in_root, resolve_in_root};
pub use permissions::{NormalizeReport, PermissionAnomalySet};
pub use whiteout::{apply_whiteouts, WhiteoutReport, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
