//! External tools the pipeline drives: `tar`, `fakeroot` and e2fsprogs.

pub mod e2fs;
pub mod extract;
pub mod privilege;

pub use e2fs::{E2fsTools, Ext4Tools, FsckReport, ResizeTarget};
pub use extract::{Compression, LayerExtractor, TarExtractor};
pub use privilege::{is_root, PrivilegeMode};
