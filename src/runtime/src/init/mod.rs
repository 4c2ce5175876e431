//! Guest init synthesis.
//!
//! Firecracker boots the kernel straight into the rootfs, so nothing replays
//! the image's `Env`, `WorkingDir`, `Entrypoint` and `Cmd`. A small shell
//! script installed as the kernel's `init=` does that, and picks up
//! launch-time variables written into the image before boot.

pub mod busybox;
pub mod script;
mod synth;

pub use busybox::{find_tool, install_busybox, missing_tools, ToolCache};
pub use script::InitScript;
pub use synth::{effective_command, InitProgram, InitSynthesizer};

/// Where the generated init script is written.
pub const INIT_ENTRYPOINT_PATH: &str = "/sbin/init-entrypoint";

/// Locations probed for a generated init at launch time.
pub const INIT_ENTRYPOINT_CANDIDATES: [&str; 3] = [
    "/sbin/init-entrypoint",
    "/usr/sbin/init-entrypoint",
    "/usr/bin/init-entrypoint",
];

/// Launch-time variables sourced by the init script.
pub const ENV_FILE_PATH: &str = "/etc/profile.d/01-container-env-vars.sh";

/// Extra arguments from the launcher, shell-quoted.
pub const INIT_ARGS_VAR: &str = "INIT_ARGS";

/// UID the workload drops to; unset or 0 keeps root.
pub const INIT_UID_VAR: &str = "INIT_UID";

/// Executables the init script relies on.
pub const REQUIRED_TOOLS: [&str; 6] = ["sh", "hostname", "cat", "mount", "chmod", "setpriv"];

/// Directories searched for [`REQUIRED_TOOLS`].
pub const TOOL_DIRS: [&str; 4] = ["/bin", "/usr/bin", "/sbin", "/usr/sbin"];
