//! Guest environment inferred from the launcher's environment.

use std::ffi::OsString;

use firebox_core::config::ENV_PREFIX;

use crate::init::{INIT_ARGS_VAR, INIT_UID_VAR};

/// Host variables that describe the host session, not the workload.
pub const ENV_DENYLIST: [&str; 12] = [
    "_", "PWD", "OLDPWD", "SHLVL", "HOME", "HOSTNAME", "PATH", "TERM", "USER", "LOGNAME",
    "SHELL", "MAIL",
];

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `__NAME__` forwards `NAME` even if it is denylisted.
fn unwrap_passthrough(name: &str) -> Option<&str> {
    name.strip_prefix("__")?
        .strip_suffix("__")
        .filter(|inner| !inner.is_empty())
}

/// Variables to export in the guest, in input order.
///
/// Skips denylisted names, launcher settings (`FIREBOX_*`), the init's own
/// variables, invalid names and values that are multi-line or not UTF-8.
pub fn infer_guest_env<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut out = Vec::new();
    for (name, value) in vars {
        let Some(name) = name.to_str().map(str::to_string) else {
            tracing::warn!(name = ?name, "Skipping variable with non-UTF-8 name");
            continue;
        };
        if name.starts_with(ENV_PREFIX) {
            continue;
        }
        let guest_name = match unwrap_passthrough(&name) {
            Some(inner) => inner.to_string(),
            None if ENV_DENYLIST.contains(&name.as_str()) => continue,
            None => name.clone(),
        };
        if guest_name == INIT_ARGS_VAR || guest_name == INIT_UID_VAR || !is_identifier(&guest_name) {
            tracing::warn!(name = %name, "Skipping variable not exportable to the guest");
            continue;
        }
        let Some(value) = value.to_str().map(str::to_string) else {
            tracing::warn!(name = %name, "Skipping variable with non-UTF-8 value");
            continue;
        };
        if value.contains('\n') {
            tracing::warn!(name = %name, "Skipping multi-line variable");
            continue;
        }
        out.push((guest_name, value));
    }
    out
}

/// Contents of the guest env file sourced by the init script.
pub fn render_env_file(vars: &[(String, String)], uid: u32, init_args: Option<&str>) -> String {
    let mut out = String::new();
    for (name, value) in vars {
        out.push_str(&format!("export {}={}\n", name, shell_words::quote(value)));
    }
    out.push_str(&format!("export {}={}\n", INIT_UID_VAR, uid));
    if let Some(args) = init_args {
        out.push_str(&format!(
            "export {}={}\n",
            INIT_ARGS_VAR,
            shell_words::quote(args)
        ));
    }
    out
}

/// Shell-quote positional arguments into a single `INIT_ARGS` value.
pub fn join_init_args(args: &[String]) -> Option<String> {
    if args.is_empty() {
        None
    } else {
        Some(shell_words::join(args))
    }
}
