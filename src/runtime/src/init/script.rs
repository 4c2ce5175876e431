//! Rendering of the generated guest init script.

use super::{ENV_FILE_PATH, INIT_ARGS_VAR, INIT_UID_VAR};

/// Inputs of the generated `/sbin/init-entrypoint`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitScript {
    pub env: Vec<String>,
    pub working_dir: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

/// Quote for use inside double quotes.
fn double_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn quote_words(words: &[String]) -> String {
    words
        .iter()
        .map(|w| shell_words::quote(w).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

impl InitScript {
    /// The complete script.
    pub fn render(&self) -> String {
        let mut script = String::from("#!/bin/sh\n");
        script.push_str(&self.env_section());
        script.push_str(&self.setup_section());
        script.push_str(&self.workdir_section());
        script.push_str(&self.argv_section());
        script.push_str(&self.exec_section());
        script
    }

    /// Image `Env`, exported verbatim. Entries without `=` are dropped.
    pub fn env_section(&self) -> String {
        let mut out = String::new();
        for entry in &self.env {
            if entry.split_once('=').map(|(k, _)| k.is_empty()).unwrap_or(true) {
                tracing::warn!(entry = %entry, "Skipping malformed Env entry");
                continue;
            }
            out.push_str(&format!("export {}\n", double_quote(entry)));
        }
        out
    }

    /// Launch-time variables, kernel filesystems, /tmp and hostname.
    pub fn setup_section(&self) -> String {
        format!(
            "if [ -f {env} ]; then\n\
             \x20   . {env}\n\
             fi\n\
             if [ -d /proc ]; then\n\
             \x20   mount -t proc proc /proc\n\
             fi\n\
             if [ -d /tmp ]; then\n\
             \x20   chmod 1777 /tmp\n\
             fi\n\
             if [ -f /etc/hostname ]; then\n\
             \x20   hostname \"$(cat /etc/hostname)\"\n\
             fi\n",
            env = ENV_FILE_PATH
        )
    }

    pub fn workdir_section(&self) -> String {
        let dir = if self.working_dir.is_empty() {
            "/"
        } else {
            self.working_dir.as_str()
        };
        format!("cd {} || exit 1\n", shell_words::quote(dir))
    }

    /// Builds `"$@"`.
    ///
    /// Without an entrypoint, `INIT_ARGS` replaces `Cmd`. With one, `Cmd`
    /// and then `INIT_ARGS` are appended to it.
    pub fn argv_section(&self) -> String {
        let args = INIT_ARGS_VAR;
        let mut out = String::new();
        if self.entrypoint.is_empty() {
            out.push_str(&format!("if [ -n \"${{{args}:-}}\" ]; then\n"));
            out.push_str(&format!("    eval \"set -- ${args}\"\n"));
            out.push_str("else\n");
            out.push_str(&format!("    set -- {}\n", quote_words(&self.cmd)));
            out.push_str("fi\n");
        } else {
            let mut words = self.entrypoint.clone();
            words.extend(self.cmd.iter().cloned());
            out.push_str(&format!("set -- {}\n", quote_words(&words)));
            out.push_str(&format!("if [ -n \"${{{args}:-}}\" ]; then\n"));
            out.push_str(&format!("    eval \"set -- \\\"\\$@\\\" ${args}\"\n"));
            out.push_str("fi\n");
        }
        out.push_str("if [ $# -eq 0 ]; then\n");
        out.push_str("    echo \"init-entrypoint: no command to run\" >&2\n");
        out.push_str("    exit 1\n");
        out.push_str("fi\n");
        out
    }

    pub fn exec_section(&self) -> String {
        let uid = INIT_UID_VAR;
        format!(
            "if [ \"${{{uid}:-0}}\" = \"0\" ]; then\n\
             \x20   exec \"$@\"\n\
             fi\n\
             exec setpriv --reuid=\"${uid}\" --regid=\"${uid}\" --clear-groups \"$@\"\n"
        )
    }
}
