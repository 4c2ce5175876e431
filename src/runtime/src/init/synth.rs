use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use firebox_core::error::{BoxError, Result};

use super::busybox::{install_busybox, missing_tools, ToolCache};
use super::script::InitScript;
use super::INIT_ENTRYPOINT_PATH;
use crate::oci::ImageConfig;
use crate::rootfs::guest_path::ensure_dir_in_root;

/// What the guest kernel will run as PID 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitProgram {
    /// A generated script at `path` (guest path).
    Generated { path: String },
    /// The image's own `/sbin/init`.
    ExistingInit,
}

/// Entrypoint and cmd after applying an override.
///
/// An override replaces the entrypoint and clears cmd.
pub fn effective_command(
    config: &ImageConfig,
    entrypoint_override: Option<&[String]>,
) -> (Vec<String>, Vec<String>) {
    match entrypoint_override {
        Some(entrypoint) => (entrypoint.to_vec(), Vec::new()),
        None => (config.entrypoint.clone(), config.cmd.clone()),
    }
}

/// Writes the guest init and fills in missing tools.
pub struct InitSynthesizer {
    tools: ToolCache,
}

impl InitSynthesizer {
    pub fn new(tools: ToolCache) -> Self {
        Self { tools }
    }

    /// Install an init for `config` into the tree at `dest`.
    ///
    /// Images whose command is exactly `/sbin/init` keep their own init and
    /// nothing is written.
    pub async fn synthesize(
        &self,
        dest: &Path,
        config: &ImageConfig,
        entrypoint_override: Option<&[String]>,
    ) -> Result<InitProgram> {
        let (entrypoint, cmd) = effective_command(config, entrypoint_override);
        let command = if entrypoint.is_empty() { &cmd } else { &entrypoint };
        if command.len() == 1 && command[0] == "/sbin/init" {
            tracing::info!("Image runs its own /sbin/init");
            return Ok(InitProgram::ExistingInit);
        }

        let script = InitScript {
            env: config.env.clone(),
            working_dir: config.working_dir().to_string(),
            entrypoint,
            cmd,
        };
        let path = write_script(dest, &script.render())?;
        tracing::info!(path = %path.display(), "Wrote init script");

        let missing = missing_tools(dest);
        if !missing.is_empty() {
            tracing::info!(missing = ?missing, "Image lacks init tools; using busybox");
            let busybox = self.tools.ensure_busybox().await?;
            install_busybox(dest, &busybox, &missing)?;
        }

        Ok(InitProgram::Generated {
            path: INIT_ENTRYPOINT_PATH.to_string(),
        })
    }
}

fn write_script(dest: &Path, contents: &str) -> Result<PathBuf> {
    let (dir, name) = INIT_ENTRYPOINT_PATH
        .rsplit_once('/')
        .ok_or_else(|| BoxError::Other("init path has no directory".to_string()))?;
    let dir = ensure_dir_in_root(dest, dir)?;
    let path = dir.join(name);
    if std::fs::symlink_metadata(&path).is_ok() {
        std::fs::remove_file(&path)?;
    }
    std::fs::write(&path, contents)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::REQUIRED_TOOLS;
    use crate::testing::write_executable;
    use tempfile::TempDir;

    fn config(entrypoint: &[&str], cmd: &[&str]) -> ImageConfig {
        ImageConfig {
            env: vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()],
            entrypoint: entrypoint.iter().map(|s| s.to_string()).collect(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn synthesizer(cache: &Path) -> InitSynthesizer {
        InitSynthesizer::new(ToolCache::new(cache, "http://127.0.0.1:9/unreachable"))
    }

    fn complete_root(root: &Path) {
        for tool in REQUIRED_TOOLS {
            write_executable(root, &format!("/bin/{}", tool));
        }
    }

    #[test]
    fn test_override_replaces_entrypoint_and_clears_cmd() {
        let c = config(&["/entry"], &["arg"]);
        let over = vec!["/bin/sh".to_string(), "-c".to_string()];
        assert_eq!(
            effective_command(&c, Some(&over)),
            (over.clone(), Vec::<String>::new())
        );
        assert_eq!(
            effective_command(&c, None),
            (vec!["/entry".to_string()], vec!["arg".to_string()])
        );
    }

    #[tokio::test]
    async fn test_sbin_init_is_kept() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let program = synthesizer(tmp.path())
            .synthesize(&root, &config(&[], &["/sbin/init"]), None)
            .await
            .unwrap();
        assert_eq!(program, InitProgram::ExistingInit);
        assert!(!root.join("sbin/init-entrypoint").exists());
    }

    #[tokio::test]
    async fn test_generates_executable_script() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        complete_root(&root);

        let program = synthesizer(tmp.path())
            .synthesize(&root, &config(&[], &["/bin/echo", "hi"]), None)
            .await
            .unwrap();
        assert_eq!(
            program,
            InitProgram::Generated {
                path: "/sbin/init-entrypoint".to_string()
            }
        );

        let path = root.join("sbin/init-entrypoint");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("export \"PATH=/usr/local/bin:/usr/bin:/bin\""));
        assert!(text.contains("set -- /bin/echo hi"));
        assert!(text.contains("cd / || exit 1"));
    }

    #[tokio::test]
    async fn test_override_of_sbin_init_image_generates_script() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        complete_root(&root);
        let over = vec!["/usr/bin/app".to_string()];

        let program = synthesizer(tmp.path())
            .synthesize(&root, &config(&[], &["/sbin/init"]), Some(&over))
            .await
            .unwrap();
        assert!(matches!(program, InitProgram::Generated { .. }));
        let text = std::fs::read_to_string(root.join("sbin/init-entrypoint")).unwrap();
        assert!(text.contains("set -- /usr/bin/app\n"));
    }

    #[tokio::test]
    async fn test_script_follows_usrmerge_symlink() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        complete_root(&root);
        std::fs::create_dir_all(root.join("usr/sbin")).unwrap();
        std::os::unix::fs::symlink("usr/sbin", root.join("sbin")).unwrap();

        synthesizer(tmp.path())
            .synthesize(&root, &config(&["/app"], &[]), None)
            .await
            .unwrap();
        assert!(root.join("usr/sbin/init-entrypoint").is_file());
    }

    #[tokio::test]
    async fn test_missing_tools_use_cached_busybox() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        write_executable(&root, "/bin/sh");
        let cache = tmp.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("busybox"), b"\x7fELF").unwrap();

        synthesizer(&cache)
            .synthesize(&root, &config(&[], &["/bin/true"]), None)
            .await
            .unwrap();

        assert!(root.join("bin/busybox").is_file());
        assert_eq!(
            std::fs::read_link(root.join("bin/setpriv")).unwrap(),
            PathBuf::from("/bin/busybox")
        );
        assert!(std::fs::read_link(root.join("bin/sh")).is_err());
        assert!(missing_tools(&root).is_empty());
    }
}
