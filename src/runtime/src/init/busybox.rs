//! Guest tool discovery and the busybox fallback.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use firebox_core::error::{BoxError, Result};

use super::{REQUIRED_TOOLS, TOOL_DIRS};
use crate::rootfs::guest_path::{ensure_dir_in_root, resolve_in_root};

/// Host path of `tool` inside `root`, if any of the standard directories has it.
pub fn find_tool(root: &Path, tool: &str) -> Option<PathBuf> {
    TOOL_DIRS.iter().find_map(|dir| {
        let path = resolve_in_root(root, &format!("{}/{}", dir, tool))?;
        let meta = std::fs::metadata(&path).ok()?;
        (meta.is_file() && meta.permissions().mode() & 0o111 != 0).then_some(path)
    })
}

/// Required tools the image does not provide.
pub fn missing_tools(root: &Path) -> Vec<&'static str> {
    REQUIRED_TOOLS
        .iter()
        .copied()
        .filter(|tool| find_tool(root, tool).is_none())
        .collect()
}

/// Download cache for the static busybox.
pub struct ToolCache {
    cache_dir: PathBuf,
    url: String,
}

impl ToolCache {
    pub fn new(cache_dir: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            url: url.into(),
        }
    }

    pub fn busybox_path(&self) -> PathBuf {
        self.cache_dir.join("busybox")
    }

    /// Cached busybox, downloading it on first use.
    pub async fn ensure_busybox(&self) -> Result<PathBuf> {
        let path = self.busybox_path();
        if path.is_file() {
            tracing::debug!(path = %path.display(), "Using cached busybox");
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tracing::info!(url = %self.url, "Downloading busybox");

        let fetch_error = |message: String| BoxError::FetchError {
            url: self.url.clone(),
            message,
        };
        let mut response = reqwest::get(&self.url)
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }

        let partial = path.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| fetch_error(e.to_string()))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::set_permissions(&partial, std::fs::Permissions::from_mode(0o755)).await?;
        tokio::fs::rename(&partial, &path).await?;
        tracing::info!(path = %path.display(), bytes = written, "Cached busybox");
        Ok(path)
    }
}

/// Copy busybox to `/bin/busybox` in `root` and link each missing tool to it.
pub fn install_busybox(root: &Path, busybox: &Path, tools: &[&str]) -> Result<()> {
    let bin = ensure_dir_in_root(root, "/bin")?;
    let target = bin.join("busybox");
    std::fs::copy(busybox, &target).map_err(|e| {
        BoxError::Other(format!(
            "Failed to install busybox into {}: {}",
            target.display(),
            e
        ))
    })?;
    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;

    for tool in tools {
        let link = bin.join(tool);
        if std::fs::symlink_metadata(&link).is_ok() {
            std::fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink("/bin/busybox", &link)?;
    }
    tracing::info!(tools = ?tools, "Installed busybox applets");
    Ok(())
}
