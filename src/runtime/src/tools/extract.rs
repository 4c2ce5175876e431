//! Layer extraction through the host `tar`.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use firebox_core::error::{BoxError, Result};

use super::privilege::PrivilegeMode;
use crate::oci::stream::LayerStream;

/// Compression of a layer blob, sniffed from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    None,
}

impl Compression {
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::None
        }
    }

    fn tar_flag(&self) -> Option<&'static str> {
        match self {
            Self::Gzip => Some("--gzip"),
            Self::Zstd => Some("--zstd"),
            Self::None => None,
        }
    }
}

/// Unpacks one layer stream into a directory tree.
#[async_trait]
pub trait LayerExtractor: Send + Sync {
    async fn extract(&self, stream: &mut LayerStream, dest: &Path) -> Result<()>;
}

/// Pipes layers into `tar -x`, under fakeroot when unprivileged.
pub struct TarExtractor {
    privilege: PrivilegeMode,
}

impl TarExtractor {
    pub fn new(privilege: PrivilegeMode) -> Self {
        Self { privilege }
    }
}

#[async_trait]
impl LayerExtractor for TarExtractor {
    async fn extract(&self, stream: &mut LayerStream, dest: &Path) -> Result<()> {
        let Some(first) = stream.next_chunk().await? else {
            tracing::debug!(layer = %stream.label(), "Empty layer blob");
            return Ok(());
        };
        let compression = Compression::sniff(&first);

        let mut cmd = self.privilege.async_command("tar");
        cmd.arg("-x")
            .arg("-f")
            .arg("-")
            .arg("-C")
            .arg(dest)
            .arg("--numeric-owner")
            .arg("--same-permissions");
        if let Some(flag) = compression.tar_flag() {
            cmd.arg(flag);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BoxError::ExtractionError(format!("Failed to spawn tar: {}", e)))?;

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(ref mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BoxError::ExtractionError("tar stdin unavailable".to_string()))?;

        // A write failure usually means tar exited; its status explains why.
        let mut pump_error = None;
        let mut chunk = Some(first);
        while let Some(data) = chunk {
            if let Err(e) = stdin.write_all(&data).await {
                pump_error = Some(e);
                break;
            }
            chunk = match stream.next_chunk().await {
                Ok(next) => next,
                Err(e) => {
                    drop(stdin);
                    let _ = child.kill().await;
                    return Err(e);
                }
            };
        }
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| BoxError::ExtractionError(format!("Failed to wait for tar: {}", e)))?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(BoxError::ExtractionError(format!(
                "tar exited with {} for {}: {}",
                status,
                stream.label(),
                stderr.trim()
            )));
        }
        match pump_error {
            // tar stops reading at the end-of-archive marker; trailing padding
            // still has to pass through the digest check.
            Some(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                while stream.next_chunk().await?.is_some() {}
            }
            Some(e) => {
                return Err(BoxError::ExtractionError(format!(
                    "Failed to feed {} to tar: {}",
                    stream.label(),
                    e
                )));
            }
            None => {}
        }

        tracing::debug!(
            layer = %stream.label(),
            bytes = stream.bytes_read(),
            compression = ?compression,
            "Layer extracted"
        );
        Ok(())
    }
}
