//! Image-to-artifact conversion pipeline.
//!
//! Assemble → synthesize init → package, inside a scratch directory under
//! the output directory. The artifact directory only appears once every
//! stage has succeeded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use firebox_core::config::BuildConfig;
use firebox_core::error::{BoxError, Result};

use crate::init::{InitProgram, InitSynthesizer, ToolCache};
use crate::oci::ImageSource;
use crate::package::Packager;
use crate::rootfs::{permissions, RootfsAssembler};
use crate::tools::{E2fsTools, Ext4Tools, LayerExtractor, PrivilegeMode, TarExtractor};

/// Filesystem image inside an artifact directory.
pub const ROOTFS_FILE: &str = "rootfs.ext4";

/// Metadata document inside an artifact directory.
pub const ARTIFACT_FILE: &str = "artifact.json";

const FAKEROOT_STATE_FILE: &str = "fakeroot.state";

/// Contents of `artifact.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub name: String,
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
    pub init: InitProgram,
    pub block_count: u64,
    pub block_size: u64,
    pub created_at: DateTime<Utc>,
}

/// A finished artifact directory.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub dir: PathBuf,
    pub rootfs: PathBuf,
    pub metadata: ArtifactMetadata,
}

impl Artifact {
    /// Load an artifact directory written by [`ArtifactBuilder::build`].
    pub fn load(dir: &Path) -> Result<Self> {
        let data = std::fs::read(dir.join(ARTIFACT_FILE)).map_err(|e| {
            BoxError::ConfigError(format!(
                "{} is not an artifact directory: {}",
                dir.display(),
                e
            ))
        })?;
        let metadata: ArtifactMetadata = serde_json::from_slice(&data)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            rootfs: dir.join(ROOTFS_FILE),
            metadata,
        })
    }
}

/// Scratch directory removed on drop, read-only directories included.
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    fn create(parent: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(".firebox-build-")
            .tempdir_in(parent)?;
        Ok(Self {
            path: dir.into_path(),
        })
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = permissions::make_removable(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to unlock work directory");
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove work directory");
        }
    }
}

enum Tooling {
    Host,
    Custom {
        extractor: Arc<dyn LayerExtractor>,
        ext4: Arc<dyn Ext4Tools>,
    },
}

/// Converts image sources into artifact directories.
pub struct ArtifactBuilder {
    config: BuildConfig,
    tooling: Tooling,
}

impl ArtifactBuilder {
    /// Builder driving the host's `tar`, `fakeroot` and e2fsprogs.
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            tooling: Tooling::Host,
        }
    }

    /// Builder with explicit tool implementations.
    pub fn with_tools(
        config: BuildConfig,
        extractor: Arc<dyn LayerExtractor>,
        ext4: Arc<dyn Ext4Tools>,
    ) -> Self {
        Self {
            config,
            tooling: Tooling::Custom { extractor, ext4 },
        }
    }

    /// Run the whole pipeline for `source`.
    ///
    /// # Errors
    ///
    /// Any stage failure aborts the build; the scratch directory is removed
    /// and no artifact directory is created.
    pub async fn build(&self, source: &mut dyn ImageSource) -> Result<Artifact> {
        let output_dir = &self.config.output_dir;
        std::fs::create_dir_all(output_dir)?;
        let name = source.artifact_name();
        let artifact_dir = output_dir.join(&name);

        tracing::info!(
            reference = %source.reference(),
            artifact = %artifact_dir.display(),
            "Building artifact"
        );

        let work = WorkDir::create(output_dir)?;
        let tree = work.path.join("rootfs");
        let staging = work.path.join("artifact");
        std::fs::create_dir_all(&staging)?;

        let (extractor, ext4) = match &self.tooling {
            Tooling::Host => {
                // One fakeroot session spans extraction and mkfs.
                let privilege = PrivilegeMode::detect(work.path.join(FAKEROOT_STATE_FILE))?;
                let extractor: Arc<dyn LayerExtractor> =
                    Arc::new(TarExtractor::new(privilege.clone()));
                let ext4: Arc<dyn Ext4Tools> = Arc::new(E2fsTools::new(privilege));
                (extractor, ext4)
            }
            Tooling::Custom { extractor, ext4 } => (extractor.clone(), ext4.clone()),
        };

        RootfsAssembler::new(extractor)
            .assemble(source, &tree)
            .await?;

        let synthesizer = InitSynthesizer::new(ToolCache::new(
            &self.config.cache_dir,
            &self.config.busybox_url,
        ));
        let init = synthesizer
            .synthesize(
                &tree,
                source.config(),
                self.config.entrypoint_override.as_deref(),
            )
            .await?;

        let image = Packager::new(ext4).package(
            &tree,
            &staging.join(ROOTFS_FILE),
            self.config.size_bytes,
        )?;

        let metadata = ArtifactMetadata {
            name: name.clone(),
            reference: source.reference(),
            manifest_digest: source.manifest_digest(),
            init,
            block_count: image.block_count,
            block_size: image.block_size,
            created_at: Utc::now(),
        };
        std::fs::write(
            staging.join(ARTIFACT_FILE),
            serde_json::to_vec_pretty(&metadata)?,
        )?;

        if artifact_dir.exists() {
            tracing::info!(artifact = %artifact_dir.display(), "Replacing existing artifact");
            std::fs::remove_dir_all(&artifact_dir)?;
        }
        std::fs::rename(&staging, &artifact_dir).map_err(|e| {
            BoxError::PackagingError(format!(
                "Failed to move artifact into {}: {}",
                artifact_dir.display(),
                e
            ))
        })?;

        tracing::info!(artifact = %artifact_dir.display(), "Artifact ready");
        Ok(Artifact {
            rootfs: artifact_dir.join(ROOTFS_FILE),
            dir: artifact_dir,
            metadata,
        })
    }
}
