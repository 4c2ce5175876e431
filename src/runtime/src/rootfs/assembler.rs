//! Layer-by-layer rootfs assembly.

use std::path::Path;
use std::sync::Arc;

use firebox_core::error::{BoxError, Result};

use super::permissions::{self, PermissionAnomalySet};
use super::whiteout;
use crate::oci::ImageSource;
use crate::tools::LayerExtractor;

/// Unpacks an image's layers into a directory.
pub struct RootfsAssembler {
    extractor: Arc<dyn LayerExtractor>,
}

impl RootfsAssembler {
    pub fn new(extractor: Arc<dyn LayerExtractor>) -> Self {
        Self { extractor }
    }

    /// Apply every layer of `source` to `dest`, in order.
    ///
    /// Each layer is extracted, normalized, then has its whiteouts applied.
    /// Directories opened up along the way are restored before returning.
    /// On error `dest` is left as is for the caller to discard.
    pub async fn assemble(
        &self,
        source: &mut dyn ImageSource,
        dest: &Path,
    ) -> Result<PermissionAnomalySet> {
        std::fs::create_dir_all(dest)?;
        let mut anomalies = PermissionAnomalySet::new();
        let total = source.layers().len();

        for index in 0..total {
            let layer_id = source.layers()[index].id.clone();
            tracing::info!(layer = %layer_id, index = index + 1, total, "Applying layer");

            let mut stream = source.open_layer(index).await?;
            self.extractor
                .extract(&mut stream, dest)
                .await
                .map_err(|e| match e {
                    BoxError::ExtractionError(msg) => BoxError::ExtractionError(format!(
                        "layer {}/{} ({}): {}",
                        index + 1,
                        total,
                        layer_id,
                        msg
                    )),
                    other => other,
                })?;

            permissions::normalize(dest, &mut anomalies)?;
            whiteout::apply_whiteouts(dest)?;
        }

        let restored = permissions::restore(&anomalies)?;
        tracing::info!(
            layers = total,
            restored_dirs = restored,
            "Rootfs assembled"
        );
        Ok(anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryImage, TarballExtractor};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_assemble_applies_layers_in_order() {
        let mut image = MemoryImage::new(vec![
            MemoryImage::layer(&[
                ("etc/os-release", b"ID=test\n".as_slice()),
                ("etc/motd", b"base".as_slice()),
                ("opt/app/v1", b"1".as_slice()),
            ]),
            MemoryImage::layer(&[
                ("etc/.wh.motd", b"".as_slice()),
                ("opt/.wh.app", b"".as_slice()),
            ]),
            MemoryImage::layer(&[("opt/app/v3", b"3".as_slice())]),
        ]);
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("rootfs");

        let assembler = RootfsAssembler::new(Arc::new(TarballExtractor));
        assembler.assemble(&mut image, &dest).await.unwrap();

        assert!(dest.join("etc/os-release").exists());
        assert!(!dest.join("etc/motd").exists());
        assert!(!dest.join("etc/.wh.motd").exists());
        assert!(!dest.join("opt/app/v1").exists());
        assert!(dest.join("opt/app/v3").exists());
        assert!(!dest.join("opt/.wh.app").exists());
    }

    #[tokio::test]
    async fn test_assemble_restores_read_only_dirs() {
        let mut image = MemoryImage::new(vec![
            MemoryImage::layer_with_modes(&[("ro", None, 0o555), ("ro/a", Some(b"a".as_slice()), 0o644)]),
            MemoryImage::layer(&[("ro/.wh.a", b"".as_slice())]),
        ]);
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("rootfs");

        let assembler = RootfsAssembler::new(Arc::new(TarballExtractor));
        let anomalies = assembler.assemble(&mut image, &dest).await.unwrap();

        assert!(anomalies.contains(&dest.join("ro")));
        assert!(!dest.join("ro/a").exists());
        let mode = std::fs::metadata(dest.join("ro")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o555);
        permissions::make_removable(&dest).unwrap();
    }

    #[tokio::test]
    async fn test_extraction_error_names_layer() {
        let mut image = MemoryImage::new(vec![b"not a tarball".to_vec()]);
        let tmp = TempDir::new().unwrap();
        let assembler = RootfsAssembler::new(Arc::new(TarballExtractor));
        let err = assembler
            .assemble(&mut image, &tmp.path().join("rootfs"))
            .await
            .unwrap_err();
        assert!(matches!(err, BoxError::ExtractionError(_)));
        assert!(err.to_string().contains("layer 1/1"));
    }
}
