//! Common interface over registry images and saved archives.

use async_trait::async_trait;

use firebox_core::error::Result;

use super::manifest::ImageConfig;
use super::stream::LayerStream;

/// Where a layer lives inside its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Blob digest or archive member path
    pub id: String,
    /// Digest the stream is verified against, when known
    pub digest: Option<String>,
    /// Stored size in bytes, when known
    pub size: Option<u64>,
}

/// A resolved image whose layers can be streamed in order.
#[async_trait]
pub trait ImageSource: Send {
    /// Human-readable origin ("docker.io/library/nginx:latest", "./app.tar").
    fn reference(&self) -> String;

    /// Default artifact directory name.
    fn artifact_name(&self) -> String;

    /// Manifest digest, when the source has one.
    fn manifest_digest(&self) -> Option<String> {
        None
    }

    /// Runtime settings from the image config.
    fn config(&self) -> &ImageConfig;

    /// Layers in application order (base first).
    fn layers(&self) -> &[LayerDescriptor];

    /// Open layer `index` for streaming.
    async fn open_layer(&mut self, index: usize) -> Result<LayerStream>;
}
