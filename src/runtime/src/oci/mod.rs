//! Image sources: registry pulls and saved archives.
//!
//! Both sources resolve to the same shape: an image config plus an ordered
//! list of layers that can be streamed one at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │    RegistryImage     │      │     ArchiveImage     │
//! │  token → manifest    │      │  manifest.json →     │
//! │  (list → amd64) →    │      │  member index        │
//! │  config blob         │      │  (offset, size)      │
//! └──────────┬───────────┘      └──────────┬───────────┘
//!            │        impl ImageSource     │
//!            └──────────────┬──────────────┘
//!                           ▼
//!                  LayerStream (chunks,
//!                  sha256 verified at EOF)
//! ```

pub mod archive;
pub mod manifest;
mod pull;
pub mod reference;
pub mod registry;
pub mod source;
pub mod stream;

pub use archive::ArchiveImage;
pub use manifest::{Descriptor, ImageConfig, Manifest, Platform, PlatformEntry, PlatformManifest};
pub use pull::RegistryImage;
pub use reference::ImageReference;
pub use registry::{
    resolve_manifest, BearerToken, ManifestFetcher, RawManifestResponse, RegistryClient,
    ResolvedManifest,
};
pub use source::{ImageSource, LayerDescriptor};
pub use stream::LayerStream;

use std::path::Path;

use firebox_core::error::Result;

/// Open `input` as an archive when it names an existing file, else pull it.
pub async fn open_source(input: &str) -> Result<Box<dyn ImageSource>> {
    let path = Path::new(input);
    if path.is_file() {
        tracing::info!(archive = %path.display(), "Loading image archive");
        return Ok(Box::new(ArchiveImage::open(path)?));
    }
    let reference = ImageReference::parse(input)?;
    Ok(Box::new(RegistryImage::pull(&reference).await?))
}
