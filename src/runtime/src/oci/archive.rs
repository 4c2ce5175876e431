//! Saved-image archives (`docker save` output).
//!
//! The archive is indexed once; each layer is then read straight out of
//! the tar by offset, so nothing is unpacked to disk besides the inflated
//! copy of a gzip-compressed archive.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use firebox_core::error::{BoxError, Result};

use super::manifest::ImageConfig;
use super::reference::sanitize_name;
use super::source::{ImageSource, LayerDescriptor};
use super::stream::LayerStream;

const MANIFEST_MEMBER: &str = "manifest.json";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_LINK_HOPS: usize = 8;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Member {
    File { offset: u64, size: u64 },
    Link(String),
}

/// Image loaded from a local archive.
pub struct ArchiveImage {
    path: PathBuf,
    tar_path: PathBuf,
    _inflated: Option<tempfile::NamedTempFile>,
    members: HashMap<String, Member>,
    repo_tags: Vec<String>,
    config: ImageConfig,
    layers: Vec<LayerDescriptor>,
}

impl ArchiveImage {
    /// Index an archive and read its manifest and image config.
    ///
    /// # Errors
    ///
    /// `ExtractionError` when the archive or a referenced member is missing,
    /// `SerializationError` when `manifest.json` or the config is malformed.
    pub fn open(path: &Path) -> Result<Self> {
        let (tar_path, inflated) = if is_gzip(path)? {
            let inflated = inflate(path)?;
            (inflated.path().to_path_buf(), Some(inflated))
        } else {
            (path.to_path_buf(), None)
        };

        let members = index_members(&tar_path)?;
        let mut image = Self {
            path: path.to_path_buf(),
            tar_path,
            _inflated: inflated,
            members,
            repo_tags: Vec::new(),
            config: ImageConfig::default(),
            layers: Vec::new(),
        };

        let manifest_bytes = image.read_member(MANIFEST_MEMBER)?;
        let mut entries: Vec<ArchiveManifestEntry> = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| {
                BoxError::SerializationError(format!("Invalid {}: {}", MANIFEST_MEMBER, e))
            })?;
        if entries.is_empty() {
            return Err(BoxError::SerializationError(format!(
                "{} lists no images",
                MANIFEST_MEMBER
            )));
        }
        if entries.len() > 1 {
            tracing::warn!(
                archive = %path.display(),
                images = entries.len(),
                "Archive holds several images; using the first"
            );
        }
        let entry = entries.swap_remove(0);

        image.config = ImageConfig::from_blob(&image.read_member(&entry.config)?)?;
        for layer in &entry.layers {
            let size = match image.resolve(layer)? {
                (_, Member::File { size, .. }) => size,
                (_, Member::Link(_)) => unreachable_link(layer)?,
            };
            image.layers.push(LayerDescriptor {
                id: layer.clone(),
                digest: blob_digest(layer),
                size: Some(size),
            });
        }
        image.repo_tags = entry.repo_tags.unwrap_or_default();

        tracing::info!(
            archive = %path.display(),
            layers = image.layers.len(),
            tags = ?image.repo_tags,
            "Archive indexed"
        );
        Ok(image)
    }

    /// Tags recorded for the image, if any.
    pub fn repo_tags(&self) -> &[String] {
        &self.repo_tags
    }

    fn resolve(&self, name: &str) -> Result<(String, Member)> {
        let mut current = normalize_member(name);
        for _ in 0..MAX_LINK_HOPS {
            match self.members.get(&current) {
                Some(Member::Link(target)) => {
                    current = join_link(&current, target);
                }
                Some(member) => return Ok((current, member.clone())),
                None => break,
            }
        }
        Err(BoxError::ExtractionError(format!(
            "{}: archive member '{}' not found",
            self.path.display(),
            name
        )))
    }

    fn read_member(&self, name: &str) -> Result<Vec<u8>> {
        let (_, member) = self.resolve(name)?;
        let Member::File { offset, size } = member else {
            return unreachable_link(name);
        };
        let mut file = File::open(&self.tar_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity(size as usize);
        file.take(size).read_to_end(&mut data)?;
        Ok(data)
    }
}

#[async_trait]
impl ImageSource for ArchiveImage {
    fn reference(&self) -> String {
        self.path.display().to_string()
    }

    fn artifact_name(&self) -> String {
        archive_stem(&self.path)
    }

    fn config(&self) -> &ImageConfig {
        &self.config
    }

    fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    async fn open_layer(&mut self, index: usize) -> Result<LayerStream> {
        let layer = self.layers.get(index).ok_or_else(|| {
            BoxError::Other(format!(
                "Layer index {} out of range ({} layers)",
                index,
                self.layers.len()
            ))
        })?;
        let (member_path, member) = self.resolve(&layer.id)?;
        let Member::File { offset, size } = member else {
            return unreachable_link(&layer.id);
        };

        let mut file = tokio::fs::File::open(&self.tar_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(LayerStream::from_reader(
            format!("{}:{}", self.path.display(), member_path),
            file.take(size),
            layer.digest.clone(),
        ))
    }
}

fn unreachable_link<T>(name: &str) -> Result<T> {
    Err(BoxError::ExtractionError(format!(
        "archive member '{}' is a link cycle",
        name
    )))
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| {
        BoxError::ExtractionError(format!("Failed to open archive {}: {}", path.display(), e))
    })?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn inflate(path: &Path) -> Result<tempfile::NamedTempFile> {
    let mut out = tempfile::Builder::new()
        .prefix("firebox-archive-")
        .suffix(".tar")
        .tempfile()?;
    let mut decoder = flate2::read::GzDecoder::new(BufReader::new(File::open(path)?));
    let written = std::io::copy(&mut decoder, out.as_file_mut()).map_err(|e| {
        BoxError::ExtractionError(format!("Failed to inflate {}: {}", path.display(), e))
    })?;
    tracing::debug!(archive = %path.display(), bytes = written, "Inflated compressed archive");
    Ok(out)
}

fn index_members(tar_path: &Path) -> Result<HashMap<String, Member>> {
    let file = File::open(tar_path)?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut members = HashMap::new();

    let entries = archive.entries().map_err(|e| {
        BoxError::ExtractionError(format!("Failed to read {}: {}", tar_path.display(), e))
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            BoxError::ExtractionError(format!("Corrupt archive {}: {}", tar_path.display(), e))
        })?;
        let name = normalize_member(&entry.path()?.to_string_lossy());
        let kind = entry.header().entry_type();

        if kind.is_file() {
            members.insert(
                name,
                Member::File {
                    offset: entry.raw_file_position(),
                    size: entry.size(),
                },
            );
        } else if kind.is_symlink() || kind.is_hard_link() {
            if let Some(target) = entry.link_name()? {
                let target = target.to_string_lossy().to_string();
                let target = if kind.is_hard_link() {
                    normalize_member(&target)
                } else {
                    join_link(&name, &target)
                };
                members.insert(name, Member::Link(target));
            }
        }
    }
    Ok(members)
}

/// Member names without `./` prefixes or trailing slashes.
fn normalize_member(name: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts.join("/")
}

/// Resolve a symlink target relative to the link's directory.
fn join_link(link: &str, target: &str) -> String {
    if target.starts_with('/') {
        return normalize_member(target);
    }
    let parent = Path::new(link).parent().unwrap_or_else(|| Path::new(""));
    normalize_member(&parent.join(target).to_string_lossy())
}

/// OCI-layout archives name layers `blobs/sha256/<hex>`, which doubles as a digest.
fn blob_digest(member: &str) -> Option<String> {
    let hex = normalize_member(member)
        .strip_prefix("blobs/sha256/")?
        .to_string();
    (hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit())).then(|| format!("sha256:{}", hex))
}

/// Archive file name without `.tar`, `.tar.gz` or `.tgz`.
pub fn archive_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let stem = [".tar.gz", ".tgz", ".tar"]
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(&name);
    sanitize_name(stem)
}
