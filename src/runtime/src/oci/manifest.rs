//! Manifest, manifest-list and image config documents.

use serde::{Deserialize, Deserializer, Serialize};

use firebox_core::error::{BoxError, Result};

pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_V2: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Platform the produced rootfs targets.
pub const TARGET_OS: &str = "linux";
pub const TARGET_ARCHITECTURE: &str = "amd64";

/// Content descriptor (config or layer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

impl Descriptor {
    /// Foreign layers (Windows base images) are never served by the registry.
    pub fn is_foreign(&self) -> bool {
        self.media_type.contains("foreign")
    }
}

/// Platform of a manifest-list entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// One entry of a manifest list / image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformEntry {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

impl PlatformEntry {
    pub fn matches_target(&self) -> bool {
        self.platform
            .as_ref()
            .map(|p| p.os == TARGET_OS && p.architecture == TARGET_ARCHITECTURE)
            .unwrap_or(false)
    }

    pub fn platform_label(&self) -> String {
        self.platform
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Single-platform manifest: a config blob plus ordered layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformManifest {
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Either form of manifest a registry may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Platform(PlatformManifest),
    List(Vec<PlatformEntry>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    schema_version: Option<u32>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<Vec<PlatformEntry>>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Option<Vec<Descriptor>>,
}

impl Manifest {
    /// Classify and parse a manifest document.
    ///
    /// The `Content-Type` header is preferred; the document's own `mediaType`
    /// and shape decide when it is missing or generic.
    pub fn parse(bytes: &[u8], content_type: Option<&str>) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(bytes)
            .map_err(|e| BoxError::SerializationError(format!("Invalid manifest: {}", e)))?;

        let media_type = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
            .filter(|ct| ct.starts_with("application/vnd."))
            .or(raw.media_type);

        let is_list = match media_type.as_deref() {
            Some(MEDIA_TYPE_DOCKER_MANIFEST_LIST) | Some(MEDIA_TYPE_OCI_INDEX) => true,
            Some(_) => false,
            None => raw.manifests.is_some(),
        };

        if is_list {
            return Ok(Self::List(raw.manifests.unwrap_or_default()));
        }

        if raw.schema_version == Some(1) || media_type.as_deref() == Some(MEDIA_TYPE_DOCKER_MANIFEST_V1) {
            return Err(BoxError::SerializationError(
                "schema 1 manifests carry no image config and are not supported".to_string(),
            ));
        }

        let config = raw.config.ok_or_else(|| {
            BoxError::SerializationError("Manifest has no config descriptor".to_string())
        })?;
        Ok(Self::Platform(PlatformManifest {
            config,
            layers: raw.layers.unwrap_or_default(),
        }))
    }
}

/// Runtime settings carried in the image config blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default, deserialize_with = "string_list")]
    pub env: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub entrypoint: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub cmd: Vec<String>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub working_dir: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub user: String,
}

#[derive(Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: Option<ImageConfig>,
}

impl ImageConfig {
    /// Extract the runtime section from a config blob (`{"config": {...}}`).
    pub fn from_blob(bytes: &[u8]) -> Result<Self> {
        let blob: ConfigBlob = serde_json::from_slice(bytes)
            .map_err(|e| BoxError::SerializationError(format!("Invalid image config: {}", e)))?;
        Ok(blob.config.unwrap_or_default())
    }

    /// Working directory, `/` when unset.
    pub fn working_dir(&self) -> &str {
        if self.working_dir.is_empty() {
            "/"
        } else {
            &self.working_dir
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<Option<String>>),
}

fn string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(items)) => items.into_iter().flatten().collect(),
    })
}

fn nullable_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
