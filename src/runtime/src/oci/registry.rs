//! Registry client speaking the Docker registry v2 HTTP protocol.
//!
//! Anonymous pull tokens come from the hub's token service. Manifest lists
//! are resolved to the linux/amd64 manifest, and blobs are streamed.

use async_trait::async_trait;
use serde::Deserialize;

use firebox_core::error::{BoxError, Result};

use super::manifest::{
    Descriptor, Manifest, PlatformManifest, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_DOCKER_MANIFEST_V1, MEDIA_TYPE_DOCKER_MANIFEST_V2, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};
use super::reference::ImageReference;
use super::stream::LayerStream;

/// Token service used for every registry.
pub const AUTH_ENDPOINT: &str = "https://auth.docker.io/token";
pub const AUTH_SERVICE: &str = "registry.docker.io";

/// Manifest lists may point at further lists; stop after this many hops.
pub const MAX_MANIFEST_DEPTH: usize = 4;

const MANIFEST_ACCEPT: [&str; 5] = [
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_DOCKER_MANIFEST_V1,
    MEDIA_TYPE_DOCKER_MANIFEST_V2,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
];

/// Pull-scoped bearer token.
#[derive(Clone)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    fn header_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Raw manifest document as served.
#[derive(Debug, Clone)]
pub struct RawManifestResponse {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub digest: Option<String>,
}

/// Source of manifest documents by tag or digest.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch_raw_manifest(&self, reference: &str) -> Result<RawManifestResponse>;
}

/// Manifest chosen for the target platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedManifest {
    pub manifest: PlatformManifest,
    /// Digest of the platform manifest, when the registry reported it
    pub digest: Option<String>,
}

/// Follow manifest lists until a linux/amd64 platform manifest is found.
///
/// # Errors
///
/// `NoMatchingPlatform` when a list has no linux/amd64 entry, `FetchError`
/// when lists nest deeper than [`MAX_MANIFEST_DEPTH`].
pub async fn resolve_manifest<F>(
    fetcher: &F,
    display_reference: &str,
    reference: &str,
) -> Result<ResolvedManifest>
where
    F: ManifestFetcher + ?Sized,
{
    let mut current = reference.to_string();

    for depth in 0..MAX_MANIFEST_DEPTH {
        let raw = fetcher.fetch_raw_manifest(&current).await?;
        match Manifest::parse(&raw.body, raw.content_type.as_deref())? {
            Manifest::Platform(manifest) => {
                let digest = raw.digest.or_else(|| {
                    current
                        .starts_with("sha256:")
                        .then(|| current.clone())
                });
                return Ok(ResolvedManifest { manifest, digest });
            }
            Manifest::List(entries) => {
                let Some(entry) = entries.iter().find(|e| e.matches_target()) else {
                    let available: Vec<String> =
                        entries.iter().map(|e| e.platform_label()).collect();
                    return Err(BoxError::NoMatchingPlatform {
                        reference: display_reference.to_string(),
                        available: if available.is_empty() {
                            "none".to_string()
                        } else {
                            available.join(", ")
                        },
                    });
                };
                tracing::debug!(
                    reference = %display_reference,
                    depth,
                    digest = %entry.digest,
                    "Selected linux/amd64 entry from manifest list"
                );
                current = entry.digest.clone();
            }
        }
    }

    Err(BoxError::FetchError {
        url: display_reference.to_string(),
        message: format!("manifest lists nested deeper than {}", MAX_MANIFEST_DEPTH),
    })
}

/// HTTP client bound to one registry.
pub struct RegistryClient {
    http: reqwest::Client,
    registry: String,
    base_url: String,
    auth_url: String,
}

impl RegistryClient {
    /// Client for the registry named by `reference`.
    ///
    /// Certificate verification is disabled for anything but the public hub.
    pub fn for_reference(reference: &ImageReference) -> Result<Self> {
        let verify_tls = reference.is_default_registry();
        Self::with_endpoints(
            &reference.registry,
            format!("https://{}", reference.api_host()),
            AUTH_ENDPOINT.to_string(),
            verify_tls,
        )
    }

    /// Client with explicit API and token endpoints.
    pub fn with_endpoints(
        registry: &str,
        base_url: String,
        auth_url: String,
        verify_tls: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("firebox/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| BoxError::Other(format!("Failed to build HTTP client: {}", e)))?;

        if !verify_tls {
            tracing::warn!(registry, "TLS certificate verification disabled");
        }

        Ok(Self {
            http,
            registry: registry.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_url,
        })
    }

    /// Obtain an anonymous pull token for `image` ("library/nginx").
    pub async fn authenticate(&self, image: &str) -> Result<BearerToken> {
        let scope = format!("repository:{}:pull", image);
        let auth_error = |message: String| BoxError::AuthError {
            registry: self.registry.clone(),
            message,
        };

        let response = self
            .http
            .get(&self.auth_url)
            .query(&[("service", AUTH_SERVICE), ("scope", scope.as_str())])
            .send()
            .await
            .map_err(|e| auth_error(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(auth_error(format!("token service returned {}", status)));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_error(format!("invalid token response: {}", e)))?;

        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .map(BearerToken::new)
            .ok_or_else(|| auth_error("token response carried no token".to_string()))
    }

    /// Fetch and resolve the manifest for `reference` (tag or digest).
    pub async fn fetch_manifest(
        &self,
        token: &BearerToken,
        image: &str,
        reference: &str,
    ) -> Result<ResolvedManifest> {
        let fetcher = AuthorizedManifests {
            client: self,
            token,
            image,
        };
        let display = format!("{}/{}:{}", self.registry, image, reference);
        resolve_manifest(&fetcher, &display, reference).await
    }

    /// Open a blob for streaming. Redirects to storage backends are followed.
    pub async fn fetch_blob(
        &self,
        token: &BearerToken,
        image: &str,
        descriptor: &Descriptor,
    ) -> Result<LayerStream> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, image, descriptor.digest);
        let response = self.send(token, &url, None).await?;

        tracing::debug!(
            digest = %descriptor.digest,
            size = descriptor.size,
            "Streaming blob"
        );
        Ok(LayerStream::from_response(
            url,
            response,
            Some(descriptor.digest.clone()),
        ))
    }

    async fn send(
        &self,
        token: &BearerToken,
        url: &str,
        accept: Option<String>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, token.header_value());
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        let response = request.send().await.map_err(|e| BoxError::FetchError {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BoxError::AuthError {
                registry: self.registry.clone(),
                message: format!("registry rejected token for {}", url),
            });
        }
        if !status.is_success() {
            return Err(BoxError::FetchError {
                url: url.to_string(),
                message: format!("HTTP {}", status),
            });
        }
        Ok(response)
    }
}

struct AuthorizedManifests<'a> {
    client: &'a RegistryClient,
    token: &'a BearerToken,
    image: &'a str,
}

#[async_trait]
impl ManifestFetcher for AuthorizedManifests<'_> {
    async fn fetch_raw_manifest(&self, reference: &str) -> Result<RawManifestResponse> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.client.base_url, self.image, reference
        );
        let response = self
            .client
            .send(self.token, &url, Some(MANIFEST_ACCEPT.join(", ")))
            .await?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        let content_type = header("content-type");
        let digest = header("docker-content-digest");

        let body = response.bytes().await.map_err(|e| BoxError::FetchError {
            url: url.clone(),
            message: e.to_string(),
        })?;

        Ok(RawManifestResponse {
            body: body.to_vec(),
            content_type,
            digest,
        })
    }
}
