//! Registry-backed image source.

use async_trait::async_trait;

use firebox_core::error::{BoxError, Result};

use super::manifest::{Descriptor, ImageConfig};
use super::reference::ImageReference;
use super::registry::{BearerToken, RegistryClient};
use super::source::{ImageSource, LayerDescriptor};
use super::stream::LayerStream;

/// Image resolved against a registry; layers are fetched on demand.
pub struct RegistryImage {
    reference: ImageReference,
    client: RegistryClient,
    token: BearerToken,
    manifest_digest: Option<String>,
    config: ImageConfig,
    blobs: Vec<Descriptor>,
    layers: Vec<LayerDescriptor>,
}

impl RegistryImage {
    /// Authenticate, resolve the linux/amd64 manifest and fetch the image config.
    pub async fn pull(reference: &ImageReference) -> Result<Self> {
        Self::pull_with(RegistryClient::for_reference(reference)?, reference).await
    }

    /// [`RegistryImage::pull`] through an explicitly configured client.
    pub async fn pull_with(client: RegistryClient, reference: &ImageReference) -> Result<Self> {
        let image = reference.repository.as_str();

        tracing::info!(reference = %reference, "Resolving image");
        let token = client.authenticate(image).await?;
        let resolved = client
            .fetch_manifest(&token, image, reference.manifest_reference())
            .await?;

        let config_blob = client
            .fetch_blob(&token, image, &resolved.manifest.config)
            .await?
            .read_all()
            .await?;
        let config = ImageConfig::from_blob(&config_blob)?;

        let mut blobs = Vec::with_capacity(resolved.manifest.layers.len());
        for layer in resolved.manifest.layers {
            if layer.is_foreign() {
                tracing::warn!(digest = %layer.digest, "Skipping foreign layer");
                continue;
            }
            blobs.push(layer);
        }
        let layers = blobs
            .iter()
            .map(|d| LayerDescriptor {
                id: d.digest.clone(),
                digest: Some(d.digest.clone()),
                size: Some(d.size),
            })
            .collect();

        tracing::info!(
            reference = %reference,
            layers = blobs.len(),
            digest = resolved.digest.as_deref().unwrap_or("unknown"),
            "Image resolved"
        );

        Ok(Self {
            reference: reference.clone(),
            client,
            token,
            manifest_digest: resolved.digest,
            config,
            blobs,
            layers,
        })
    }
}

#[async_trait]
impl ImageSource for RegistryImage {
    fn reference(&self) -> String {
        self.reference.full_reference()
    }

    fn artifact_name(&self) -> String {
        self.reference.artifact_name()
    }

    fn manifest_digest(&self) -> Option<String> {
        self.manifest_digest.clone()
    }

    fn config(&self) -> &ImageConfig {
        &self.config
    }

    fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    async fn open_layer(&mut self, index: usize) -> Result<LayerStream> {
        let blob = self.blobs.get(index).ok_or_else(|| {
            BoxError::Other(format!(
                "Layer index {} out of range ({} layers)",
                index,
                self.blobs.len()
            ))
        })?;
        self.client
            .fetch_blob(&self.token, &self.reference.repository, blob)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Artifact, ArtifactBuilder};
    use crate::init::REQUIRED_TOOLS;
    use crate::oci::stream::sha256_digest;
    use crate::testing::{FakeExt4Tools, MemoryImage, TarballExtractor};
    use firebox_core::config::BuildConfig;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Route {
        path: String,
        content_type: &'static str,
        body: Vec<u8>,
    }

    fn route(path: impl Into<String>, content_type: &'static str, body: Vec<u8>) -> Route {
        Route {
            path: path.into(),
            content_type,
            body,
        }
    }

    /// Minimal HTTP/1.1 responder; matches on the request path without query.
    async fn serve(routes: Vec<Route>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request);
                let target = request.split_whitespace().nth(1).unwrap_or("/");
                let path = target.split('?').next().unwrap_or(target);

                let response = match routes.iter().find(|r| r.path == path) {
                    Some(r) => {
                        let mut head = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            r.content_type,
                            r.body.len()
                        )
                        .into_bytes();
                        head.extend_from_slice(&r.body);
                        head
                    }
                    None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_vec(),
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            }
        });
        base
    }

    fn token_route() -> Route {
        route("/token", "application/json", br#"{"token":"t0k3n"}"#.to_vec())
    }

    fn client(base: &str) -> RegistryClient {
        RegistryClient::with_endpoints("docker.io", base.to_string(), format!("{}/token", base), true)
            .unwrap()
    }

    fn builder(out: &TempDir, cache: &TempDir, base: &str) -> ArtifactBuilder {
        ArtifactBuilder::with_tools(
            BuildConfig {
                output_dir: out.path().to_path_buf(),
                cache_dir: cache.path().to_path_buf(),
                busybox_url: format!("{}/busybox", base),
                ..Default::default()
            },
            Arc::new(TarballExtractor),
            Arc::new(FakeExt4Tools::new(256)),
        )
    }

    async fn pull_and_build(
        base: &str,
        reference: &str,
        builder: &ArtifactBuilder,
    ) -> Result<Artifact> {
        let reference = ImageReference::parse(reference)?;
        let mut image = RegistryImage::pull_with(client(base), &reference).await?;
        builder.build(&mut image).await
    }

    #[tokio::test]
    async fn test_arm64_only_list_yields_no_artifact() {
        let list = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [{
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": "sha256:aaaa",
                "size": 100,
                "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}
            }]
        });
        let base = serve(vec![
            token_route(),
            route(
                "/v2/library/hello/manifests/latest",
                "application/vnd.docker.distribution.manifest.list.v2+json",
                serde_json::to_vec(&list).unwrap(),
            ),
        ])
        .await;
        let out = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();

        let err = match pull_and_build(&base, "hello", &builder(&out, &cache, &base)).await {
            Err(e) => e,
            Ok(artifact) => panic!("unexpected artifact at {}", artifact.dir.display()),
        };

        match err {
            BoxError::NoMatchingPlatform { available, .. } => {
                assert_eq!(available, "linux/arm64/v8");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_pull_and_build_through_registry() {
        let tools: Vec<String> = REQUIRED_TOOLS.iter().map(|t| format!("bin/{}", t)).collect();
        let mut entries: Vec<(&str, Option<&[u8]>, u32)> = tools
            .iter()
            .map(|t| (t.as_str(), Some(b"#!/bin/sh\n".as_slice()), 0o755))
            .collect();
        entries.push(("app/server", Some(b"binary".as_slice()), 0o755));
        let layer = MemoryImage::layer_with_modes(&entries);
        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "config": {"Env": ["PORT=8080"], "Cmd": ["/app/server"], "WorkingDir": "/app"}
        }))
        .unwrap();
        let layer_digest = sha256_digest(&layer);
        let config_digest = sha256_digest(&config);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "digest": config_digest, "size": config.len()},
            "layers": [{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": layer_digest, "size": layer.len()}]
        });

        let base = serve(vec![
            token_route(),
            route(
                "/v2/acme/server/manifests/1.0",
                "application/vnd.docker.distribution.manifest.v2+json",
                serde_json::to_vec(&manifest).unwrap(),
            ),
            route(
                format!("/v2/acme/server/blobs/{}", config_digest),
                "application/octet-stream",
                config,
            ),
            route(
                format!("/v2/acme/server/blobs/{}", layer_digest),
                "application/octet-stream",
                layer,
            ),
        ])
        .await;

        let reference = ImageReference::parse("acme/server:1.0").unwrap();
        let image = RegistryImage::pull_with(client(&base), &reference)
            .await
            .unwrap();
        assert_eq!(image.config().cmd, vec!["/app/server"]);
        assert_eq!(image.layers().len(), 1);

        let out = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let artifact = pull_and_build(&base, "acme/server:1.0", &builder(&out, &cache, &base))
            .await
            .unwrap();

        assert_eq!(artifact.metadata.name, "acme_server_1.0");
        assert_eq!(artifact.metadata.reference, "docker.io/acme/server:1.0");
        assert!(artifact.rootfs.is_file());
    }

    #[tokio::test]
    async fn test_corrupted_blob_fails_digest_check() {
        let config = br#"{"config":{}}"#.to_vec();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {"digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000", "size": config.len()},
            "layers": []
        });
        let base = serve(vec![
            token_route(),
            route(
                "/v2/acme/bad/manifests/latest",
                "application/vnd.oci.image.manifest.v1+json",
                serde_json::to_vec(&manifest).unwrap(),
            ),
            route(
                "/v2/acme/bad/blobs/sha256:0000000000000000000000000000000000000000000000000000000000000000",
                "application/octet-stream",
                config,
            ),
        ])
        .await;

        let reference = ImageReference::parse("acme/bad").unwrap();
        let err = match RegistryImage::pull_with(client(&base), &reference).await {
            Err(e) => e,
            Ok(_) => panic!("pull unexpectedly succeeded"),
        };
        assert!(err.to_string().contains("digest mismatch"));
    }
}
