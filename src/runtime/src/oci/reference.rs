//! Image reference parsing.
//!
//! Turns `nginx`, `bitnami/redis:7.2` or `ghcr.io/org/app@sha256:...` into
//! registry, repository path and tag/digest components.

use firebox_core::error::{BoxError, Result};

/// Registry assumed when the reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Host serving the registry API for [`DEFAULT_REGISTRY`].
pub const DEFAULT_REGISTRY_API_HOST: &str = "registry-1.docker.io";

/// Tag assumed when neither tag nor digest is given.
const DEFAULT_TAG: &str = "latest";

/// Hostnames that all mean the public hub.
const HUB_ALIASES: [&str; 3] = ["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, optionally with port ("docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path; hub images always carry a namespace ("library/nginx")
    pub repository: String,
    /// Tag ("latest", "1.25")
    pub tag: Option<String>,
    /// Digest ("sha256:...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `bitnami/redis:7.2` → docker.io/bitnami/redis:7.2
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:abc` → ghcr.io/org/app@sha256:abc
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BoxError::ReferenceParseError(
                "empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let valid = digest
                    .split_once(':')
                    .map(|(algo, hex)| !algo.is_empty() && !hex.is_empty())
                    .unwrap_or(false);
                if !valid {
                    return Err(BoxError::ReferenceParseError(format!(
                        "'{}': digest must be algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon only introduces a tag when nothing after it is a path
        // separator; otherwise it belongs to a registry port.
        let (name, tag) = match name_tag.rfind(':') {
            Some(pos) if !name_tag[pos + 1..].contains('/') => {
                let tag = &name_tag[pos + 1..];
                if tag.is_empty() {
                    return Err(BoxError::ReferenceParseError(format!(
                        "'{}': empty tag",
                        reference
                    )));
                }
                (&name_tag[..pos], Some(tag.to_string()))
            }
            _ => (name_tag, None),
        };

        if name.is_empty() || name.starts_with('/') || name.ends_with('/') || name.contains("//") {
            return Err(BoxError::ReferenceParseError(format!(
                "'{}': malformed repository name",
                reference
            )));
        }

        let (registry, repository) = split_registry(name);
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Whether this reference targets the public hub.
    pub fn is_default_registry(&self) -> bool {
        HUB_ALIASES.contains(&self.registry.as_str())
    }

    /// Host serving the registry HTTP API.
    pub fn api_host(&self) -> &str {
        if self.is_default_registry() {
            DEFAULT_REGISTRY_API_HOST
        } else {
            &self.registry
        }
    }

    /// Tag or digest used to address the manifest; digest wins.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Filesystem-safe artifact name: repository plus tag, with `/ : @` as `_`.
    pub fn artifact_name(&self) -> String {
        let mut name = self.repository.clone();
        if let Some(ref tag) = self.tag {
            name.push(':');
            name.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            name.push('@');
            name.push_str(digest);
        }
        sanitize_name(&name)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Replace path and reference separators so a name fits in one path component.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | ':' | '@' => '_',
            c => c,
        })
        .collect()
}

/// A first segment names a registry when it looks like a host.
fn split_registry(name: &str) -> (String, String) {
    let (registry, path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };

    let repository = if HUB_ALIASES.contains(&registry.as_str()) && !path.contains('/') {
        format!("library/{}", path)
    } else {
        path
    };
    (registry, repository)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
        assert!(r.is_default_registry());
        assert_eq!(r.api_host(), "registry-1.docker.io");
    }

    #[test]
    fn test_parse_namespaced_with_tag() {
        let r = ImageReference::parse("bitnami/redis:7.2").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "bitnami/redis");
        assert_eq!(r.tag, Some("7.2".to_string()));
    }

    #[test]
    fn test_parse_explicit_hub_gets_library() {
        let r = ImageReference::parse("docker.io/alpine:3.19").unwrap();
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, Some("3.19".to_string()));
    }

    #[test]
    fn test_parse_custom_registry_keeps_path() {
        let r = ImageReference::parse("quay.io/app").unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.repository, "app");
        assert!(!r.is_default_registry());
        assert_eq!(r.api_host(), "quay.io");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/team/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_registry_port_and_tag() {
        let r = ImageReference::parse("myregistry.io:5000/myimage:v1").unwrap();
        assert_eq!(r.registry, "myregistry.io:5000");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse("ghcr.io/org/app@sha256:abcdef0123").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:abcdef0123"));
        assert_eq!(r.manifest_reference(), "sha256:abcdef0123");
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("nginx:1.25@sha256:abc").unwrap();
        assert_eq!(r.tag.as_deref(), Some("1.25"));
        assert_eq!(r.manifest_reference(), "sha256:abc");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "   ", "nginx@invalid", "nginx@sha256:", "nginx:", "/nginx", "a//b"] {
            let err = ImageReference::parse(bad).unwrap_err();
            assert!(
                matches!(err, BoxError::ReferenceParseError(_)),
                "expected parse error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_artifact_name() {
        let r = ImageReference::parse("bitnami/redis:7.2").unwrap();
        assert_eq!(r.artifact_name(), "bitnami_redis_7.2");

        let r = ImageReference::parse("ghcr.io/org/app@sha256:ab").unwrap();
        assert_eq!(r.artifact_name(), "org_app_sha256_ab");
    }

    #[test]
    fn test_display() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(format!("{}", r), "docker.io/library/nginx:1.25");
    }
}
