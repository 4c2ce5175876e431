use thiserror::Error;

/// Firebox error types
#[derive(Error, Debug)]
pub enum BoxError {
    /// Malformed image reference string
    #[error("Invalid image reference: {0}")]
    ReferenceParseError(String),

    /// Bearer token issuance or acceptance failed
    #[error("Authentication failed for {registry}: {message}")]
    AuthError { registry: String, message: String },

    /// Manifest list carries no linux/amd64 entry
    #[error("No linux/amd64 manifest for {reference} (available: {available})")]
    NoMatchingPlatform {
        reference: String,
        available: String,
    },

    /// Manifest or blob HTTP failure
    #[error("Fetch failed: {url} - {message}")]
    FetchError { url: String, message: String },

    /// Layer extraction or whiteout application failure
    #[error("Extraction failed: {0}")]
    ExtractionError(String),

    /// ext4 image build failure
    #[error("Packaging failed: {0}")]
    PackagingError(String),

    /// Launch preconditions not met
    #[error("Validation failed: {message}")]
    ValidationError {
        message: String,
        hint: Option<String>,
    },

    /// Tap device or NAT rule installation failure
    #[error("Network setup failed: {0}")]
    NetworkSetupError(String),

    /// Hypervisor could not be started
    #[error("Launch failed: {message}")]
    LaunchError {
        message: String,
        hint: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for BoxError {
    fn from(err: serde_json::Error) -> Self {
        BoxError::SerializationError(err.to_string())
    }
}

/// Result type alias for Firebox operations
pub type Result<T> = std::result::Result<T, BoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parse_error_display() {
        let error = BoxError::ReferenceParseError("Empty image reference".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid image reference: Empty image reference"
        );
    }

    #[test]
    fn test_auth_error_display() {
        let error = BoxError::AuthError {
            registry: "docker.io".to_string(),
            message: "token endpoint returned 503".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Authentication failed for docker.io: token endpoint returned 503"
        );
    }

    #[test]
    fn test_no_matching_platform_display() {
        let error = BoxError::NoMatchingPlatform {
            reference: "docker.io/library/hello-world:latest".to_string(),
            available: "linux/arm64".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "No linux/amd64 manifest for docker.io/library/hello-world:latest (available: linux/arm64)"
        );
    }

    #[test]
    fn test_fetch_error_display() {
        let error = BoxError::FetchError {
            url: "https://registry-1.docker.io/v2/library/alpine/blobs/sha256:abc".to_string(),
            message: "404 Not Found".to_string(),
        };
        assert!(error.to_string().starts_with("Fetch failed: https://"));
        assert!(error.to_string().ends_with("404 Not Found"));
    }

    #[test]
    fn test_validation_error_display_ignores_hint() {
        let error = BoxError::ValidationError {
            message: "IPv4 forwarding is disabled".to_string(),
            hint: Some("sysctl -w net.ipv4.ip_forward=1".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "Validation failed: IPv4 forwarding is disabled"
        );
    }

    #[test]
    fn test_launch_error_display() {
        let error = BoxError::LaunchError {
            message: "firecracker not found".to_string(),
            hint: None,
        };
        assert_eq!(error.to_string(), "Launch failed: firecracker not found");
    }

    #[test]
    fn test_packaging_and_extraction_display() {
        assert_eq!(
            BoxError::PackagingError("mkfs.ext4 exited with 1".to_string()).to_string(),
            "Packaging failed: mkfs.ext4 exited with 1"
        );
        assert_eq!(
            BoxError::ExtractionError("tar exited with 2".to_string()).to_string(),
            "Extraction failed: tar exited with 2"
        );
        assert_eq!(
            BoxError::NetworkSetupError("ip tuntap failed".to_string()).to_string(),
            "Network setup failed: ip tuntap failed"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let box_error: BoxError = io_error.into();
        assert!(matches!(box_error, BoxError::IoError(_)));
        assert!(box_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let box_error: BoxError = result.unwrap_err().into();
        assert!(matches!(box_error, BoxError::SerializationError(_)));
    }

    #[test]
    fn test_other_error_display() {
        let error = BoxError::Other("Unknown error occurred".to_string());
        assert_eq!(error.to_string(), "Unknown error occurred");
    }
}
