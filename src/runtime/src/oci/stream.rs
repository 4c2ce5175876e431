//! Lazily-read layer blobs.
//!
//! A [`LayerStream`] yields the raw (possibly compressed) bytes of one layer,
//! whether they come from an HTTP response body or a span of a local archive.
//! When the expected digest is known it is verified once the stream is drained.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use firebox_core::error::{BoxError, Result};

const READ_CHUNK: usize = 64 * 1024;

enum Source {
    Http(reqwest::Response),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

/// Byte stream of a single layer blob.
pub struct LayerStream {
    label: String,
    source: Source,
    expected_digest: Option<String>,
    hasher: Sha256,
    bytes_read: u64,
    done: bool,
}

impl LayerStream {
    /// Wrap an HTTP response body.
    pub fn from_response(
        label: impl Into<String>,
        response: reqwest::Response,
        expected_digest: Option<String>,
    ) -> Self {
        Self::new(label.into(), Source::Http(response), expected_digest)
    }

    /// Wrap any async reader, e.g. a length-limited archive member.
    pub fn from_reader<R>(label: impl Into<String>, reader: R, expected_digest: Option<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::new(label.into(), Source::Reader(Box::new(reader)), expected_digest)
    }

    fn new(label: String, source: Source, expected_digest: Option<String>) -> Self {
        // Only sha256 can be checked locally.
        let expected_digest = expected_digest.filter(|d| d.starts_with("sha256:"));
        Self {
            label,
            source,
            expected_digest,
            hasher: Sha256::new(),
            bytes_read: 0,
            done: false,
        }
    }

    /// Human-readable origin, used in logs and errors.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bytes yielded so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Next chunk of the blob, or `None` at the end.
    ///
    /// # Errors
    ///
    /// Returns `FetchError` on transport failure or when the drained content
    /// does not hash to the expected digest.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let chunk = match &mut self.source {
            Source::Http(response) => response
                .chunk()
                .await
                .map_err(|e| BoxError::FetchError {
                    url: self.label.clone(),
                    message: e.to_string(),
                })?
                .map(|bytes| bytes.to_vec()),
            Source::Reader(reader) => {
                let mut buf = vec![0u8; READ_CHUNK];
                let n = reader.read(&mut buf).await.map_err(|e| BoxError::FetchError {
                    url: self.label.clone(),
                    message: e.to_string(),
                })?;
                if n == 0 {
                    None
                } else {
                    buf.truncate(n);
                    Some(buf)
                }
            }
        };

        match chunk {
            Some(chunk) => {
                self.hasher.update(&chunk);
                self.bytes_read += chunk.len() as u64;
                Ok(Some(chunk))
            }
            None => {
                self.done = true;
                self.verify()?;
                Ok(None)
            }
        }
    }

    /// Drain the whole blob into memory. Meant for small blobs like configs.
    pub async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    fn verify(&mut self) -> Result<()> {
        let Some(expected) = self.expected_digest.as_deref() else {
            return Ok(());
        };
        let actual = format!(
            "sha256:{}",
            hex::encode(std::mem::take(&mut self.hasher).finalize())
        );
        if actual != expected {
            return Err(BoxError::FetchError {
                url: self.label.clone(),
                message: format!("digest mismatch: expected {}, got {}", expected, actual),
            });
        }
        tracing::debug!(blob = %self.label, bytes = self.bytes_read, "Blob digest verified");
        Ok(())
    }
}

/// Digest of `data` in `sha256:<hex>` form.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_reader_stream_yields_all_bytes() {
        let data = vec![7u8; READ_CHUNK * 2 + 10];
        let stream = LayerStream::from_reader("mem", Cursor::new(data.clone()), None);
        assert_eq!(stream.read_all().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_matching_digest_passes() {
        let data = b"layer bytes".to_vec();
        let digest = sha256_digest(&data);
        let stream = LayerStream::from_reader("mem", Cursor::new(data.clone()), Some(digest));
        assert_eq!(stream.read_all().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_digest_mismatch_is_fetch_error() {
        let stream = LayerStream::from_reader(
            "mem",
            Cursor::new(b"tampered".to_vec()),
            Some(sha256_digest(b"original")),
        );
        let err = stream.read_all().await.unwrap_err();
        assert!(matches!(err, BoxError::FetchError { .. }));
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[tokio::test]
    async fn test_unknown_algorithm_is_not_checked() {
        let stream = LayerStream::from_reader(
            "mem",
            Cursor::new(b"data".to_vec()),
            Some("sha512:0000".to_string()),
        );
        assert!(stream.read_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_next_chunk_after_end_is_none() {
        let mut stream = LayerStream::from_reader("mem", Cursor::new(b"x".to_vec()), None);
        assert!(stream.next_chunk().await.unwrap().is_some());
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert_eq!(stream.bytes_read(), 1);
    }
}
