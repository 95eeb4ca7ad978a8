//! Lab artifact URIs and content digests.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArtifactUri {
    /// S3: s3://bucket/path/to/lab.yaml
    S3 { bucket: String, key: String },
    /// HTTPS: https://artifacts.example.com/lab.yaml
    Https { url: String },
    /// Local file: file:///path/to/lab.yaml or ./relative/lab.yaml
    File { path: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported artifact scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid artifact URI: {0}")]
    InvalidUri(String),
}

impl ArtifactUri {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .filter(|(b, k)| !b.is_empty() && !k.is_empty())
                .ok_or_else(|| SourceError::InvalidUri(uri.to_string()))?;
            Ok(ArtifactUri::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        } else if uri.starts_with("https://") || uri.starts_with("http://") {
            Ok(ArtifactUri::Https {
                url: uri.to_string(),
            })
        } else if let Some(path) = uri.strip_prefix("file://") {
            Ok(ArtifactUri::File {
                path: path.to_string(),
            })
        } else if uri.starts_with("./") || uri.starts_with('/') {
            Ok(ArtifactUri::File {
                path: uri.to_string(),
            })
        } else {
            Err(SourceError::UnsupportedScheme(uri.to_string()))
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ArtifactUri::S3 { .. } => "s3",
            ArtifactUri::Https { .. } => "https",
            ArtifactUri::File { .. } => "file",
        }
    }
}

/// SHA-256 digest of artifact content, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn of(content: &[u8]) -> Self {
        let hash = Sha256::digest(content);
        Self(format!("sha256:{}", hex::encode(hash)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
