//! Artifact source trait and the archive-directory source.

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};

/// Where artifact bytes come from on a cache miss.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fetch the full artifact. Fails with `NotFound` when the source does
    /// not hold it and `Unavailable` when the source cannot be reached.
    async fn fetch_artifact(&self, instrument_name: &str, filename: &str) -> ClientResult<Bytes>;
}

/// Serves artifacts from a mounted archive laid out as
/// `<root>/<instrument_name>/<filename>`.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, instrument_name: &str, filename: &str) -> ClientResult<PathBuf> {
        for part in [instrument_name, filename] {
            let mut components = Path::new(part).components();
            if !matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            ) {
                return Err(ClientError::InvalidUrl(format!("unsafe path segment: {part:?}")));
            }
        }
        Ok(self.root.join(instrument_name).join(filename))
    }
}

#[async_trait]
impl ArtifactSource for DirectorySource {
    async fn fetch_artifact(&self, instrument_name: &str, filename: &str) -> ClientResult<Bytes> {
        let path = self.path(instrument_name, filename)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ClientError::NotFound(format!("{instrument_name}/{filename}")))
            }
            Err(e) => Err(ClientError::Io(e)),
        }
    }
}
