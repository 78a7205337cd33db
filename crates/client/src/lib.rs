//! Remote artifact sources.
//!
//! On a cache miss the store downloads artifact bytes through an
//! [`ArtifactSource`]: the HTTP artifact service in production, or a mounted
//! archive directory.

pub mod error;
pub mod http;
pub mod source;

pub use error::{ClientError, ClientResult};
pub use http::HttpArtifactClient;
pub use source::{ArtifactSource, DirectorySource};

use calstore_core::RemoteConfig;
use std::sync::Arc;

/// Build the artifact source described by the remote configuration, if any.
pub fn from_config(config: &RemoteConfig) -> ClientResult<Option<Arc<dyn ArtifactSource>>> {
    match config.artifact_base_url.as_deref() {
        None => Ok(None),
        Some(url) if url.starts_with("file://") => {
            let root = url.trim_start_matches("file://");
            Ok(Some(Arc::new(DirectorySource::new(root)) as Arc<dyn ArtifactSource>))
        }
        Some(url) => {
            let client = HttpArtifactClient::new(url, config.timeout())?;
            Ok(Some(Arc::new(client) as Arc<dyn ArtifactSource>))
        }
    }
}
