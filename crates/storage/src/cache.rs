//! Filesystem-backed calibration artifact cache.
//!
//! Artifacts live at `<root>/<instrument_name>/<filename>`. The presence of a
//! file is authoritative for "is cached"; whether the calibration exists is
//! the metadata index's business.

use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use calstore_core::ContentHash;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

/// Read buffer size for checksumming (64 KiB).
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Result of a cache lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(PathBuf),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_path(self) -> Option<PathBuf> {
        match self {
            CacheLookup::Hit(path) => Some(path),
            CacheLookup::Miss => None,
        }
    }
}

/// What to do when a different artifact is already cached under a name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WritePolicy {
    /// Fail with `CacheConflict`.
    #[default]
    KeepExisting,
    /// Replace the cached file.
    Overwrite,
}

/// Local calibration artifact cache.
pub struct CalibrationCache {
    root: PathBuf,
    /// Serializes writers of the same target path within this process.
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl CalibrationCache {
    /// Open a cache rooted at `root` (typically `<cache_root>/calibrations`).
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the per-instrument subtree if it does not exist.
    #[instrument(skip(self))]
    pub async fn ensure_layout(&self, instrument_name: &str) -> StorageResult<PathBuf> {
        let dir = self.root.join(validate_component(instrument_name, "instrument")?);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Path an artifact is (or would be) cached at.
    pub fn path_for(&self, instrument_name: &str, filename: &str) -> StorageResult<PathBuf> {
        let instrument = validate_component(instrument_name, "instrument")?;
        let name = validate_component(filename, "filename")?;
        Ok(self.root.join(instrument).join(name))
    }

    /// Look up a cached artifact. Never performs network I/O.
    #[instrument(skip(self))]
    pub async fn resolve(&self, instrument_name: &str, filename: &str) -> StorageResult<CacheLookup> {
        let path = self.path_for(instrument_name, filename)?;
        match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.file_type().is_file() => {
                tracing::debug!(path = %path.display(), "cache hit");
                Ok(CacheLookup::Hit(path))
            }
            Ok(_) => Err(StorageError::InvalidKey(format!(
                "{} is not a regular file",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "cache miss");
                Ok(CacheLookup::Miss)
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Cache `data` under (instrument, filename) and return its path.
    ///
    /// Storing identical bytes again succeeds without rewriting the file.
    /// Different bytes fail with `CacheConflict` unless `policy` is
    /// [`WritePolicy::Overwrite`]. Under `KeepExisting` the file is linked
    /// into place only if the name is still free, so writers in other
    /// processes sharing the directory cannot replace each other.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn store(
        &self,
        instrument_name: &str,
        filename: &str,
        data: Bytes,
        policy: WritePolicy,
    ) -> StorageResult<PathBuf> {
        let path = self.path_for(instrument_name, filename)?;
        let lock = self.lock_for(&path);
        let result = {
            let _guard = lock.lock().await;
            store_locked(&path, &data, policy).await
        };
        drop(lock);
        self.locks.remove_if(&path, |_, m| Arc::strong_count(m) == 1);
        result.map(|()| path)
    }

    /// Read a cached artifact.
    pub async fn read(&self, instrument_name: &str, filename: &str) -> StorageResult<Bytes> {
        let path = self.path_for(instrument_name, filename)?;
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(format!("{instrument_name}/{filename}"))
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    /// SHA-256 of a cached artifact.
    pub async fn checksum(&self, instrument_name: &str, filename: &str) -> StorageResult<ContentHash> {
        let path = self.path_for(instrument_name, filename)?;
        hash_file(&path).await.map_err(|e| match e {
            StorageError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                StorageError::NotFound(format!("{instrument_name}/{filename}"))
            }
            other => other,
        })
    }

    /// Filenames cached for an instrument, sorted. In-flight temp files are skipped.
    pub async fn list(&self, instrument_name: &str) -> StorageResult<Vec<String>> {
        let dir = self.root.join(validate_component(instrument_name, "instrument")?);
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(StorageError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            // file_type() does not follow symlinks.
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.contains(TEMP_MARKER) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

const TEMP_MARKER: &str = ".tmp.";

/// Reject names that could escape the cache root.
fn validate_component<'a>(value: &'a str, what: &str) -> StorageResult<&'a str> {
    if value.is_empty() || value.contains("..") || value.contains('/') || value.contains('\\') {
        return Err(StorageError::InvalidKey(format!("unsafe {what}: {value:?}")));
    }
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(value),
        _ => Err(StorageError::InvalidKey(format!("unsafe {what}: {value:?}"))),
    }
}

async fn store_locked(path: &Path, data: &[u8], policy: WritePolicy) -> StorageResult<()> {
    let digest = ContentHash::compute(data);
    if fs::try_exists(path).await? {
        if hash_file(path).await? == digest {
            tracing::debug!(path = %path.display(), "identical artifact already cached");
            return Ok(());
        }
        if policy == WritePolicy::KeepExisting {
            return Err(StorageError::CacheConflict {
                path: path.to_path_buf(),
            });
        }
        tracing::info!(path = %path.display(), "overwriting cached artifact");
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = write_temp(path, data).await?;
    let placed = match policy {
        WritePolicy::Overwrite => fs::rename(&temp_path, path).await,
        // link(2) fails if the name exists, unlike rename.
        WritePolicy::KeepExisting => fs::hard_link(&temp_path, path).await,
    };
    let _ = fs::remove_file(&temp_path).await;
    match placed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // Another writer got there first.
            if hash_file(path).await? == digest {
                Ok(())
            } else {
                Err(StorageError::CacheConflict {
                    path: path.to_path_buf(),
                })
            }
        }
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Write `data` to a uniquely named, fsynced temp file next to `path`.
async fn write_temp(path: &Path, data: &[u8]) -> StorageResult<PathBuf> {
    let temp_name = format!("{TEMP_MARKER}{}", Uuid::new_v4());
    let temp_path = path.with_file_name(
        path.file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
            .unwrap_or_else(|| temp_name.clone()),
    );
    let written = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::Io(e));
    }
    Ok(temp_path)
}

async fn hash_file(path: &Path) -> StorageResult<ContentHash> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = ContentHash::hasher();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
