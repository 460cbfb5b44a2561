//! Persistent provisioning cache.
//!
//! The cache maps a [`RequestKey`] to the [`ResourceHandle`] of a node that
//! is believed to be live, so repeated test sessions reuse nodes instead of
//! provisioning new ones. Nothing here verifies that a cached node still
//! exists; a node deleted out of band surfaces when a later command fails.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::request::RequestKey;
use crate::resource::ResourceHandle;

/// Default cache location, relative to the working directory.
pub const DEFAULT_CACHE_PATH: &str = ".nodekeeper_cache/nodes.json";

const LOCK_DIR_NAME: &str = "locks";

/// Errors raised while reading or updating the cache.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CacheError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the cache file cannot be parsed or rendered.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the configured path is unusable.
    #[error("invalid cache path {path}: {message}")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Exclusive hold on one request key across processes.
///
/// Dropping the guard releases the lock.
#[derive(Debug)]
pub struct KeyLock {
    _file: Option<File>,
}

impl KeyLock {
    /// Guard that holds no operating system lock.
    #[must_use]
    pub const fn in_process() -> Self {
        Self { _file: None }
    }
}

/// Key → handle store shared by every session on the control host.
pub trait ProvisionCache: Send + Sync {
    /// Returns the handle stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the backing store cannot be read.
    fn lookup(&self, key: &RequestKey) -> Result<Option<ResourceHandle>, CacheError>;

    /// Stores `handle` under `key`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the backing store cannot be updated.
    fn store(&self, key: &RequestKey, handle: &ResourceHandle) -> Result<(), CacheError>;

    /// Removes the entry for `key`; removing an absent entry succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the backing store cannot be updated.
    fn clear(&self, key: &RequestKey) -> Result<(), CacheError>;

    /// Returns every entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the backing store cannot be read.
    fn entries(&self) -> Result<BTreeMap<RequestKey, ResourceHandle>, CacheError>;

    /// Attempts to take the provisioning lock for `key` without blocking.
    ///
    /// Returns `Ok(None)` while another process holds it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the lock file cannot be opened.
    fn try_lock_key(&self, key: &RequestKey) -> Result<Option<KeyLock>, CacheError>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CacheDocument {
    #[serde(default)]
    entries: BTreeMap<RequestKey, ResourceHandle>,
}

/// Cache persisted as a JSON document on local disk.
///
/// Every mutation is a read-modify-write under an exclusive lock on a
/// sibling `.lock` file, and the new document replaces the old one with an
/// atomic rename, so readers never observe a partially written file.
#[derive(Clone, Debug)]
pub struct FileCache {
    path: Utf8PathBuf,
    parent: Utf8PathBuf,
    file_name: String,
}

impl FileCache {
    /// Creates a cache backed by `path`; the file is created on first write.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidPath`] when `path` has no file name.
    pub fn new(cache_path: impl Into<Utf8PathBuf>) -> Result<Self, CacheError> {
        let path = cache_path.into();
        let file_name = path
            .file_name()
            .ok_or_else(|| CacheError::InvalidPath {
                path: path.clone(),
                message: String::from("cache path is missing a file name"),
            })?
            .to_owned();
        let parent = match path.parent() {
            Some(dir) if !dir.as_str().is_empty() => dir.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        Ok(Self {
            path,
            parent,
            file_name,
        })
    }

    /// Returns the cache file path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn io_error(path: &Utf8Path, err: &io::Error) -> CacheError {
        CacheError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    fn open_dir(&self) -> Result<Dir, CacheError> {
        Dir::create_ambient_dir_all(&self.parent, ambient_authority())
            .map_err(|err| Self::io_error(&self.parent, &err))?;
        Dir::open_ambient_dir(&self.parent, ambient_authority())
            .map_err(|err| Self::io_error(&self.parent, &err))
    }

    fn open_lock_file(dir: &Dir, name: &str, display: &Utf8Path) -> Result<File, CacheError> {
        let mut options = OpenOptions::new();
        options.create(true).read(true).write(true).truncate(false);
        dir.open_with(name, &options)
            .map(cap_std::fs_utf8::File::into_std)
            .map_err(|err| Self::io_error(display, &err))
    }

    fn with_document_lock<T>(
        &self,
        action: impl FnOnce(&Dir) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let dir = self.open_dir()?;
        let lock_name = format!("{}.lock", self.file_name);
        let lock_path = self.parent.join(&lock_name);
        let lock = Self::open_lock_file(&dir, &lock_name, &lock_path)?;
        FileExt::lock_exclusive(&lock).map_err(|err| Self::io_error(&lock_path, &err))?;
        // Released when `lock` is dropped.
        action(&dir)
    }

    fn read_document(&self, dir: &Dir) -> Result<CacheDocument, CacheError> {
        let contents = match dir.read_to_string(&self.file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(CacheDocument::default());
            }
            Err(err) => return Err(Self::io_error(&self.path, &err)),
        };
        if contents.trim().is_empty() {
            return Ok(CacheDocument::default());
        }
        serde_json::from_str(&contents).map_err(|err| CacheError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    fn write_document(&self, dir: &Dir, document: &CacheDocument) -> Result<(), CacheError> {
        let rendered =
            serde_json::to_string_pretty(document).map_err(|err| CacheError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        let tmp_name = format!(".{}.{}.tmp", self.file_name, Uuid::new_v4().simple());
        dir.write(&tmp_name, rendered)
            .map_err(|err| Self::io_error(&self.parent.join(&tmp_name), &err))?;
        dir.rename(&tmp_name, dir, &self.file_name)
            .map_err(|err| Self::io_error(&self.path, &err))
    }

    fn update(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<RequestKey, ResourceHandle>),
    ) -> Result<(), CacheError> {
        self.with_document_lock(|dir| {
            let mut document = self.read_document(dir)?;
            mutate(&mut document.entries);
            self.write_document(dir, &document)
        })
    }
}

impl ProvisionCache for FileCache {
    fn lookup(&self, key: &RequestKey) -> Result<Option<ResourceHandle>, CacheError> {
        self.with_document_lock(|dir| {
            let mut document = self.read_document(dir)?;
            Ok(document.entries.remove(key))
        })
    }

    fn store(&self, key: &RequestKey, handle: &ResourceHandle) -> Result<(), CacheError> {
        self.update(|entries| {
            entries.insert(key.clone(), handle.clone());
        })
    }

    fn clear(&self, key: &RequestKey) -> Result<(), CacheError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }

    fn entries(&self) -> Result<BTreeMap<RequestKey, ResourceHandle>, CacheError> {
        self.with_document_lock(|dir| Ok(self.read_document(dir)?.entries))
    }

    fn try_lock_key(&self, key: &RequestKey) -> Result<Option<KeyLock>, CacheError> {
        let dir = self.open_dir()?;
        dir.create_dir_all(LOCK_DIR_NAME)
            .map_err(|err| Self::io_error(&self.parent.join(LOCK_DIR_NAME), &err))?;
        let lock_name = format!("{LOCK_DIR_NAME}/{}.lock", key.file_stem());
        let lock_path = self.parent.join(&lock_name);
        let file = Self::open_lock_file(&dir, &lock_name, &lock_path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(KeyLock { _file: Some(file) })),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(Self::io_error(&lock_path, &err)),
        }
    }
}

/// Process-local cache used when persistence is not wanted.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<BTreeMap<RequestKey, ResourceHandle>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, BTreeMap<RequestKey, ResourceHandle>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProvisionCache for MemoryCache {
    fn lookup(&self, key: &RequestKey) -> Result<Option<ResourceHandle>, CacheError> {
        Ok(self.guard().get(key).cloned())
    }

    fn store(&self, key: &RequestKey, handle: &ResourceHandle) -> Result<(), CacheError> {
        self.guard().insert(key.clone(), handle.clone());
        Ok(())
    }

    fn clear(&self, key: &RequestKey) -> Result<(), CacheError> {
        self.guard().remove(key);
        Ok(())
    }

    fn entries(&self) -> Result<BTreeMap<RequestKey, ResourceHandle>, CacheError> {
        Ok(self.guard().clone())
    }

    fn try_lock_key(&self, _key: &RequestKey) -> Result<Option<KeyLock>, CacheError> {
        Ok(Some(KeyLock::in_process()))
    }
}

impl<C: ProvisionCache + ?Sized> ProvisionCache for std::sync::Arc<C> {
    fn lookup(&self, key: &RequestKey) -> Result<Option<ResourceHandle>, CacheError> {
        (**self).lookup(key)
    }

    fn store(&self, key: &RequestKey, handle: &ResourceHandle) -> Result<(), CacheError> {
        (**self).store(key, handle)
    }

    fn clear(&self, key: &RequestKey) -> Result<(), CacheError> {
        (**self).clear(key)
    }

    fn entries(&self) -> Result<BTreeMap<RequestKey, ResourceHandle>, CacheError> {
        (**self).entries()
    }

    fn try_lock_key(&self, key: &RequestKey) -> Result<Option<KeyLock>, CacheError> {
        (**self).try_lock_key(key)
    }
}
