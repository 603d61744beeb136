//! File management on top of the page I/O path.
//!
//! This module provides [`SecurePageOps`], which lays files out in a storage
//! directory and opens them as [`LogicalFile`]s:
//!
//! ```text
//! storage/
//!   report.pdf             page data (ciphertext for encrypted files)
//!   report.pdf.auth        per-page nonce and tag records
//!   report.pdf.meta.json   logical size, mode and page size
//! ```
//!
//! Reads and writes go through one shared [`PageIo`], so every file opened
//! here uses the same key, metadata writer and default dispatch.

use crate::codec::XChaChaPageCodec;
use crate::dispatch::Dispatch;
use crate::error::{IoResult, PageIoError};
use crate::file::{CryptMode, LogicalFile};
use crate::key_manager::KeyManager;
use crate::metadata::{FileMetadata, JsonMetadataWriter};
use crate::page_io::PageIo;
use crate::store::{BackingStore, FileStore};
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const META_SUFFIX: &str = ".meta.json";
const AUTH_SUFFIX: &str = ".auth";

/// One row of [`SecurePageOps::list_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// Physical size of the data file.
    pub stored_bytes: u64,
    /// Logical size and mode, when the metadata record exists.
    pub metadata: Option<FileMetadata>,
}

pub struct SecurePageOps {
    io: PageIo,
    metadata: Arc<JsonMetadataWriter>,
    root: PathBuf,
    page_size: usize,
    cache_pages: usize,
}

impl SecurePageOps {
    pub fn new(km: KeyManager, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let metadata = Arc::new(JsonMetadataWriter::new(root.clone()));
        let codec = Arc::new(XChaChaPageCodec::new(km.cipher()));
        Self {
            io: PageIo::new(codec, metadata.clone()),
            metadata,
            root,
            page_size: crate::config::DEFAULT_PAGE_SIZE,
            cache_pages: crate::config::DEFAULT_CACHE_PAGES,
        }
    }

    /// Build from a loaded [`crate::config::Config`].
    pub fn from_config(km: KeyManager, cfg: &crate::config::Config) -> Self {
        Self::new(km, &cfg.storage_dir)
            .with_page_size(cfg.page_size)
            .with_cache_pages(cfg.cache_pages)
            .with_dispatch(cfg.dispatch)
    }

    /// Page size for files created from now on.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_cache_pages(mut self, cache_pages: usize) -> Self {
        self.cache_pages = cache_pages;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.io = self.io.with_dispatch(dispatch);
        self
    }

    pub fn io(&self) -> &PageIo {
        &self.io
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        FileMetadata::path_for(&self.root, name)
    }

    fn auth_path(&self, name: &str) -> PathBuf {
        FileStore::auth_path(&self.data_path(name))
    }

    /// Create an empty file. Fails if `name` already exists.
    pub fn create(&self, name: &str, mode: CryptMode) -> Result<LogicalFile> {
        if mode == CryptMode::ViewAsEncrypted {
            anyhow::bail!("files are created plain or encrypted; view-as-encrypted is an open mode");
        }
        validate_name(name)?;
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating storage directory {:?}", &self.root))?;
        if self.exists(name) {
            anyhow::bail!("file '{}' already exists", name);
        }

        let meta = FileMetadata {
            filename: name.to_string(),
            size: 0,
            mode,
            page_size: self.page_size,
        };
        self.metadata.write(&meta)?;
        let file = self.attach(&meta, mode)?;
        info!(file = name, mode = ?mode, page_size = self.page_size, "file created");
        Ok(file)
    }

    /// Open an existing file with its recorded mode.
    pub fn open(&self, name: &str) -> Result<LogicalFile> {
        let meta = self.get_metadata(name)?;
        let mode = meta.mode;
        self.attach(&meta, mode)
    }

    /// Open an encrypted file read-only, exposing its raw ciphertext.
    pub fn open_view_as_encrypted(&self, name: &str) -> Result<LogicalFile> {
        let meta = self.get_metadata(name)?;
        let mode = match meta.mode {
            CryptMode::Plain => {
                warn!(file = name, "file is not encrypted; opening plain");
                CryptMode::Plain
            }
            _ => CryptMode::ViewAsEncrypted,
        };
        self.attach(&meta, mode)
    }

    fn attach(&self, meta: &FileMetadata, mode: CryptMode) -> Result<LogicalFile> {
        let store = Arc::new(FileStore::open(self.data_path(&meta.filename), meta.page_size)?);
        let mut size = meta.size;
        if !meta.mode.is_encrypted() {
            // plain files never persist their size; the data file is exact
            size = size.max(store.stored_len()?);
        }
        debug!(file = %meta.filename, size, mode = ?mode, "file attached");
        let file = LogicalFile::with_page_cache(&meta.filename, mode, size, store, self.cache_pages)?;
        Ok(file)
    }

    /// Write `data` at `offset` using the default dispatch.
    pub fn write_at(&self, file: &LogicalFile, offset: u64, data: &[u8]) -> IoResult<usize> {
        self.io.write(file, data, offset, data.len())
    }

    pub fn read_at(&self, file: &LogicalFile, offset: u64, out: &mut [u8]) -> IoResult<usize> {
        let len = out.len();
        self.io.read(file, out, offset, len)
    }

    /// Read the whole logical file, one cache's worth of pages at a time.
    pub fn read_all(&self, file: &LogicalFile) -> IoResult<Vec<u8>> {
        let chunk = (self.cache_pages * file.page_size()).max(file.page_size());
        let mut out = vec![0u8; buffer_len(file.size())?];
        let mut pos = 0usize;
        while pos < out.len() {
            let end = (pos + chunk).min(out.len());
            let n = self.io.read(file, &mut out[pos..end], pos as u64, end - pos)?;
            if n == 0 {
                break;
            }
            pos += n;
        }
        out.truncate(pos);
        Ok(out)
    }

    /// Check if a file exists
    pub fn exists(&self, name: &str) -> bool {
        self.meta_path(name).exists() || self.data_path(name).exists()
    }

    /// Delete a file, its auth records and its metadata
    pub fn delete_file(&self, name: &str) -> Result<()> {
        info!(file = name, "deleting file");
        let path = self.data_path(name);

        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("deleting {:?}", &path))?;
            debug!(file = name, "data file deleted");
        } else {
            warn!(file = name, "file not found during delete");
        }

        for sidecar in [self.auth_path(name), self.meta_path(name)] {
            if sidecar.exists() {
                fs::remove_file(&sidecar).ok(); // Best effort, don't fail if missing
                debug!(file = name, path = ?sidecar, "sidecar deleted");
            }
        }

        info!(file = name, "file deletion complete");
        Ok(())
    }

    /// List all files in storage, sorted by name
    pub fn list_files(&self) -> Result<Vec<FileEntry>> {
        let mut files = Vec::new();

        if !self.root.exists() {
            return Ok(files);
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                continue;
            }

            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if name.ends_with(META_SUFFIX) || name.ends_with(AUTH_SUFFIX) || name.ends_with(".tmp") {
                continue;
            }

            let stored_bytes = entry.metadata()?.len();
            let metadata = self.get_metadata(&name).ok();
            files.push(FileEntry {
                name,
                stored_bytes,
                metadata,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Read the metadata record for a file
    pub fn get_metadata(&self, name: &str) -> Result<FileMetadata> {
        let meta_path = self.meta_path(name);
        let meta = FileMetadata::load(&meta_path)
            .with_context(|| format!("loading metadata for '{}'", name))?;
        Ok(meta)
    }
}

/// In-memory length for a whole logical file.
fn buffer_len(size: u64) -> Result<usize, PageIoError> {
    usize::try_from(size)
        .map_err(|_| PageIoError::invalid_input(format!("file of {} bytes does not fit in memory", size)))
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
        || name.ends_with(META_SUFFIX)
        || name.ends_with(AUTH_SUFFIX)
    {
        anyhow::bail!("invalid file name '{}'", name);
    }
    Ok(())
}
