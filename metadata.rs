use crate::error::PageIoError;
use crate::file::CryptMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Persists a file's logical size where it survives a reopen.
pub trait MetadataWriter: Send + Sync {
    fn persist_logical_size(&self, file_id: &str, new_size: u64) -> Result<(), PageIoError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub size: u64,
    pub mode: CryptMode,
    pub page_size: usize,
}

impl FileMetadata {
    /// Sidecar path for `name` under `root`: `<root>/<name>.meta.json`.
    pub fn path_for(root: &Path, name: &str) -> PathBuf {
        root.join(format!("{}.meta.json", name))
    }

    pub fn load(path: &Path) -> Result<Self, PageIoError> {
        let s = fs::read_to_string(path)
            .map_err(|e| PageIoError::storage(format!("reading metadata {}: {}", path.display(), e)))?;
        serde_json::from_str(&s)
            .map_err(|e| PageIoError::storage(format!("parsing metadata {}: {}", path.display(), e)))
    }

    /// Write via a temp file and rename so a crash never leaves half a record.
    pub fn record(&self, path: &Path) -> Result<(), PageIoError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PageIoError::metadata(format!("serializing metadata: {}", e)))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)
            .map_err(|e| PageIoError::metadata(format!("writing {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, path)
            .map_err(|e| PageIoError::metadata(format!("replacing {}: {}", path.display(), e)))?;
        Ok(())
    }
}

/// Keeps `<name>.meta.json` records in one directory, keyed by file id.
#[derive(Debug)]
pub struct JsonMetadataWriter {
    root: PathBuf,
    // serializes read-modify-write of a record
    lock: Mutex<()>,
}

impl JsonMetadataWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    /// Create or replace the whole record for a file.
    pub fn write(&self, meta: &FileMetadata) -> Result<(), PageIoError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        meta.record(&FileMetadata::path_for(&self.root, &meta.filename))
    }

    pub fn read(&self, file_id: &str) -> Result<FileMetadata, PageIoError> {
        FileMetadata::load(&FileMetadata::path_for(&self.root, file_id))
    }
}

impl MetadataWriter for JsonMetadataWriter {
    fn persist_logical_size(&self, file_id: &str, new_size: u64) -> Result<(), PageIoError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = FileMetadata::path_for(&self.root, file_id);
        let mut meta = FileMetadata::load(&path).map_err(|e| PageIoError::metadata(e.to_string()))?;
        // concurrent growers may persist out of order; never move the size back
        if new_size <= meta.size {
            return Ok(());
        }
        meta.size = new_size;
        meta.record(&path)?;
        debug!(file = file_id, size = new_size, "logical size persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(name: &str, size: u64) -> FileMetadata {
        FileMetadata {
            filename: name.to_string(),
            size,
            mode: CryptMode::Encrypted,
            page_size: 4096,
        }
    }

    #[test]
    fn test_persist_updates_size() {
        let tmp = TempDir::new().unwrap();
        let writer = JsonMetadataWriter::new(tmp.path());
        writer.write(&sample("doc.txt", 10)).unwrap();

        writer.persist_logical_size("doc.txt", 5000).unwrap();
        assert_eq!(writer.read("doc.txt").unwrap().size, 5000);

        writer.persist_logical_size("doc.txt", 100).unwrap();
        assert_eq!(writer.read("doc.txt").unwrap().size, 5000);

        let content = fs::read_to_string(tmp.path().join("doc.txt.meta.json")).unwrap();
        assert!(content.contains("\"encrypted\""));
    }

    #[test]
    fn test_persist_without_record_fails() {
        let tmp = TempDir::new().unwrap();
        let writer = JsonMetadataWriter::new(tmp.path());
        let err = writer.persist_logical_size("missing", 1).unwrap_err();
        assert!(matches!(err, PageIoError::MetadataPersist(_)));
    }
}
