//! Backing stores holding per-page (plaintext or ciphertext) data.
//!
//! A store is addressed by page index and in-page offset. Encrypted files
//! additionally keep one fixed-size authentication record per page; the
//! [`FileStore`] puts those in an `.auth` sidecar next to the data file so the
//! data file itself stays page-aligned and length-preserving.

use crate::codec::AUTH_RECORD_LEN;
use crate::error::{BatchError, PageIoError};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

pub trait BackingStore: Send + Sync {
    fn page_size(&self) -> usize;

    /// Write `bytes` at `offset` within page `index`.
    /// `offset + bytes.len()` must not exceed the page size.
    fn write_page_segment(&self, index: u64, offset: usize, bytes: &[u8]) -> Result<usize, PageIoError>;

    /// Raw page contents. Shorter than a page at the physical tail, empty past it.
    fn read_raw(&self, index: u64) -> Result<Vec<u8>, PageIoError>;

    /// Write a run of sealed pages starting at `start_index`: `bytes` holds
    /// one whole page per entry of `records`.
    ///
    /// Each page goes out ciphertext first, then its auth record, and the run
    /// stops at the first failure, so pages after the failing one keep their
    /// previous contents. The failing page itself may be torn (new ciphertext
    /// under its old record). Stores that can write a run atomically override
    /// this.
    fn write_sealed_run(
        &self,
        start_index: u64,
        bytes: &[u8],
        records: &[[u8; AUTH_RECORD_LEN]],
    ) -> Result<(), BatchError> {
        let page_size = self.page_size();
        check_run(page_size, bytes, records.len()).map_err(|source| BatchError { completed: 0, source })?;
        for (i, (page, record)) in bytes.chunks(page_size).zip(records).enumerate() {
            let index = start_index + i as u64;
            self.write_page_segment(index, 0, page)
                .and_then(|_| self.write_auth_record(index, record))
                .map_err(|source| BatchError { completed: i, source })?;
        }
        Ok(())
    }

    /// Physical length of the data region in bytes.
    fn stored_len(&self) -> Result<u64, PageIoError>;

    /// Store the authentication record for page `index`.
    fn write_auth_record(&self, index: u64, record: &[u8]) -> Result<(), PageIoError>;

    /// Load the authentication record for page `index` into `record`.
    /// Returns `false` when no record was ever written for that page.
    fn read_auth_record(&self, index: u64, record: &mut [u8]) -> Result<bool, PageIoError>;
}

fn check_segment(page_size: usize, index: u64, offset: usize, len: usize) -> Result<(), PageIoError> {
    if offset.checked_add(len).map_or(true, |end| end > page_size) {
        return Err(PageIoError::invalid_input(format!(
            "segment {}+{} exceeds page {} of size {}",
            offset, len, index, page_size
        )));
    }
    Ok(())
}

fn check_run(page_size: usize, bytes: &[u8], pages: usize) -> Result<(), PageIoError> {
    if pages.checked_mul(page_size) != Some(bytes.len()) {
        return Err(PageIoError::invalid_input(format!(
            "page run of {} bytes does not hold {} pages of {}",
            bytes.len(),
            pages,
            page_size
        )));
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store, useful for embedding and tests.
#[derive(Debug)]
pub struct MemoryStore {
    page_size: usize,
    data: Mutex<Vec<u8>>,
    auth: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            data: Mutex::new(Vec::new()),
            auth: Mutex::new(HashMap::new()),
        }
    }

    /// Copy of the whole data region.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }

    fn write_at(&self, pos: usize, bytes: &[u8]) {
        let mut data = lock(&self.data);
        let end = pos + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[pos..end].copy_from_slice(bytes);
    }
}

impl BackingStore for MemoryStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn write_page_segment(&self, index: u64, offset: usize, bytes: &[u8]) -> Result<usize, PageIoError> {
        check_segment(self.page_size, index, offset, bytes.len())?;
        self.write_at(index as usize * self.page_size + offset, bytes);
        Ok(bytes.len())
    }

    /// Data and records land under both locks, so a run is all or nothing.
    fn write_sealed_run(
        &self,
        start_index: u64,
        bytes: &[u8],
        records: &[[u8; AUTH_RECORD_LEN]],
    ) -> Result<(), BatchError> {
        check_run(self.page_size, bytes, records.len()).map_err(|source| BatchError { completed: 0, source })?;
        let mut auth = lock(&self.auth);
        self.write_at(start_index as usize * self.page_size, bytes);
        for (i, record) in records.iter().enumerate() {
            auth.insert(start_index + i as u64, record.to_vec());
        }
        Ok(())
    }

    fn read_raw(&self, index: u64) -> Result<Vec<u8>, PageIoError> {
        let data = lock(&self.data);
        let start = (index as usize * self.page_size).min(data.len());
        let end = (start + self.page_size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn stored_len(&self) -> Result<u64, PageIoError> {
        Ok(lock(&self.data).len() as u64)
    }

    fn write_auth_record(&self, index: u64, record: &[u8]) -> Result<(), PageIoError> {
        lock(&self.auth).insert(index, record.to_vec());
        Ok(())
    }

    fn read_auth_record(&self, index: u64, record: &mut [u8]) -> Result<bool, PageIoError> {
        match lock(&self.auth).get(&index) {
            Some(stored) if stored.len() == record.len() => {
                record.copy_from_slice(stored);
                Ok(true)
            }
            Some(stored) => Err(PageIoError::storage(format!(
                "auth record for page {} is {} bytes, expected {}",
                index,
                stored.len(),
                record.len()
            ))),
            None => Ok(false),
        }
    }
}

/// Store backed by a data file plus an `.auth` sidecar of fixed-size records.
#[derive(Debug)]
pub struct FileStore {
    page_size: usize,
    data: Mutex<File>,
    auth: Mutex<File>,
}

impl FileStore {
    /// Open (creating if needed) the data file at `path` and its sidecar.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self, PageIoError> {
        let data_path = path.as_ref().to_path_buf();
        let auth_path = Self::auth_path(&data_path);
        debug!(path = %data_path.display(), page_size, "opening file store");

        let open = |p: &Path| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(p)
                .map_err(|e| PageIoError::storage(format!("opening {}: {}", p.display(), e)))
        };

        Ok(Self {
            page_size,
            data: Mutex::new(open(&data_path)?),
            auth: Mutex::new(open(&auth_path)?),
        })
    }

    /// Sidecar path for a data file: `<name>.auth`.
    pub fn auth_path(data_path: &Path) -> PathBuf {
        let mut name = data_path.as_os_str().to_owned();
        name.push(".auth");
        PathBuf::from(name)
    }

    fn write_at(file: &Mutex<File>, pos: u64, bytes: &[u8]) -> Result<(), PageIoError> {
        let mut f = lock(file);
        f.seek(SeekFrom::Start(pos))?;
        f.write_all(bytes)?;
        Ok(())
    }

    /// Fill as much of `buf` as the file holds from `pos`; returns the byte count.
    fn read_at(file: &Mutex<File>, pos: u64, buf: &mut [u8]) -> Result<usize, PageIoError> {
        let mut f = lock(file);
        f.seek(SeekFrom::Start(pos))?;
        let mut filled = 0;
        while filled < buf.len() {
            match f.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

impl BackingStore for FileStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn write_page_segment(&self, index: u64, offset: usize, bytes: &[u8]) -> Result<usize, PageIoError> {
        check_segment(self.page_size, index, offset, bytes.len())?;
        let pos = index * self.page_size as u64 + offset as u64;
        trace!(page = index, offset, len = bytes.len(), "writing page segment");
        Self::write_at(&self.data, pos, bytes)?;
        Ok(bytes.len())
    }

    fn read_raw(&self, index: u64) -> Result<Vec<u8>, PageIoError> {
        let mut page = vec![0u8; self.page_size];
        let n = Self::read_at(&self.data, index * self.page_size as u64, &mut page)?;
        page.truncate(n);
        Ok(page)
    }

    fn stored_len(&self) -> Result<u64, PageIoError> {
        Ok(lock(&self.data).metadata()?.len())
    }

    fn write_auth_record(&self, index: u64, record: &[u8]) -> Result<(), PageIoError> {
        Self::write_at(&self.auth, index * record.len() as u64, record)
    }

    fn read_auth_record(&self, index: u64, record: &mut [u8]) -> Result<bool, PageIoError> {
        let n = Self::read_at(&self.auth, index * record.len() as u64, record)?;
        if n == 0 {
            return Ok(false);
        }
        if n < record.len() {
            return Err(PageIoError::storage(format!(
                "truncated auth record for page {}: {} of {} bytes",
                index,
                n,
                record.len()
            )));
        }
        // records are never all zero; a zeroed slot is a hole in the sidecar
        Ok(record.iter().any(|&b| b != 0))
    }
}
