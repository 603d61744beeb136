//! Per-page encryption.
//!
//! [`XChaChaPageCodec`] seals each page with XChaCha20-Poly1305 in detached
//! mode, so ciphertext is exactly one page long and lands in the same slot as
//! the plaintext would. The nonce and tag travel in the page's auth record:
//!
//! ```text
//! data file:  [page 0 ciphertext][page 1 ciphertext]...
//! auth file:  [nonce:24][tag:16] [nonce:24][tag:16] ...
//! ```
//!
//! The associated data binds every page to its file id and index, so
//! ciphertext copied to another position or another file fails to open.

pub use crate::error::BatchError;
use crate::error::PageIoError;
use crate::file::LogicalFile;
use crate::page::CachePage;
use chacha20poly1305::aead::{AeadCore, AeadInPlace, OsRng};
use chacha20poly1305::{Tag, XChaCha20Poly1305, XNonce};
use tracing::{debug, error, trace};

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// On-disk size of one page's auth record: nonce followed by tag.
pub const AUTH_RECORD_LEN: usize = NONCE_LEN + TAG_LEN;

/// Transforms pages between their cached plaintext and stored ciphertext.
///
/// Encryption delivers the ciphertext to the file's backing store itself;
/// decryption fills the page buffer from the backing store.
pub trait PageCodec: Send + Sync {
    fn encrypt_page(&self, file: &LogicalFile, page: &CachePage) -> Result<(), PageIoError>;

    fn decrypt_page(&self, file: &LogicalFile, page: &mut CachePage) -> Result<(), PageIoError>;

    /// Encrypt and flush `pages` (ascending index) in one call.
    fn encrypt_pages_batch(&self, file: &LogicalFile, pages: &[CachePage]) -> Result<(), BatchError> {
        for (completed, page) in pages.iter().enumerate() {
            self.encrypt_page(file, page)
                .map_err(|source| BatchError { completed, source })?;
        }
        Ok(())
    }

    fn decrypt_pages_batch(&self, file: &LogicalFile, pages: &mut [CachePage]) -> Result<(), PageIoError> {
        for page in pages.iter_mut() {
            self.decrypt_page(file, page)?;
        }
        Ok(())
    }
}

/// XChaCha20-Poly1305 page codec with length-preserving ciphertext.
pub struct XChaChaPageCodec {
    cipher: XChaCha20Poly1305,
}

impl XChaChaPageCodec {
    pub fn new(cipher: XChaCha20Poly1305) -> Self {
        Self { cipher }
    }

    fn aad(file_id: &str, index: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(file_id.len() + 8);
        aad.extend_from_slice(file_id.as_bytes());
        aad.extend_from_slice(&index.to_be_bytes());
        aad
    }

    /// Encrypt a copy of the page; the cached plaintext stays untouched.
    fn seal(&self, file_id: &str, page: &CachePage) -> Result<(Vec<u8>, [u8; AUTH_RECORD_LEN]), PageIoError> {
        let index = page.index();
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut buf = page.data().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, &Self::aad(file_id, index), &mut buf)
            .map_err(|e| PageIoError::codec(index, format!("encryption failed: {}", e)))?;

        let mut record = [0u8; AUTH_RECORD_LEN];
        record[..NONCE_LEN].copy_from_slice(&nonce);
        record[NONCE_LEN..].copy_from_slice(&tag);
        Ok((buf, record))
    }

    fn open(&self, file_id: &str, page: &mut CachePage, record: &[u8; AUTH_RECORD_LEN]) -> Result<(), PageIoError> {
        let index = page.index();
        #[allow(deprecated)]
        let nonce = XNonce::from_slice(&record[..NONCE_LEN]);
        #[allow(deprecated)]
        let tag = Tag::from_slice(&record[NONCE_LEN..]);
        let result = self.cipher.decrypt_in_place_detached(
            nonce,
            &Self::aad(file_id, index),
            page.data_mut(),
            tag,
        );
        if let Err(e) = result {
            // never hand back unauthenticated bytes
            page.fill_from(&[]);
            error!(file = file_id, page = index, "page authentication failed");
            return Err(PageIoError::codec(index, format!("decryption failed: {}", e)));
        }
        Ok(())
    }

    /// Write one contiguous run of sealed pages. `completed` in the error
    /// counts from the start of the batch, not of the run.
    fn flush_run(&self, file: &LogicalFile, run: &SealedRun) -> Result<(), BatchError> {
        if run.records.is_empty() {
            return Ok(());
        }
        file.store()
            .write_sealed_run(run.start_index, &run.ciphertext, &run.records)
            .map_err(|e| {
                error!(file = file.id(), page = run.start_index + e.completed as u64, error = %e.source, "sealed run write failed");
                BatchError {
                    completed: run.batch_pos + e.completed,
                    source: e.source,
                }
            })?;
        trace!(file = file.id(), page = run.start_index, pages = run.records.len(), "flushed sealed run");
        Ok(())
    }
}

/// Sealed pages with consecutive indices, waiting to be written together.
#[derive(Default)]
struct SealedRun {
    start_index: u64,
    /// Position in the batch of the run's first page.
    batch_pos: usize,
    ciphertext: Vec<u8>,
    records: Vec<[u8; AUTH_RECORD_LEN]>,
}

impl SealedRun {
    fn accepts(&self, index: u64) -> bool {
        self.records.is_empty() || index == self.start_index + self.records.len() as u64
    }

    fn restart(&mut self, start_index: u64, batch_pos: usize) {
        self.start_index = start_index;
        self.batch_pos = batch_pos;
        self.ciphertext.clear();
        self.records.clear();
    }
}

impl PageCodec for XChaChaPageCodec {
    fn encrypt_page(&self, file: &LogicalFile, page: &CachePage) -> Result<(), PageIoError> {
        let (ciphertext, record) = self.seal(file.id(), page)?;
        file.store()
            .write_sealed_run(page.index(), &ciphertext, &[record])
            .map_err(|e| e.source)?;
        trace!(file = file.id(), page = page.index(), "page encrypted");
        Ok(())
    }

    fn decrypt_page(&self, file: &LogicalFile, page: &mut CachePage) -> Result<(), PageIoError> {
        let index = page.index();
        let store = file.store();
        let raw = store.read_raw(index)?;
        let mut record = [0u8; AUTH_RECORD_LEN];
        let has_record = store.read_auth_record(index, &mut record)?;

        match (raw.is_empty(), has_record) {
            (true, false) => {
                // never written: a hole reads as zeros
                page.fill_from(&[]);
                Ok(())
            }
            (false, false) => Err(PageIoError::codec(index, "ciphertext without auth record")),
            _ if raw.len() != page.len() => Err(PageIoError::codec(
                index,
                format!("truncated ciphertext: {} of {} bytes", raw.len(), page.len()),
            )),
            _ => {
                page.fill_from(&raw);
                self.open(file.id(), page, &record)
            }
        }
    }

    /// Seals pages in order and writes each run of consecutive indices with a
    /// single store call. A failure on page `k` still flushes the pages sealed
    /// before it, so the store holds pages `0..k` of the batch; pages after `k`
    /// are never touched.
    fn encrypt_pages_batch(&self, file: &LogicalFile, pages: &[CachePage]) -> Result<(), BatchError> {
        let page_size = file.page_size();
        let mut run = SealedRun::default();
        run.ciphertext.reserve(pages.len().min(64) * page_size);

        for (pos, page) in pages.iter().enumerate() {
            if !run.accepts(page.index()) {
                self.flush_run(file, &run)?;
                run.restart(page.index(), pos);
            } else if run.records.is_empty() {
                run.restart(page.index(), pos);
            }

            match self.seal(file.id(), page) {
                Ok((ciphertext, record)) => {
                    run.ciphertext.extend_from_slice(&ciphertext);
                    run.records.push(record);
                }
                Err(source) => {
                    self.flush_run(file, &run)?;
                    return Err(BatchError { completed: pos, source });
                }
            }
        }

        self.flush_run(file, &run)?;
        debug!(file = file.id(), pages = pages.len(), "batch encrypted");
        Ok(())
    }
}
