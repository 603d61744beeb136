//! The page-granular read and write paths.
//!
//! [`PageIo`] turns arbitrary byte-range requests against a [`LogicalFile`]
//! into page operations:
//!
//! - **write**: split the range (zero-filling any gap past end-of-file), lock
//!   each page, populate it if the call leaves old bytes in place, zero-fill
//!   and copy, release, then hand it to the selected dispatch strategy;
//!   finally grow the logical size and persist it for encrypted files.
//! - **read**: clamp to end-of-file, fetch the covering pages (raw for
//!   unencrypted or view-as-encrypted files, decrypted otherwise) and copy
//!   the requested bytes out.
//!
//! There is no multi-page atomicity. A failure part way through leaves the
//! pages flushed before it in place and reports how many caller bytes made it.

use crate::codec::PageCodec;
use crate::dispatch::{self, Dispatch, PreparedPage};
use crate::error::{IoFailure, IoResult, PageIoError};
use crate::file::{CryptMode, LogicalFile};
use crate::metadata::MetadataWriter;
use crate::page::{CachePage, PageLock};
use crate::segment::{self, Segment, Segments};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Cancellation flag shared between a caller and whoever may interrupt it.
///
/// Checked between segments; a triggered interrupt ends the call with
/// [`PageIoError::Cancelled`] and the progress made so far.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-call choices.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub dispatch: Dispatch,
    pub interrupt: Option<Interrupt>,
}

impl CallOptions {
    pub fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            interrupt: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(Interrupt::is_triggered)
    }
}

pub struct PageIo {
    codec: Arc<dyn PageCodec>,
    metadata: Arc<dyn MetadataWriter>,
    dispatch: Dispatch,
}

impl PageIo {
    pub fn new(codec: Arc<dyn PageCodec>, metadata: Arc<dyn MetadataWriter>) -> Self {
        Self {
            codec,
            metadata,
            dispatch: Dispatch::default(),
        }
    }

    /// Default strategy for [`PageIo::write`] and [`PageIo::read`].
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    /// Write `buf[..size]` at logical `offset`. Returns the bytes written.
    pub fn write(&self, file: &LogicalFile, buf: &[u8], offset: u64, size: usize) -> IoResult<usize> {
        self.write_with(file, buf, offset, size, &CallOptions::new(self.dispatch))
    }

    /// Read up to `size` bytes at logical `offset` into `out`.
    /// Returns 0 at or past end-of-file.
    pub fn read(&self, file: &LogicalFile, out: &mut [u8], offset: u64, size: usize) -> IoResult<usize> {
        self.read_with(file, out, offset, size, &CallOptions::new(self.dispatch))
    }

    pub fn write_with(
        &self,
        file: &LogicalFile,
        buf: &[u8],
        offset: u64,
        size: usize,
        call: &CallOptions,
    ) -> IoResult<usize> {
        let mode = file.mode();
        if mode == CryptMode::ViewAsEncrypted {
            return Err(PageIoError::read_only(format!("{} is open to view ciphertext", file.id())).into());
        }
        let data = buf.get(..size).ok_or_else(|| {
            PageIoError::invalid_input(format!("buffer holds {} bytes but {} were requested", buf.len(), size))
        })?;
        let old_size = file.size();
        let mut segments = segment::split_write(file.geometry(), offset, size, old_size)?.peekable();
        if size == 0 {
            return Ok(0);
        }
        debug!(file = file.id(), offset, size, old_size, dispatch = ?call.dispatch, "write");

        let mut sink = dispatch::sink_for(mode, call.dispatch, self.codec.as_ref());
        let mut failure = None;

        while let Some(first) = segments.next() {
            if call.interrupted() {
                debug!(file = file.id(), page = first.page_index, "write interrupted");
                failure = Some(PageIoError::Cancelled);
                break;
            }
            let mut on_page = vec![first];
            while let Some(next) = segments.next_if(|s| s.page_index == first.page_index) {
                on_page.push(next);
            }

            let result = self
                .prepare_page(file, mode, old_size, &on_page, data, offset)
                .and_then(|prepared| sink.submit(file, prepared));
            if let Err(e) = result {
                error!(file = file.id(), page = first.page_index, error = %e, "write aborted");
                failure = Some(e);
                break;
            }
        }

        // pages prepared before an abort are complete; batched ones still go out
        if let Err(e) = sink.finish(file) {
            error!(file = file.id(), error = %e, "flushing prepared pages failed");
            failure = failure.or(Some(e));
        }

        let progress = sink.progress();
        if let Err(e) = self.sync_size(file, mode, progress.reach) {
            error!(file = file.id(), error = %e, "size synchronization failed");
            failure = failure.or(Some(e));
        }

        match failure {
            None => {
                trace!(file = file.id(), written = progress.committed, size = file.size(), "write complete");
                Ok(progress.committed)
            }
            Some(source) => Err(IoFailure::new(progress.committed, source)),
        }
    }

    pub fn read_with(
        &self,
        file: &LogicalFile,
        out: &mut [u8],
        offset: u64,
        size: usize,
        call: &CallOptions,
    ) -> IoResult<usize> {
        if out.len() < size {
            return Err(PageIoError::invalid_input(format!(
                "buffer holds {} bytes but {} were requested",
                out.len(),
                size
            ))
            .into());
        }
        let mode = file.mode();
        let file_size = file.size();
        let len = segment::clamp_read(offset, size, file_size);
        if len == 0 {
            trace!(file = file.id(), offset, file_size, "read at end of file");
            return Ok(0);
        }
        let segments = segment::split_read(file.geometry(), offset, size, file_size);
        let out = &mut out[..len];
        debug!(file = file.id(), offset, len, mode = ?mode, dispatch = ?call.dispatch, "read");

        if mode.bypasses_codec() {
            return self.read_raw(file, segments, out, offset, call);
        }
        match call.dispatch {
            Dispatch::Serial => self.read_serial(file, segments, out, offset, call),
            Dispatch::Batched => self.read_batched(file, segments, out, offset, call),
        }
    }

    /// Persist the file's current logical size again, e.g. after a
    /// [`PageIoError::MetadataPersist`] failure.
    pub fn persist_size(&self, file: &LogicalFile) -> Result<(), PageIoError> {
        if !file.mode().is_encrypted() {
            return Ok(());
        }
        self.persist(file)
    }

    /// Lock one page, bring it to a correct state and apply this call's segments.
    fn prepare_page(
        &self,
        file: &LogicalFile,
        mode: CryptMode,
        old_size: u64,
        segments: &[Segment],
        data: &[u8],
        offset: u64,
    ) -> Result<PreparedPage, PageIoError> {
        let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
            return Err(PageIoError::invalid_input("no segments for page"));
        };
        let geometry = file.geometry();
        let page_size = geometry.page_size();
        let index = first.page_index;
        let page_start = geometry.page_start(index);

        let zeroes_tail = segments.iter().any(|s| s.zero_range(page_size).is_some());
        let written_end = if zeroes_tail { page_size } else { last.end() };
        let valid_end = old_size.saturating_sub(page_start).min(page_size as u64) as usize;

        let (lock, mut page) = PageLock::acquire(file.pages(), index)?;
        if !page.is_uptodate() && valid_end > 0 && (first.offset > 0 || written_end < valid_end) {
            self.populate(file, mode, &mut page)?;
        }

        let mut data_bytes = 0;
        for seg in segments {
            if let Some(range) = seg.zero_range(page_size) {
                page.zero(range)?;
            }
            if seg.copies_data() {
                let start = (page_start + seg.offset as u64 - offset) as usize;
                let src = start
                    .checked_add(seg.len)
                    .and_then(|end| data.get(start..end))
                    .ok_or_else(|| {
                        PageIoError::invalid_input(format!(
                            "segment at page {} needs caller bytes {}..{} of {}",
                            index,
                            start,
                            start + seg.len,
                            data.len()
                        ))
                    })?;
                page.copy_in(seg.offset, src)?;
                data_bytes += seg.len;
            }
        }

        page.mark_uptodate();
        lock.release(&page);
        Ok(PreparedPage {
            page,
            span: first.offset..last.end(),
            data_bytes,
            reach: page_start + last.end() as u64,
        })
    }

    /// Load a page's current contents before a partial overwrite.
    fn populate(&self, file: &LogicalFile, mode: CryptMode, page: &mut CachePage) -> Result<(), PageIoError> {
        trace!(file = file.id(), page = page.index(), "populating page");
        if mode.is_encrypted() {
            self.codec.decrypt_page(file, page)
        } else {
            let raw = file.store().read_raw(page.index())?;
            page.fill_from(&raw);
            Ok(())
        }
    }

    fn sync_size(&self, file: &LogicalFile, mode: CryptMode, reach: u64) -> Result<(), PageIoError> {
        if !file.grow_to(reach) {
            return Ok(());
        }
        debug!(file = file.id(), size = file.size(), "logical size grew");
        if mode.is_encrypted() {
            self.persist(file)?;
        }
        Ok(())
    }

    fn persist(&self, file: &LogicalFile) -> Result<(), PageIoError> {
        self.metadata
            .persist_logical_size(file.id(), file.size())
            .map_err(|e| match e {
                PageIoError::MetadataPersist(_) => e,
                other => PageIoError::metadata(other.to_string()),
            })
    }

    /// Unencrypted and view-as-encrypted reads: store bytes, no codec.
    fn read_raw(
        &self,
        file: &LogicalFile,
        segments: Segments,
        out: &mut [u8],
        offset: u64,
        call: &CallOptions,
    ) -> IoResult<usize> {
        let geometry = file.geometry();
        let mut copied = 0;
        for seg in segments {
            if call.interrupted() {
                return Err(IoFailure::new(copied, PageIoError::Cancelled));
            }
            let page = file
                .pages()
                .raw_fetch(seg.page_index)
                .map_err(|e| IoFailure::new(copied, e))?;
            copy_segment(&page, &seg, geometry.page_start(seg.page_index), offset, out)
                .map_err(|e| IoFailure::new(copied, e))?;
            copied += seg.len;
        }
        Ok(copied)
    }

    fn read_serial(
        &self,
        file: &LogicalFile,
        segments: Segments,
        out: &mut [u8],
        offset: u64,
        call: &CallOptions,
    ) -> IoResult<usize> {
        let geometry = file.geometry();
        let mut copied = 0;
        for seg in segments {
            if call.interrupted() {
                return Err(IoFailure::new(copied, PageIoError::Cancelled));
            }
            let result = (|| {
                let (lock, mut page) = PageLock::acquire(file.pages(), seg.page_index)?;
                if !page.is_uptodate() {
                    self.codec.decrypt_page(file, &mut page)?;
                    page.mark_uptodate();
                }
                copy_segment(&page, &seg, geometry.page_start(seg.page_index), offset, out)?;
                lock.release(&page);
                Ok::<(), PageIoError>(())
            })();
            if let Err(e) = result {
                error!(file = file.id(), page = seg.page_index, error = %e, "read aborted");
                return Err(IoFailure::new(copied, e));
            }
            copied += seg.len;
        }
        Ok(copied)
    }

    /// Decrypt the covering pages in batches, one window of at most the
    /// provider's lock capacity at a time.
    fn read_batched(
        &self,
        file: &LogicalFile,
        segments: Segments,
        out: &mut [u8],
        offset: u64,
        call: &CallOptions,
    ) -> IoResult<usize> {
        let segments: Vec<Segment> = segments.collect();
        let window = file.pages().capacity().max(1);
        let mut copied = 0;
        for batch in segments.chunks(window) {
            copied += self
                .read_window(file, batch, out, offset, call)
                .map_err(|e| IoFailure::new(copied + e.committed, e.source))?;
        }
        Ok(copied)
    }

    /// Lock every page of the window (ascending), decrypt the stale ones in
    /// one codec call, then copy out and unlock.
    fn read_window(
        &self,
        file: &LogicalFile,
        segments: &[Segment],
        out: &mut [u8],
        offset: u64,
        call: &CallOptions,
    ) -> IoResult<usize> {
        let geometry = file.geometry();
        let mut locks = Vec::with_capacity(segments.len());
        let mut cached = Vec::new();
        let mut stale = Vec::new();

        for seg in segments {
            if call.interrupted() {
                return Err(IoFailure::new(0, PageIoError::Cancelled));
            }
            let (lock, page) = PageLock::acquire(file.pages(), seg.page_index)?;
            locks.push(lock);
            if page.is_uptodate() {
                cached.push(page);
            } else {
                stale.push(page);
            }
        }

        if !stale.is_empty() {
            debug!(file = file.id(), pages = stale.len(), cached = cached.len(), "dispatching decrypt batch");
            if let Err(e) = self.codec.decrypt_pages_batch(file, &mut stale) {
                error!(file = file.id(), error = %e, "decrypt batch failed");
                return Err(e.into());
            }
        }
        let mut pages: Vec<CachePage> = cached.into_iter().chain(stale).collect();
        pages.sort_by_key(CachePage::index);

        let mut copied = 0;
        for ((seg, mut page), lock) in segments.iter().zip(pages).zip(locks) {
            copy_segment(&page, seg, geometry.page_start(seg.page_index), offset, out)
                .map_err(|e| IoFailure::new(copied, e))?;
            page.mark_uptodate();
            lock.release(&page);
            copied += seg.len;
        }
        Ok(copied)
    }
}

fn copy_segment(
    page: &CachePage,
    seg: &Segment,
    page_start: u64,
    offset: u64,
    out: &mut [u8],
) -> Result<(), PageIoError> {
    let start = (page_start + seg.offset as u64 - offset) as usize;
    let dst = start
        .checked_add(seg.len)
        .and_then(|end| out.get_mut(start..end))
        .ok_or_else(|| PageIoError::invalid_input(format!("segment at page {} overruns the read buffer", seg.page_index)))?;
    page.copy_out(seg.offset, dst)
}
