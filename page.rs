//! Cache pages and the provider that hands them out under exclusive locks.
//!
//! A [`CachePage`] is an owned buffer: callers mutate it while they hold the
//! page's lock and give a snapshot back through [`PageProvider::release`].
//! The provider never lends out its own storage, so a caller's copy cannot
//! alias another caller's page.

use crate::error::PageIoError;
use crate::store::BackingStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{trace, warn};

/// One page-aligned, fixed-size unit of I/O.
#[derive(Clone, PartialEq, Eq)]
pub struct CachePage {
    index: u64,
    data: Box<[u8]>,
    uptodate: bool,
}

impl std::fmt::Debug for CachePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePage")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .field("uptodate", &self.uptodate)
            .finish_non_exhaustive()
    }
}

impl CachePage {
    /// A zeroed page that is not yet uptodate.
    pub fn new(index: u64, page_size: usize) -> Self {
        Self {
            index,
            data: vec![0u8; page_size].into_boxed_slice(),
            uptodate: false,
        }
    }

    /// An uptodate page holding `bytes`, zero-padded to `page_size`.
    pub fn filled(index: u64, page_size: usize, bytes: &[u8]) -> Self {
        let mut page = Self::new(index, page_size);
        page.fill_from(bytes);
        page.uptodate = true;
        page
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_uptodate(&self) -> bool {
        self.uptodate
    }

    pub fn mark_uptodate(&mut self) {
        self.uptodate = true;
    }

    /// Replace the contents with `bytes`; anything past `bytes` becomes zero.
    pub fn fill_from(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.data[n..].fill(0);
    }

    pub fn zero(&mut self, range: Range<usize>) -> Result<(), PageIoError> {
        let len = self.data.len();
        let index = self.index;
        self.data
            .get_mut(range.clone())
            .ok_or_else(|| {
                PageIoError::invalid_input(format!(
                    "zero range {:?} outside page {} of size {}",
                    range, index, len
                ))
            })?
            .fill(0);
        Ok(())
    }

    /// Bounds-checked copy of `src` into the page at `offset`.
    pub fn copy_in(&mut self, offset: usize, src: &[u8]) -> Result<(), PageIoError> {
        let len = self.data.len();
        let index = self.index;
        let dst = offset
            .checked_add(src.len())
            .and_then(|end| self.data.get_mut(offset..end))
            .ok_or_else(|| {
                PageIoError::invalid_input(format!(
                    "copy of {} bytes at {} overruns page {} of size {}",
                    src.len(),
                    offset,
                    index,
                    len
                ))
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Bounds-checked copy from the page at `offset` into `dst`.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> Result<(), PageIoError> {
        let src = offset
            .checked_add(dst.len())
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                PageIoError::invalid_input(format!(
                    "read of {} bytes at {} overruns page {} of size {}",
                    dst.len(),
                    offset,
                    self.index,
                    self.data.len()
                ))
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// Source of exclusively locked cache pages for one logical file.
pub trait PageProvider: Send + Sync {
    fn page_size(&self) -> usize;

    /// Most pages that may be locked at once. Callers holding several pages
    /// must stay at or below it.
    fn capacity(&self) -> usize;

    /// Lock page `index` for exclusive use, waiting while another caller holds it.
    /// The returned page is uptodate only if the provider had a valid copy.
    fn acquire(&self, index: u64) -> Result<CachePage, PageIoError>;

    /// Unlock a page. Uptodate contents are kept for later acquisitions.
    fn release(&self, page: &CachePage);

    /// Unlock a page without keeping any contents.
    fn abandon(&self, index: u64);

    /// Drop a cached copy that must not be served again.
    fn invalidate(&self, index: u64);

    /// Page contents straight from the backing store, bypassing cache and codec.
    fn raw_fetch(&self, index: u64) -> Result<CachePage, PageIoError>;
}

#[derive(Debug, Default)]
struct CacheState {
    resident: HashMap<u64, Box<[u8]>>,
    /// Eviction order of resident pages (oldest first).
    order: VecDeque<u64>,
    locked: HashSet<u64>,
}

impl CacheState {
    fn forget(&mut self, index: u64) {
        if self.resident.remove(&index).is_some() {
            self.order.retain(|&i| i != index);
        }
    }
}

/// In-memory page cache with per-page locks and bounded residency.
pub struct PageCache {
    page_size: usize,
    capacity: usize,
    store: Arc<dyn BackingStore>,
    state: Mutex<CacheState>,
    unlocked: Condvar,
}

impl PageCache {
    /// `capacity` bounds both resident and simultaneously locked pages.
    pub fn new(store: Arc<dyn BackingStore>, capacity: usize) -> Self {
        Self {
            page_size: store.page_size(),
            capacity: capacity.max(1),
            store,
            state: Mutex::new(CacheState::default()),
            unlocked: Condvar::new(),
        }
    }

    pub fn resident_pages(&self) -> usize {
        self.state().resident.len()
    }

    pub fn is_locked(&self, index: u64) -> bool {
        self.state().locked.contains(&index)
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PageProvider for PageCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn acquire(&self, index: u64) -> Result<CachePage, PageIoError> {
        let mut state = self.state();
        while state.locked.contains(&index) {
            state = self
                .unlocked
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.locked.len() >= self.capacity {
            warn!(page = index, locked = state.locked.len(), "page cache exhausted");
            return Err(PageIoError::resource_exhaustion(format!(
                "cannot lock page {}: {} pages already locked",
                index,
                state.locked.len()
            )));
        }
        state.locked.insert(index);

        let page = match state.resident.remove(&index) {
            Some(data) => {
                state.order.retain(|&i| i != index);
                trace!(page = index, "page cache hit");
                CachePage {
                    index,
                    data,
                    uptodate: true,
                }
            }
            None => CachePage::new(index, self.page_size),
        };
        Ok(page)
    }

    fn release(&self, page: &CachePage) {
        let mut state = self.state();
        state.locked.remove(&page.index);
        state.forget(page.index);
        if page.uptodate {
            state.resident.insert(page.index, page.data.clone());
            state.order.push_back(page.index);
            while state.resident.len() > self.capacity {
                match state.order.pop_front() {
                    Some(old) => {
                        state.resident.remove(&old);
                    }
                    None => break,
                }
            }
        }
        drop(state);
        self.unlocked.notify_all();
    }

    fn abandon(&self, index: u64) {
        let mut state = self.state();
        state.locked.remove(&index);
        state.forget(index);
        drop(state);
        self.unlocked.notify_all();
    }

    fn invalidate(&self, index: u64) {
        let mut state = self.state();
        // a locked page is owned by its holder, whose release replaces the copy
        if !state.locked.contains(&index) {
            state.forget(index);
        }
    }

    fn raw_fetch(&self, index: u64) -> Result<CachePage, PageIoError> {
        let bytes = self.store.read_raw(index)?;
        Ok(CachePage::filled(index, self.page_size, &bytes))
    }
}

/// Holds a page lock for the duration of a mutation; unlocks on drop unless released.
pub(crate) struct PageLock<'a> {
    provider: &'a dyn PageProvider,
    index: u64,
    held: bool,
}

impl<'a> PageLock<'a> {
    pub(crate) fn acquire(
        provider: &'a dyn PageProvider,
        index: u64,
    ) -> Result<(Self, CachePage), PageIoError> {
        let page = provider.acquire(index)?;
        Ok((
            Self {
                provider,
                index,
                held: true,
            },
            page,
        ))
    }

    pub(crate) fn release(mut self, page: &CachePage) {
        debug_assert_eq!(page.index(), self.index);
        self.held = false;
        self.provider.release(page);
    }
}

impl Drop for PageLock<'_> {
    fn drop(&mut self) {
        if self.held {
            self.provider.abandon(self.index);
        }
    }
}
