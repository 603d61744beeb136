use crate::error::PageIoError;
use crate::page::{PageCache, PageProvider};
use crate::segment::PageGeometry;
use crate::store::BackingStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a file's pages are transformed on the way to and from the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptMode {
    /// Pages are stored as-is.
    Plain,
    /// Pages are sealed by the codec.
    Encrypted,
    /// An encrypted file opened read-only to expose its raw ciphertext.
    ViewAsEncrypted,
}

impl CryptMode {
    pub fn is_encrypted(self) -> bool {
        !matches!(self, CryptMode::Plain)
    }

    /// Reads skip the codec and return backing-store bytes unchanged.
    pub fn bypasses_codec(self) -> bool {
        !matches!(self, CryptMode::Encrypted)
    }
}

/// The plaintext-addressable view of one open file.
///
/// The logical size only grows through [`crate::page_io::PageIo::write`];
/// shrinking belongs to whoever truncates the file.
pub struct LogicalFile {
    id: String,
    size: AtomicU64,
    mode: CryptMode,
    geometry: PageGeometry,
    store: Arc<dyn BackingStore>,
    pages: Arc<dyn PageProvider>,
}

impl std::fmt::Debug for LogicalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalFile")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("mode", &self.mode)
            .field("page_size", &self.geometry.page_size())
            .finish_non_exhaustive()
    }
}

impl LogicalFile {
    pub fn new(
        id: impl Into<String>,
        mode: CryptMode,
        size: u64,
        store: Arc<dyn BackingStore>,
        pages: Arc<dyn PageProvider>,
    ) -> Result<Self, PageIoError> {
        let geometry = PageGeometry::new(store.page_size())?;
        if pages.page_size() != store.page_size() {
            return Err(PageIoError::invalid_input(format!(
                "page provider uses {}-byte pages but the store uses {}",
                pages.page_size(),
                store.page_size()
            )));
        }
        Ok(Self {
            id: id.into(),
            size: AtomicU64::new(size),
            mode,
            geometry,
            store,
            pages,
        })
    }

    /// Build a file whose pages come from a fresh [`PageCache`] over `store`.
    pub fn with_page_cache(
        id: impl Into<String>,
        mode: CryptMode,
        size: u64,
        store: Arc<dyn BackingStore>,
        cache_pages: usize,
    ) -> Result<Self, PageIoError> {
        let pages: Arc<dyn PageProvider> = Arc::new(PageCache::new(Arc::clone(&store), cache_pages));
        Self::new(id, mode, size, store, pages)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> CryptMode {
        self.mode
    }

    pub fn geometry(&self) -> PageGeometry {
        self.geometry
    }

    pub fn page_size(&self) -> usize {
        self.geometry.page_size()
    }

    pub fn store(&self) -> &dyn BackingStore {
        self.store.as_ref()
    }

    pub fn pages(&self) -> &dyn PageProvider {
        self.pages.as_ref()
    }

    /// Raise the logical size to `new_size`; returns whether it grew.
    pub(crate) fn grow_to(&self, new_size: u64) -> bool {
        self.size.fetch_max(new_size, Ordering::AcqRel) < new_size
    }
}
