use anyhow::Result;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use pagecrypt::codec::{PageCodec, XChaChaPageCodec};
use pagecrypt::metadata::MetadataWriter;
use pagecrypt::page::{CachePage, PageCache, PageProvider};
use pagecrypt::store::{BackingStore, FileStore, MemoryStore};
use pagecrypt::{config, key_manager, storagefile_ops};
use pagecrypt::{CallOptions, CryptMode, Dispatch, Interrupt, LogicalFile, PageIo, PageIoError};

const PAGE: usize = 512;

fn cipher() -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new_from_slice(&[0x42u8; 32]).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Records every persisted size; can be told to fail.
#[derive(Default)]
struct RecordingMetadata {
    fail: AtomicBool,
    persisted: Mutex<Vec<(String, u64)>>,
}

impl RecordingMetadata {
    fn last(&self) -> Option<u64> {
        self.persisted.lock().unwrap().last().map(|(_, size)| *size)
    }
}

impl MetadataWriter for RecordingMetadata {
    fn persist_logical_size(&self, file_id: &str, new_size: u64) -> Result<(), PageIoError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PageIoError::metadata("disk full"));
        }
        self.persisted.lock().unwrap().push((file_id.to_string(), new_size));
        Ok(())
    }
}

/// Real codec that refuses to encrypt one page index.
struct FailingCodec {
    inner: XChaChaPageCodec,
    fail_at: u64,
}

impl PageCodec for FailingCodec {
    fn encrypt_page(&self, file: &LogicalFile, page: &CachePage) -> Result<(), PageIoError> {
        if page.index() == self.fail_at {
            return Err(PageIoError::codec(page.index(), "injected failure"));
        }
        self.inner.encrypt_page(file, page)
    }

    fn decrypt_page(&self, file: &LogicalFile, page: &mut CachePage) -> Result<(), PageIoError> {
        self.inner.decrypt_page(file, page)
    }
}

/// Real codec that trips an interrupt once it has encrypted one page.
struct InterruptingCodec {
    inner: XChaChaPageCodec,
    interrupt: Interrupt,
}

impl PageCodec for InterruptingCodec {
    fn encrypt_page(&self, file: &LogicalFile, page: &CachePage) -> Result<(), PageIoError> {
        self.inner.encrypt_page(file, page)?;
        self.interrupt.trigger();
        Ok(())
    }

    fn decrypt_page(&self, file: &LogicalFile, page: &mut CachePage) -> Result<(), PageIoError> {
        self.inner.decrypt_page(file, page)
    }
}

/// Page cache that trips an interrupt when one page is acquired.
struct InterruptingPages {
    inner: PageCache,
    interrupt: Interrupt,
    trip_at: u64,
}

impl PageProvider for InterruptingPages {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn acquire(&self, index: u64) -> Result<CachePage, PageIoError> {
        let page = self.inner.acquire(index)?;
        if index == self.trip_at {
            self.interrupt.trigger();
        }
        Ok(page)
    }

    fn release(&self, page: &CachePage) {
        self.inner.release(page)
    }

    fn abandon(&self, index: u64) {
        self.inner.abandon(index)
    }

    fn invalidate(&self, index: u64) {
        self.inner.invalidate(index)
    }

    fn raw_fetch(&self, index: u64) -> Result<CachePage, PageIoError> {
        self.inner.raw_fetch(index)
    }
}

/// Memory store whose auth-record write can be made to fail for one page.
/// Sealed runs take the trait's page-at-a-time path.
struct FlakyStore {
    inner: MemoryStore,
    fail_record_at: Mutex<Option<u64>>,
}

impl FlakyStore {
    fn new(page_size: usize) -> Self {
        Self {
            inner: MemoryStore::new(page_size),
            fail_record_at: Mutex::new(None),
        }
    }

    fn fail_record_at(&self, index: Option<u64>) {
        *self.fail_record_at.lock().unwrap() = index;
    }
}

impl BackingStore for FlakyStore {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn write_page_segment(&self, index: u64, offset: usize, bytes: &[u8]) -> Result<usize, PageIoError> {
        self.inner.write_page_segment(index, offset, bytes)
    }

    fn read_raw(&self, index: u64) -> Result<Vec<u8>, PageIoError> {
        self.inner.read_raw(index)
    }

    fn stored_len(&self) -> Result<u64, PageIoError> {
        self.inner.stored_len()
    }

    fn write_auth_record(&self, index: u64, record: &[u8]) -> Result<(), PageIoError> {
        if *self.fail_record_at.lock().unwrap() == Some(index) {
            return Err(PageIoError::storage("injected record failure"));
        }
        self.inner.write_auth_record(index, record)
    }

    fn read_auth_record(&self, index: u64, record: &mut [u8]) -> Result<bool, PageIoError> {
        self.inner.read_auth_record(index, record)
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    file: LogicalFile,
    io: PageIo,
    metadata: Arc<RecordingMetadata>,
}

impl Harness {
    fn with_codec(mode: CryptMode, dispatch: Dispatch, cache_pages: usize, codec: Arc<dyn PageCodec>) -> Self {
        let store = Arc::new(MemoryStore::new(PAGE));
        let file = LogicalFile::with_page_cache("test.bin", mode, 0, store.clone(), cache_pages).unwrap();
        let metadata = Arc::new(RecordingMetadata::default());
        let io = PageIo::new(codec, metadata.clone()).with_dispatch(dispatch);
        Self {
            store,
            file,
            io,
            metadata,
        }
    }

    fn new(mode: CryptMode, dispatch: Dispatch) -> Self {
        Self::with_codec(mode, dispatch, 64, Arc::new(XChaChaPageCodec::new(cipher())))
    }

    fn write(&self, offset: u64, data: &[u8]) -> usize {
        self.io.write(&self.file, data, offset, data.len()).unwrap()
    }

    fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let n = self.io.read(&self.file, &mut out, offset, len).unwrap();
        out.truncate(n);
        out
    }

    /// Same store, fresh page cache: every read goes through the codec.
    fn reopen(&self, mode: CryptMode) -> LogicalFile {
        LogicalFile::with_page_cache("test.bin", mode, self.file.size(), self.store.clone(), 64).unwrap()
    }
}

const ALL_COMBINATIONS: [(CryptMode, Dispatch); 4] = [
    (CryptMode::Plain, Dispatch::Serial),
    (CryptMode::Plain, Dispatch::Batched),
    (CryptMode::Encrypted, Dispatch::Serial),
    (CryptMode::Encrypted, Dispatch::Batched),
];

#[test]
fn unaligned_write_reads_back_in_every_mode() {
    for (mode, dispatch) in ALL_COMBINATIONS {
        let h = Harness::new(mode, dispatch);
        let data = pattern(3000, 7);

        assert_eq!(h.write(300, &data), 3000, "{:?}/{:?}", mode, dispatch);
        assert_eq!(h.file.size(), 3300);

        let back = h.read(0, 3300);
        assert!(back[..300].iter().all(|&b| b == 0), "{:?}/{:?}", mode, dispatch);
        assert_eq!(&back[300..], &data[..]);

        let cold = h.reopen(mode);
        let mut out = vec![0u8; 3300];
        assert_eq!(h.io.read(&cold, &mut out, 0, 3300).unwrap(), 3300);
        assert_eq!(out, back, "cold cache {:?}/{:?}", mode, dispatch);
    }
}

#[test]
fn encrypted_store_never_holds_plaintext() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Serial);
    let data = vec![0x5au8; 2 * PAGE];
    h.write(0, &data);

    let stored = h.store.contents();
    assert_eq!(stored.len(), 2 * PAGE);
    assert_ne!(stored, data);
}

#[test]
fn plain_store_holds_exactly_the_written_bytes() {
    let h = Harness::new(CryptMode::Plain, Dispatch::Batched);
    h.write(0, b"hello");
    h.write(100, b"world");

    let stored = h.store.contents();
    assert_eq!(stored.len(), 105);
    assert_eq!(&stored[..5], b"hello");
    assert!(stored[5..100].iter().all(|&b| b == 0));
    assert_eq!(&stored[100..], b"world");
    // plain files keep their size in the data file
    assert!(h.metadata.last().is_none());
}

#[test]
fn write_past_eof_zero_fills_the_gap() {
    for (mode, dispatch) in ALL_COMBINATIONS {
        let h = Harness::new(mode, dispatch);
        h.write(0, b"head");
        let data = pattern(100, 3);
        assert_eq!(h.write(10_000, &data), 100);
        assert_eq!(h.file.size(), 10_100);

        let back = h.read(0, 10_100);
        assert_eq!(&back[..4], b"head");
        assert!(back[4..10_000].iter().all(|&b| b == 0), "{:?}/{:?}", mode, dispatch);
        assert_eq!(&back[10_000..], &data[..]);
    }
}

#[test]
fn stale_store_bytes_past_eof_never_surface() {
    // leftovers beyond the logical size, e.g. from a truncated plain file
    let h = Harness::new(CryptMode::Plain, Dispatch::Serial);
    h.store.write_page_segment(0, 0, &[0xee; PAGE]).unwrap();
    h.store.write_page_segment(1, 0, &[0xee; PAGE]).unwrap();

    h.write(700, b"x");
    let back = h.read(0, 701);
    assert!(back[..700].iter().all(|&b| b == 0));
    assert_eq!(back[700], b'x');
}

#[test]
fn in_bounds_write_leaves_size_alone() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Serial);
    h.write(0, &pattern(2000, 1));
    assert_eq!(h.metadata.last(), Some(2000));
    let persists = h.metadata.persisted.lock().unwrap().len();

    h.write(100, b"middle");
    assert_eq!(h.file.size(), 2000);
    assert_eq!(h.metadata.persisted.lock().unwrap().len(), persists);
}

#[test]
fn partial_overwrite_preserves_surrounding_bytes() {
    for (mode, dispatch) in ALL_COMBINATIONS {
        let h = Harness::new(mode, dispatch);
        let mut expected = pattern(3 * PAGE, 11);
        h.write(0, &expected);

        // drop the cache so the overwrite has to populate from the store
        let cold = h.reopen(mode);
        let patch = vec![0xffu8; 600];
        h.io.write(&cold, &patch, 400, patch.len()).unwrap();
        expected[400..1000].copy_from_slice(&patch);

        let mut out = vec![0u8; 3 * PAGE];
        h.io.read(&cold, &mut out, 0, 3 * PAGE).unwrap();
        assert_eq!(out, expected, "{:?}/{:?}", mode, dispatch);

        let fresh = h.reopen(mode);
        let mut out = vec![0u8; 3 * PAGE];
        h.io.read(&fresh, &mut out, 0, 3 * PAGE).unwrap();
        assert_eq!(out, expected, "{:?}/{:?} from store", mode, dispatch);
    }
}

#[test]
fn reads_at_or_past_eof_return_zero() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Serial);
    h.write(0, b"0123456789");

    let mut out = [0u8; 16];
    assert_eq!(h.io.read(&h.file, &mut out, 10, 16).unwrap(), 0);
    assert_eq!(h.io.read(&h.file, &mut out, 4096, 16).unwrap(), 0);
    assert_eq!(h.io.read(&h.file, &mut out, 8, 16).unwrap(), 2);
    assert_eq!(&out[..2], b"89");
}

#[test]
fn repeated_reads_are_identical() {
    for dispatch in [Dispatch::Serial, Dispatch::Batched] {
        let h = Harness::new(CryptMode::Encrypted, dispatch);
        h.write(0, &pattern(5 * PAGE + 17, 2));
        let first = h.read(33, 4 * PAGE);
        let second = h.read(33, 4 * PAGE);
        assert_eq!(first, second);
        assert_eq!(first.len(), 4 * PAGE);
    }
}

#[test]
fn zero_length_write_is_a_no_op() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Batched);
    assert_eq!(h.io.write(&h.file, &[], 1_000_000, 0).unwrap(), 0);
    assert_eq!(h.file.size(), 0);
    assert!(h.store.contents().is_empty());
}

#[test]
fn short_caller_buffer_is_rejected() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Serial);
    let err = h.io.write(&h.file, b"abc", 0, 10).unwrap_err();
    assert!(matches!(err.source, PageIoError::InvalidInput(_)));
    assert_eq!(err.committed, 0);
    assert_eq!(h.file.size(), 0);
}

#[test]
fn batched_codec_failure_keeps_earlier_pages() {
    let codec = Arc::new(FailingCodec {
        inner: XChaChaPageCodec::new(cipher()),
        fail_at: 2,
    });
    let h = Harness::with_codec(CryptMode::Encrypted, Dispatch::Batched, 64, codec);
    let data = pattern(4 * PAGE, 5);

    let err = h.io.write(&h.file, &data, 0, data.len()).unwrap_err();
    assert!(matches!(err.source, PageIoError::Codec { index: 2, .. }));
    assert_eq!(err.committed, 2 * PAGE);

    // pages 0 and 1 reached the store; the size covers exactly them
    assert_eq!(h.store.contents().len(), 2 * PAGE);
    assert_eq!(h.file.size(), (2 * PAGE) as u64);
    assert_eq!(h.metadata.last(), Some((2 * PAGE) as u64));

    let cold = h.reopen(CryptMode::Encrypted);
    let mut out = vec![0u8; 2 * PAGE];
    h.io.read(&cold, &mut out, 0, 2 * PAGE).unwrap();
    assert_eq!(out, data[..2 * PAGE]);
}

#[test]
fn serial_codec_failure_stops_at_the_failing_page() {
    let codec = Arc::new(FailingCodec {
        inner: XChaChaPageCodec::new(cipher()),
        fail_at: 1,
    });
    let h = Harness::with_codec(CryptMode::Encrypted, Dispatch::Serial, 64, codec);
    let data = pattern(3 * PAGE, 9);

    let err = h.io.write(&h.file, &data, 100, data.len()).unwrap_err();
    assert!(matches!(err.source, PageIoError::Codec { index: 1, .. }));
    assert_eq!(err.committed, PAGE - 100);
    assert_eq!(h.file.size(), PAGE as u64);
}

#[test]
fn metadata_failure_keeps_size_and_can_be_retried() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Serial);
    h.metadata.fail.store(true, Ordering::SeqCst);

    let err = h.io.write(&h.file, b"payload", 1000, 7).unwrap_err();
    assert!(matches!(err.source, PageIoError::MetadataPersist(_)));
    // the data is durable, only the size record is behind
    assert_eq!(err.committed, 7);
    assert_eq!(h.file.size(), 1007);
    assert_eq!(h.read(1000, 7), b"payload");

    h.metadata.fail.store(false, Ordering::SeqCst);
    h.io.persist_size(&h.file).unwrap();
    assert_eq!(h.metadata.last(), Some(1007));
}

#[test]
fn interrupt_before_the_call_commits_nothing() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Serial);
    let interrupt = Interrupt::new();
    interrupt.trigger();
    let call = CallOptions::new(Dispatch::Serial).with_interrupt(interrupt);

    let err = h.io.write_with(&h.file, b"data", 0, 4, &call).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.committed, 0);
    assert_eq!(h.file.size(), 0);

    // nothing to read yet: end of file wins over the interrupt
    let mut out = [0u8; 4];
    assert_eq!(h.io.read_with(&h.file, &mut out, 0, 4, &call).unwrap(), 0);

    h.write(0, b"data");
    let err = h.io.read_with(&h.file, &mut out, 0, 4, &call).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.committed, 0);
}

#[test]
fn interrupt_mid_write_reports_partial_progress() {
    let interrupt = Interrupt::new();
    let codec = Arc::new(InterruptingCodec {
        inner: XChaChaPageCodec::new(cipher()),
        interrupt: interrupt.clone(),
    });
    let h = Harness::with_codec(CryptMode::Encrypted, Dispatch::Serial, 64, codec);
    let call = CallOptions::new(Dispatch::Serial).with_interrupt(interrupt);
    let data = pattern(3 * PAGE, 4);

    let err = h.io.write_with(&h.file, &data, 0, data.len(), &call).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.committed, PAGE);
    assert_eq!(h.file.size(), PAGE as u64);
    assert_eq!(h.read(0, PAGE), data[..PAGE]);
}

#[test]
fn view_as_encrypted_exposes_ciphertext_and_refuses_writes() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Serial);
    let data = pattern(PAGE + 50, 8);
    h.write(0, &data);

    let view = h.reopen(CryptMode::ViewAsEncrypted);
    let mut raw = vec![0u8; data.len()];
    assert_eq!(h.io.read(&view, &mut raw, 0, data.len()).unwrap(), data.len());
    assert_ne!(raw, data);
    assert_eq!(raw, h.store.contents()[..data.len()]);

    let err = h.io.write(&view, b"nope", 0, 4).unwrap_err();
    assert!(matches!(err.source, PageIoError::ReadOnly(_)));
    assert_eq!(h.store.contents()[..data.len()], raw[..]);
}

#[test]
fn tampered_page_fails_the_read() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Serial);
    h.write(0, &pattern(2 * PAGE, 6));
    h.store.write_page_segment(1, 7, &[0u8; 3]).unwrap();

    let cold = h.reopen(CryptMode::Encrypted);
    let mut out = vec![0u8; 2 * PAGE];
    let err = h.io.read(&cold, &mut out, 0, 2 * PAGE).unwrap_err();
    assert!(matches!(err.source, PageIoError::Codec { index: 1, .. }));
    assert_eq!(err.committed, PAGE);
}

#[test]
fn batched_read_larger_than_cache_walks_in_windows() {
    let codec = Arc::new(XChaChaPageCodec::new(cipher()));
    let h = Harness::with_codec(CryptMode::Encrypted, Dispatch::Serial, 2, codec);
    let data = pattern(8 * PAGE + 100, 10);
    h.write(0, &data);

    // four times the cache capacity, unaligned, from a cold cache
    let cold = LogicalFile::with_page_cache("test.bin", CryptMode::Encrypted, h.file.size(), h.store.clone(), 2).unwrap();
    let call = CallOptions::new(Dispatch::Batched);
    let len = data.len() - 37;
    let mut out = vec![0u8; len];
    assert_eq!(h.io.read_with(&cold, &mut out, 37, len, &call).unwrap(), len);
    assert_eq!(out, data[37..]);

    // warm pages and stale ones mixed within a window
    let mut again = vec![0u8; len];
    assert_eq!(h.io.read_with(&cold, &mut again, 37, len, &call).unwrap(), len);
    assert_eq!(again, out);
}

#[test]
fn batched_read_failure_counts_earlier_windows() {
    let codec = Arc::new(XChaChaPageCodec::new(cipher()));
    let h = Harness::with_codec(CryptMode::Encrypted, Dispatch::Serial, 2, codec);
    h.write(0, &pattern(8 * PAGE, 15));
    h.store.write_page_segment(5, 0, &[0u8; 4]).unwrap();

    let cold = LogicalFile::with_page_cache("test.bin", CryptMode::Encrypted, h.file.size(), h.store.clone(), 2).unwrap();
    let call = CallOptions::new(Dispatch::Batched);
    let mut out = vec![0u8; 8 * PAGE];
    let err = h.io.read_with(&cold, &mut out, 0, 8 * PAGE, &call).unwrap_err();
    assert!(matches!(err.source, PageIoError::Codec { index: 5, .. }));
    // windows [0, 1] and [2, 3] were copied out before [4, 5] failed
    assert_eq!(err.committed, 4 * PAGE);
}

#[test]
fn interrupt_mid_batched_write_flushes_prepared_pages() {
    let interrupt = Interrupt::new();
    let store = Arc::new(MemoryStore::new(PAGE));
    let pages = Arc::new(InterruptingPages {
        inner: PageCache::new(store.clone(), 64),
        interrupt: interrupt.clone(),
        trip_at: 1,
    });
    let file = LogicalFile::new("test.bin", CryptMode::Encrypted, 0, store.clone(), pages).unwrap();
    let metadata = Arc::new(RecordingMetadata::default());
    let io = PageIo::new(Arc::new(XChaChaPageCodec::new(cipher())), metadata.clone());
    let call = CallOptions::new(Dispatch::Batched).with_interrupt(interrupt);
    let data = pattern(4 * PAGE, 14);

    let err = io.write_with(&file, &data, 0, data.len(), &call).unwrap_err();
    assert!(err.is_cancelled());
    // pages 0 and 1 were prepared before the interrupt was seen
    assert_eq!(err.committed, 2 * PAGE);
    assert_eq!(file.size(), (2 * PAGE) as u64);
    assert_eq!(metadata.last(), Some((2 * PAGE) as u64));
    assert_eq!(store.contents().len(), 2 * PAGE);

    let cold = LogicalFile::with_page_cache("test.bin", CryptMode::Encrypted, file.size(), store.clone(), 64).unwrap();
    let mut out = vec![0u8; 2 * PAGE];
    assert_eq!(io.read(&cold, &mut out, 0, 2 * PAGE).unwrap(), 2 * PAGE);
    assert_eq!(out, data[..2 * PAGE]);
}

#[test]
fn store_failure_mid_run_leaves_later_pages_intact() {
    let store = Arc::new(FlakyStore::new(PAGE));
    let file = LogicalFile::with_page_cache("test.bin", CryptMode::Encrypted, 0, store.clone(), 64).unwrap();
    let io = PageIo::new(
        Arc::new(XChaChaPageCodec::new(cipher())),
        Arc::new(RecordingMetadata::default()),
    )
    .with_dispatch(Dispatch::Batched);
    io.write(&file, &[1u8; 4 * PAGE], 0, 4 * PAGE).unwrap();

    store.fail_record_at(Some(2));
    let err = io.write(&file, &[2u8; 4 * PAGE], 0, 4 * PAGE).unwrap_err();
    assert!(matches!(err.source, PageIoError::Storage(_)));
    assert_eq!(err.committed, 2 * PAGE);
    store.fail_record_at(None);

    let cold = LogicalFile::with_page_cache("test.bin", CryptMode::Encrypted, file.size(), store.clone(), 64).unwrap();
    let read_page = |index: usize| {
        let mut out = vec![0u8; PAGE];
        io.read(&cold, &mut out, (index * PAGE) as u64, PAGE).map(|_| out)
    };
    assert_eq!(read_page(0).unwrap(), vec![2u8; PAGE]);
    assert_eq!(read_page(1).unwrap(), vec![2u8; PAGE]);
    // the failing page is torn: new ciphertext under its old record
    assert!(matches!(read_page(2).unwrap_err().source, PageIoError::Codec { index: 2, .. }));
    // pages after the failure still hold the previous write
    assert_eq!(read_page(3).unwrap(), vec![1u8; PAGE]);

    // the original handle dropped its copies of the pages that did not land
    let mut out = vec![0u8; PAGE];
    io.read(&file, &mut out, (3 * PAGE) as u64, PAGE).unwrap();
    assert_eq!(out, vec![1u8; PAGE]);
}

#[test]
fn concurrent_writers_on_distinct_pages() {
    let h = Harness::new(CryptMode::Encrypted, Dispatch::Serial);
    let chunks: Vec<Vec<u8>> = (0..4).map(|t| pattern(2 * PAGE, t as u8 * 40)).collect();
    // size the file first; a writer past end-of-file would zero-fill its neighbours' pages
    h.write(0, &vec![0u8; 8 * PAGE]);

    std::thread::scope(|s| {
        for (t, chunk) in chunks.iter().enumerate() {
            let h = &h;
            s.spawn(move || {
                let offset = (t * 2 * PAGE) as u64;
                h.io.write(&h.file, chunk, offset, chunk.len()).unwrap();
            });
        }
    });

    assert_eq!(h.file.size(), (8 * PAGE) as u64);
    assert_eq!(h.metadata.last(), Some((8 * PAGE) as u64));
    let back = h.read(0, 8 * PAGE);
    for (t, chunk) in chunks.iter().enumerate() {
        assert_eq!(&back[t * 2 * PAGE..(t + 1) * 2 * PAGE], &chunk[..]);
    }
}

#[test]
fn file_store_survives_reopen() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("data.bin");
    let io = PageIo::new(
        Arc::new(XChaChaPageCodec::new(cipher())),
        Arc::new(RecordingMetadata::default()),
    )
    .with_dispatch(Dispatch::Batched);
    let data = pattern(5000, 12);

    {
        let store = Arc::new(FileStore::open(&path, PAGE)?);
        let file = LogicalFile::with_page_cache("data.bin", CryptMode::Encrypted, 0, store, 16)?;
        io.write(&file, &data, 123, data.len())?;
    }

    let store = Arc::new(FileStore::open(&path, PAGE)?);
    assert!(fs::metadata(FileStore::auth_path(&path))?.len() > 0);
    let file = LogicalFile::with_page_cache("data.bin", CryptMode::Encrypted, 5123, store, 16)?;
    let mut out = vec![0u8; 5123];
    assert_eq!(io.read(&file, &mut out, 0, 5123)?, 5123);
    assert!(out[..123].iter().all(|&b| b == 0));
    assert_eq!(&out[123..], &data[..]);
    Ok(())
}

fn test_config(tmp: &TempDir) -> config::Config {
    config::Config {
        page_size: 1024,
        cache_pages: 8,
        ..config::Config::new(
            tmp.path().join("page.key").to_string_lossy(),
            tmp.path().join("storage").to_string_lossy(),
        )
    }
}

#[tokio::test]
async fn securepageops_roundtrip_across_reopen() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    let data = pattern(20_000, 13);

    {
        let km = key_manager::KeyManager::new(&cfg).await?;
        let ops = storagefile_ops::SecurePageOps::from_config(km, &cfg);
        let file = ops.create("it.bin", CryptMode::Encrypted)?;
        ops.write_at(&file, 0, &data[..5000])?;
        ops.write_at(&file, 5000, &data[5000..])?;
        assert_eq!(ops.get_metadata("it.bin")?.size, 20_000);
    }

    // same key file, new process state
    let km = key_manager::KeyManager::new(&cfg).await?;
    let ops = storagefile_ops::SecurePageOps::from_config(km, &cfg).with_dispatch(Dispatch::Batched);
    let file = ops.open("it.bin")?;
    assert_eq!(file.size(), 20_000);
    assert_eq!(file.page_size(), 1024);
    // more pages than the cache holds, so this reads in chunks
    assert_eq!(ops.read_all(&file)?, data);

    let view = ops.open_view_as_encrypted("it.bin")?;
    let mut raw = vec![0u8; 100];
    ops.read_at(&view, 0, &mut raw)?;
    assert_ne!(raw[..], data[..100]);
    Ok(())
}

#[tokio::test]
async fn securepageops_wrong_key_fails_authentication() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);

    let km = key_manager::KeyManager::new(&cfg).await?;
    let ops = storagefile_ops::SecurePageOps::from_config(km, &cfg);
    let file = ops.create("secret.txt", CryptMode::Encrypted)?;
    ops.write_at(&file, 0, b"top secret")?;

    let other = key_manager::KeyManager::from_bytes([0x24u8; 32]);
    let ops = storagefile_ops::SecurePageOps::from_config(other, &cfg);
    let file = ops.open("secret.txt")?;
    let mut out = [0u8; 10];
    let err = ops.read_at(&file, 0, &mut out).unwrap_err();
    assert!(matches!(err.source, PageIoError::Codec { .. }));
    assert_eq!(out, [0u8; 10]);
    Ok(())
}

#[tokio::test]
async fn securepageops_plain_files_and_management() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(&tmp);
    let km = key_manager::KeyManager::new(&cfg).await?;
    let ops = storagefile_ops::SecurePageOps::from_config(km, &cfg);

    let plain = ops.create("notes.txt", CryptMode::Plain)?;
    ops.write_at(&plain, 3, b"plain text")?;
    let enc = ops.create("vault.bin", CryptMode::Encrypted)?;
    ops.write_at(&enc, 0, b"sealed")?;

    assert!(ops.create("notes.txt", CryptMode::Plain).is_err());
    assert!(ops.create("other", CryptMode::ViewAsEncrypted).is_err());

    // plain data is readable straight off disk
    let on_disk = fs::read(tmp.path().join("storage").join("notes.txt"))?;
    assert_eq!(&on_disk[3..], b"plain text");
    let reopened = ops.open("notes.txt")?;
    assert_eq!(reopened.size(), 13);
    assert_eq!(ops.read_all(&reopened)?[3..], b"plain text"[..]);

    let files = ops.list_files()?;
    let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["notes.txt", "vault.bin"]);
    let vault = &files[1];
    assert_eq!(vault.metadata.as_ref().map(|m| m.size), Some(6));
    assert_eq!(vault.metadata.as_ref().map(|m| m.mode), Some(CryptMode::Encrypted));
    assert_eq!(vault.stored_bytes, 1024);

    ops.delete_file("vault.bin")?;
    assert!(!ops.exists("vault.bin"));
    assert!(!tmp.path().join("storage").join("vault.bin.auth").exists());
    assert_eq!(ops.list_files()?.len(), 1);
    Ok(())
}
