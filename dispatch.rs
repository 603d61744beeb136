//! Crypto dispatch strategies for the write path.
//!
//! Every page leaves the write loop fully initialized and unlocked as a
//! [`PreparedPage`]. A sink decides when it reaches the backing store:
//!
//! - [`Passthrough`]: unencrypted files, modified span written immediately
//! - [`SerialEncrypt`]: one codec call per page, immediately
//! - [`BatchedEncrypt`]: pages held until the loop ends, then one codec call

use crate::codec::{BatchError, PageCodec};
use crate::error::PageIoError;
use crate::file::{CryptMode, LogicalFile};
use crate::page::CachePage;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::str::FromStr;
use tracing::{debug, warn};

/// How encrypted pages are handed to the codec within one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dispatch {
    /// Encrypt and flush each page as soon as it is written.
    #[default]
    Serial,
    /// Collect every touched page and encrypt them in a single batch call.
    Batched,
}

impl FromStr for Dispatch {
    type Err = PageIoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Dispatch::Serial),
            "batched" | "batch" => Ok(Dispatch::Batched),
            other => Err(PageIoError::invalid_input(format!(
                "unknown dispatch '{}', expected 'serial' or 'batched'",
                other
            ))),
        }
    }
}

/// A page that finished its zero-fill and copy pass.
#[derive(Debug)]
pub(crate) struct PreparedPage {
    pub page: CachePage,
    /// Bytes of the page touched by this call.
    pub span: Range<usize>,
    /// Caller bytes copied into the page.
    pub data_bytes: usize,
    /// Logical offset just past the last byte this page touched.
    pub reach: u64,
}

/// What has reached the backing store so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    pub committed: usize,
    pub reach: u64,
}

impl Progress {
    fn advance(&mut self, data_bytes: usize, reach: u64) {
        self.committed += data_bytes;
        self.reach = self.reach.max(reach);
    }
}

pub(crate) trait WriteSink {
    fn submit(&mut self, file: &LogicalFile, prepared: PreparedPage) -> Result<(), PageIoError>;

    /// Flush anything still held. Called once, also after an aborted loop.
    fn finish(&mut self, file: &LogicalFile) -> Result<(), PageIoError>;

    fn progress(&self) -> Progress;
}

pub(crate) fn sink_for<'c>(
    mode: CryptMode,
    dispatch: Dispatch,
    codec: &'c dyn PageCodec,
) -> Box<dyn WriteSink + 'c> {
    match (mode.is_encrypted(), dispatch) {
        (false, _) => Box::new(Passthrough::default()),
        (true, Dispatch::Serial) => Box::new(SerialEncrypt {
            codec,
            progress: Progress::default(),
        }),
        (true, Dispatch::Batched) => Box::new(BatchedEncrypt {
            codec,
            pages: Vec::new(),
            pending: Vec::new(),
            progress: Progress::default(),
        }),
    }
}

/// Writes only the modified span of each page, untransformed.
#[derive(Default)]
pub(crate) struct Passthrough {
    progress: Progress,
}

impl WriteSink for Passthrough {
    fn submit(&mut self, file: &LogicalFile, prepared: PreparedPage) -> Result<(), PageIoError> {
        let index = prepared.page.index();
        let span = prepared.span.clone();
        let bytes = prepared
            .page
            .data()
            .get(span.clone())
            .ok_or_else(|| PageIoError::invalid_input(format!("span {:?} outside page {}", span, index)))?;
        if let Err(e) = file.store().write_page_segment(index, span.start, bytes) {
            file.pages().invalidate(index);
            return Err(e);
        }
        self.progress.advance(prepared.data_bytes, prepared.reach);
        Ok(())
    }

    fn finish(&mut self, _file: &LogicalFile) -> Result<(), PageIoError> {
        Ok(())
    }

    fn progress(&self) -> Progress {
        self.progress
    }
}

pub(crate) struct SerialEncrypt<'c> {
    codec: &'c dyn PageCodec,
    progress: Progress,
}

impl WriteSink for SerialEncrypt<'_> {
    fn submit(&mut self, file: &LogicalFile, prepared: PreparedPage) -> Result<(), PageIoError> {
        if let Err(e) = self.codec.encrypt_page(file, &prepared.page) {
            file.pages().invalidate(prepared.page.index());
            return Err(e);
        }
        self.progress.advance(prepared.data_bytes, prepared.reach);
        Ok(())
    }

    fn finish(&mut self, _file: &LogicalFile) -> Result<(), PageIoError> {
        Ok(())
    }

    fn progress(&self) -> Progress {
        self.progress
    }
}

pub(crate) struct BatchedEncrypt<'c> {
    codec: &'c dyn PageCodec,
    pages: Vec<CachePage>,
    /// `(data_bytes, reach)` per entry of `pages`.
    pending: Vec<(usize, u64)>,
    progress: Progress,
}

impl WriteSink for BatchedEncrypt<'_> {
    fn submit(&mut self, _file: &LogicalFile, prepared: PreparedPage) -> Result<(), PageIoError> {
        debug_assert!(self
            .pages
            .last()
            .map_or(true, |last| last.index() < prepared.page.index()));
        self.pages.push(prepared.page);
        self.pending.push((prepared.data_bytes, prepared.reach));
        Ok(())
    }

    fn finish(&mut self, file: &LogicalFile) -> Result<(), PageIoError> {
        if self.pages.is_empty() {
            return Ok(());
        }
        let pages = std::mem::take(&mut self.pages);
        let pending = std::mem::take(&mut self.pending);
        debug!(file = file.id(), pages = pages.len(), "dispatching encrypt batch");

        let completed = match self.codec.encrypt_pages_batch(file, &pages) {
            Ok(()) => pages.len(),
            Err(BatchError { completed, source }) => {
                warn!(file = file.id(), completed, total = pages.len(), error = %source, "encrypt batch stopped");
                for &(data_bytes, reach) in &pending[..completed.min(pending.len())] {
                    self.progress.advance(data_bytes, reach);
                }
                for page in pages.iter().skip(completed) {
                    file.pages().invalidate(page.index());
                }
                return Err(source);
            }
        };
        for &(data_bytes, reach) in &pending[..completed] {
            self.progress.advance(data_bytes, reach);
        }
        Ok(())
    }

    fn progress(&self) -> Progress {
        self.progress
    }
}
