use thiserror::Error;

/// Errors raised by the page-granular I/O path and its collaborators.
#[derive(Debug, Error)]
pub enum PageIoError {
    /// The page provider could not hand out another locked page
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// The page provider failed for a reason other than capacity
    #[error("Provider error: {0}")]
    Provider(String),

    /// Page encryption or decryption failed (includes authentication failures)
    #[error("Codec error on page {index}: {reason}")]
    Codec { index: u64, reason: String },

    /// Persisting the logical size failed after page data was committed
    #[error("Metadata persist error: {0}")]
    MetadataPersist(String),

    /// An interrupt was observed between segments
    #[error("Operation cancelled")]
    Cancelled,

    /// Backing store I/O errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Caller-supplied ranges or buffers that cannot be honoured
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Write attempted against a file opened to view raw ciphertext
    #[error("File is read-only: {0}")]
    ReadOnly(String),
}

impl PageIoError {
    pub fn resource_exhaustion(msg: impl Into<String>) -> Self {
        Self::ResourceExhaustion(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn codec(index: u64, reason: impl Into<String>) -> Self {
        Self::Codec {
            index,
            reason: reason.into(),
        }
    }

    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::MetadataPersist(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn read_only(msg: impl Into<String>) -> Self {
        Self::ReadOnly(msg.into())
    }
}

impl From<std::io::Error> for PageIoError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// A failed read or write, together with the progress made before it failed.
///
/// `committed` counts caller bytes that were durably applied (write) or
/// copied into the caller's buffer (read). It is never the requested size
/// unless every byte actually made it.
#[derive(Debug, Error)]
#[error("{source} ({committed} bytes committed)")]
pub struct IoFailure {
    pub committed: usize,
    #[source]
    pub source: PageIoError,
}

impl IoFailure {
    pub fn new(committed: usize, source: PageIoError) -> Self {
        Self { committed, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, PageIoError::Cancelled)
    }
}

impl From<PageIoError> for IoFailure {
    fn from(source: PageIoError) -> Self {
        Self::new(0, source)
    }
}

pub type IoResult<T> = Result<T, IoFailure>;

/// A multi-page call that stopped part way.
///
/// Pages `0..completed` of the run were fully written (data and auth record)
/// before the failure and stay there. Pages after the failing one are untouched.
#[derive(Debug, Error)]
#[error("batch stopped after {completed} pages: {source}")]
pub struct BatchError {
    pub completed: usize,
    #[source]
    pub source: PageIoError,
}
