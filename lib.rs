//! # pagecrypt - Page-Granular Encrypted File I/O
//!
//! pagecrypt maps arbitrary byte-range reads and writes on a plaintext file
//! onto fixed-size cache pages, encrypting each page with XChaCha20-Poly1305
//! on its way to the backing store.
//!
//! ## Features
//!
//! - **Random access**: unaligned reads and writes, partial-page updates
//! - **Hole extension**: writes past end-of-file zero-fill the gap, so stale
//!   store bytes never surface as plaintext
//! - **Two dispatch strategies**: encrypt page by page, or batch a whole call
//!   into one codec round trip
//! - **Length-preserving ciphertext**: nonce and tag live in a per-page sidecar
//! - **View-as-encrypted**: read an encrypted file's raw ciphertext
//!
//! ## Quick Start
//!
//! ```no_run
//! use pagecrypt::{config::Config, key_manager::KeyManager, storagefile_ops::SecurePageOps};
//! use pagecrypt::CryptMode;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = Config::new("./page.key", "./storage");
//!     let km = KeyManager::new(&cfg).await?;
//!     let ops = SecurePageOps::from_config(km, &cfg);
//!
//!     let file = ops.create("notes.txt", CryptMode::Encrypted)?;
//!     ops.write_at(&file, 10_000, b"sensitive data")?;
//!
//!     let mut out = [0u8; 14];
//!     ops.read_at(&file, 10_000, &mut out)?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod file;
pub mod key_manager;
pub mod metadata;
pub mod page;
pub mod page_io;
pub mod segment;
pub mod storagefile_ops;
pub mod store;

// Re-export common types for convenience
pub use dispatch::Dispatch;
pub use error::{IoFailure, IoResult, PageIoError};
pub use file::{CryptMode, LogicalFile};
pub use page_io::{CallOptions, Interrupt, PageIo};
