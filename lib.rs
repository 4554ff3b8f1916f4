//! # xcrypt - Versioned Encrypted Containers
//!
//! xcrypt turns a file, a stream or a whole directory tree into a single
//! encrypted, optionally compressed container, and back. Containers written
//! by every historical format version can still be read; new containers can
//! be written in any of them for compatibility.
//!
//! ## Features
//!
//! - **Algorithm choice**: AES, Twofish, Serpent, Camellia, Blowfish, CAST5
//!   in CBC, CFB, OFB or CTR mode, with SHA-1/SHA-2/SHA-3 digests
//! - **Integrity**: verification block for wrong-key detection, trailing
//!   payload checksum and HMAC over the encrypted section
//! - **Directories**: files, directories, symlinks and hardlinks in one stream
//! - **Compression**: optional zlib stage inside the encryption
//! - **Background execution**: cancellable worker with live progress
//!
//! ## Quick Start
//!
//! ```no_run
//! use xcrypt::engine::{CryptoSession, Output, SessionOptions, Source, Status};
//! use xcrypt::key_manager::KeyMaterial;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let key = KeyMaterial::from_password("correct horse battery staple")?;
//!     let mut session = CryptoSession::encrypt(
//!         Source::Path("notes.txt".into()),
//!         Output::Path("notes.txt.x".into()),
//!         key,
//!         SessionOptions::default(),
//!     )?;
//!
//!     session.execute()?;
//!     let status = session.join().await;
//!     assert_eq!(status, Status::Success);
//!     Ok(())
//! }
//! ```
//!
//! ## Container Versions
//!
//! See [`version::FormatVersion`]; each version's capabilities (tags,
//! compression, directories, MAC, key derivation) live in one table.

pub mod algorithms;
pub mod channel;
pub mod checksum;
pub mod compression;
pub mod config;
mod decrypt;
pub mod directory;
mod encrypt;
pub mod engine;
pub mod error;
pub mod header;
pub mod kdf;
pub mod key_manager;
pub mod metadata;
pub mod streaming;
pub mod version;

// Re-export common types for convenience
pub use engine::{CryptoSession, Output, SessionOptions, Source, Status};
pub use error::CryptError;
pub use version::FormatVersion;
