use std::fmt;
use thiserror::Error;

/// Which algorithm identifier failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    Cipher,
    Hash,
    Mode,
    Mac,
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cipher => "cipher",
            Self::Hash => "hash",
            Self::Mode => "cipher mode",
            Self::Mac => "MAC",
        };
        f.write_str(name)
    }
}

/// Errors that terminate an encode/decode operation.
#[derive(Debug, Error)]
pub enum CryptError {
    /// Bad magic, malformed header or structurally invalid stream
    #[error("Format error: {0}")]
    Format(String),

    /// Version magic does not map to any known container version
    #[error("Format error: unknown version {0:#018x}")]
    UnknownVersion(u64),

    /// Tag id not known to this implementation
    #[error("Format error: unknown stream tag {0}")]
    UnknownTag(u8),

    /// Unsupported or invalid algorithm identifier
    #[error("Algorithm error: unsupported {kind} '{name}'")]
    Algorithm { kind: AlgorithmKind, name: String },

    /// Channel I/O failure; output may be left truncated
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Derived key failed the verification block (likely wrong password)
    #[error("Decryption error: verification failed, likely wrong password or key")]
    Decryption,

    /// Requested features are not expressible in the chosen version
    #[error("Compatibility error: {0}")]
    Compatibility(String),

    /// Tried to write a directory into a file or vice-versa
    #[error("Output mismatch: {0}")]
    OutputMismatch(String),

    /// Key material or derivation errors
    #[error("Key error: {0}")]
    Key(String),

    /// Compressor/decompressor failures
    #[error("Compression error: {0}")]
    Compression(String),

    /// Session used out of order
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Cooperative abort requested by the caller
    #[error("Cancelled by user")]
    Cancelled,
}

impl CryptError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn algorithm(kind: AlgorithmKind, name: impl Into<String>) -> Self {
        Self::Algorithm {
            kind,
            name: name.into(),
        }
    }

    pub fn compatibility(msg: impl Into<String>) -> Self {
        Self::Compatibility(msg.into())
    }

    pub fn output_mismatch(msg: impl Into<String>) -> Self {
        Self::OutputMismatch(msg.into())
    }

    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    pub fn compression(msg: impl Into<String>) -> Self {
        Self::Compression(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Maps a premature end of input onto a format error; a container that
    /// stops mid-header is malformed rather than unreadable.
    pub(crate) fn truncated(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Format(format!("stream ended while reading {what}"))
        } else {
            Self::Io(err)
        }
    }
}

pub type CryptResult<T> = std::result::Result<T, CryptError>;

/// Recoverable conditions recorded while a session keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// Trailing checksum or MAC did not match the decoded data
    Checksum,
    /// A filesystem entry could not be stored or restored and was skipped
    Link(String),
}
