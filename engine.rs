//! Execution engine: one session, one background worker.
//!
//! A [`CryptoSession`] is created by [`CryptoSession::encrypt`] or
//! [`CryptoSession::decrypt`], which validate everything that can be checked
//! up front. [`CryptoSession::execute`] hands the channels and key material
//! to a blocking worker; the caller then polls [`CryptoSession::status`] and
//! the progress counters, may [`CryptoSession::cancel`], and finally awaits
//! [`CryptoSession::join`].
//!
//! ## Status
//!
//! ```text
//! Init -> Running -> Success | Cancelled | Failed* | Warning*
//! ```
//!
//! Transitions only move forward and a terminal status never changes.

use rand_core::OsRng;
#[cfg(test)]
use rand_core::RngCore;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::algorithms::{Algorithms, CipherAlgorithm, CipherMode, HashAlgorithm, MacAlgorithm};
use crate::channel::Channel;
use crate::decrypt::{self, DecryptJob, OutputTarget};
use crate::encrypt::{self, EncryptJob, EncryptSource};
use crate::error::{AlgorithmKind, CryptError, CryptResult, Warning};
use crate::header::ContainerInfo;
use crate::key_manager::KeyMaterial;
use crate::version::{FormatVersion, KDF_ITERATIONS_DEFAULT};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Init,
    Running,
    Success,
    Cancelled,
    FailedInit,
    FailedUnknownVersion,
    FailedUnknownCipher,
    FailedUnknownHash,
    FailedUnknownMode,
    FailedUnknownMac,
    FailedUnknownTag,
    FailedFormat,
    FailedDecryption,
    FailedIo,
    FailedKey,
    FailedOutputMismatch,
    FailedCompatibility,
    FailedCompression,
    FailedOther,
    WarningChecksum,
    WarningLink,
}

impl Status {
    const ALL: [Status; 21] = [
        Self::Init,
        Self::Running,
        Self::Success,
        Self::Cancelled,
        Self::FailedInit,
        Self::FailedUnknownVersion,
        Self::FailedUnknownCipher,
        Self::FailedUnknownHash,
        Self::FailedUnknownMode,
        Self::FailedUnknownMac,
        Self::FailedUnknownTag,
        Self::FailedFormat,
        Self::FailedDecryption,
        Self::FailedIo,
        Self::FailedKey,
        Self::FailedOutputMismatch,
        Self::FailedCompatibility,
        Self::FailedCompression,
        Self::FailedOther,
        Self::WarningChecksum,
        Self::WarningLink,
    ];

    fn from_u8(raw: u8) -> Self {
        Self::ALL.get(raw as usize).copied().unwrap_or(Self::FailedOther)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Init | Self::Running)
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && !self.is_warning() && self != Self::Success
    }

    pub fn is_warning(self) -> bool {
        matches!(self, Self::WarningChecksum | Self::WarningLink)
    }

    fn can_advance_to(self, next: Status) -> bool {
        match self {
            Self::Init => matches!(next, Self::Running | Self::FailedInit),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Init => "Ready",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Cancelled => "Cancelled by user",
            Self::FailedInit => "Initialisation failed",
            Self::FailedUnknownVersion => "Unknown or unsupported container version",
            Self::FailedUnknownCipher => "Unsupported cipher algorithm",
            Self::FailedUnknownHash => "Unsupported hash algorithm",
            Self::FailedUnknownMode => "Unsupported cipher mode",
            Self::FailedUnknownMac => "Unsupported MAC algorithm",
            Self::FailedUnknownTag => "Unknown stream tag",
            Self::FailedFormat => "Invalid or corrupt container",
            Self::FailedDecryption => "Decryption failed; wrong password or key",
            Self::FailedIo => "Read/write error",
            Self::FailedKey => "Key error",
            Self::FailedOutputMismatch => "Output type does not match the container (file vs directory)",
            Self::FailedCompatibility => "Requested features are not available in the chosen container version",
            Self::FailedCompression => "Compression error",
            Self::FailedOther => "Unknown error",
            Self::WarningChecksum => "Checksum mismatch; output may be corrupt",
            Self::WarningLink => "Some filesystem entries were not stored or restored",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<&CryptError> for Status {
    fn from(err: &CryptError) -> Self {
        match err {
            CryptError::Format(_) => Self::FailedFormat,
            CryptError::UnknownVersion(_) => Self::FailedUnknownVersion,
            CryptError::UnknownTag(_) => Self::FailedUnknownTag,
            CryptError::Algorithm { kind, .. } => match kind {
                AlgorithmKind::Cipher => Self::FailedUnknownCipher,
                AlgorithmKind::Hash => Self::FailedUnknownHash,
                AlgorithmKind::Mode => Self::FailedUnknownMode,
                AlgorithmKind::Mac => Self::FailedUnknownMac,
            },
            CryptError::Io(_) => Self::FailedIo,
            CryptError::Decryption => Self::FailedDecryption,
            CryptError::Compatibility(_) => Self::FailedCompatibility,
            CryptError::OutputMismatch(_) => Self::FailedOutputMismatch,
            CryptError::Key(_) => Self::FailedKey,
            CryptError::Compression(_) => Self::FailedCompression,
            CryptError::InvalidState(_) => Self::FailedOther,
            CryptError::Cancelled => Self::Cancelled,
        }
    }
}

/// Atomic status cell; refuses backward and post-terminal transitions.
#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new() -> Self {
        Self(AtomicU8::new(Status::Init as u8))
    }

    fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    fn advance(&self, next: Status) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !Status::from_u8(current).can_advance_to(next) {
                return false;
            }
            match self
                .0
                .compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub offset: u64,
    pub size: u64,
}

impl Progress {
    fn grow(&mut self, n: u64) {
        self.offset += n;
        if self.offset > self.size {
            self.size = self.offset;
        }
    }
}

/// Consistent snapshot of both progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressReport {
    /// Current item: the file, or the file inside a directory tree
    pub current: Progress,
    /// Whole operation: bytes, or entries when decoding a directory
    pub total: Progress,
}

/// Worker side of the progress channel.
pub(crate) struct ProgressReporter {
    tx: watch::Sender<ProgressReport>,
}

impl ProgressReporter {
    pub fn begin_item(&self, size: u64) {
        self.tx.send_modify(|r| r.current = Progress { offset: 0, size });
    }

    pub fn set_total(&self, size: u64) {
        self.tx.send_modify(|r| r.total.size = size.max(r.total.offset));
    }

    pub fn advance_item(&self, n: u64) {
        self.tx.send_modify(|r| r.current.grow(n));
    }

    pub fn advance_total(&self, n: u64) {
        self.tx.send_modify(|r| r.total.grow(n));
    }

    /// Advances both counters, for single-stream payloads.
    pub fn advance(&self, n: u64) {
        self.tx.send_modify(|r| {
            r.current.grow(n);
            r.total.grow(n);
        });
    }
}

/// State the worker carries through an encode or decode.
pub(crate) struct WorkerContext {
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
    pub warnings: Vec<Warning>,
}

impl WorkerContext {
    /// Cancellation point, checked at every block and entry.
    pub fn checkpoint(&self) -> CryptResult<()> {
        if self.cancel.is_cancelled() {
            Err(CryptError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    /// Status of a run that finished without error.
    fn outcome(&self) -> Status {
        if self.warnings.contains(&Warning::Checksum) {
            Status::WarningChecksum
        } else if !self.warnings.is_empty() {
            Status::WarningLink
        } else {
            Status::Success
        }
    }
}

/// Where an encode reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Path(PathBuf),
    Stdin,
}

/// Where an encode or decode writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Path(PathBuf),
    Stdout,
}

/// Algorithm and feature choices for a session.
///
/// On decode only `raw` sessions use the algorithm fields; otherwise they
/// come from the container header.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub cipher: CipherAlgorithm,
    pub hash: HashAlgorithm,
    pub mode: CipherMode,
    pub mac: MacAlgorithm,
    /// Zero selects the default round count
    pub kdf_iterations: u32,
    pub raw: bool,
    pub compress: bool,
    pub follow_links: bool,
    pub version: FormatVersion,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cipher: CipherAlgorithm::Aes256,
            hash: HashAlgorithm::Sha256,
            mode: CipherMode::Ctr,
            mac: MacAlgorithm(HashAlgorithm::Sha256),
            kdf_iterations: KDF_ITERATIONS_DEFAULT,
            raw: false,
            compress: true,
            follow_links: false,
            version: FormatVersion::CURRENT,
        }
    }
}

impl SessionOptions {
    pub(crate) fn algorithms(&self, with_mac: bool) -> Algorithms {
        Algorithms {
            cipher: self.cipher,
            hash: self.hash,
            mode: self.mode,
            mac: with_mac.then_some(self.mac),
            kdf_iterations: self.kdf_iterations,
        }
    }
}

/// Flags fixed when the session was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub compressed: bool,
    pub directory: bool,
    pub follow_links: bool,
    pub raw: bool,
}

pub(crate) enum Job {
    Encrypt(EncryptJob),
    Decrypt(DecryptJob),
}

pub struct CryptoSession {
    job: Option<Job>,
    status: Arc<StatusCell>,
    progress: watch::Receiver<ProgressReport>,
    reporter: Option<ProgressReporter>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    info: Arc<OnceLock<ContainerInfo>>,
    flags: SessionFlags,
}

impl fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("status", &self.status())
            .field("progress", &self.progress())
            .field("info", &self.info())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl CryptoSession {
    fn new(job: Job, info: OnceLock<ContainerInfo>, flags: SessionFlags) -> Self {
        let (tx, rx) = watch::channel(ProgressReport::default());
        Self {
            job: Some(job),
            status: Arc::new(StatusCell::new()),
            progress: rx,
            reporter: Some(ProgressReporter { tx }),
            cancel: CancellationToken::new(),
            worker: None,
            info: Arc::new(info),
            flags,
        }
    }

    /// Prepares an encode of a file, a directory tree or stdin.
    ///
    /// Version negotiation happens here, so incompatible requests fail before
    /// the output is created. An existing directory as output receives
    /// `<dir>/<source name>.x`.
    pub fn encrypt(source: Source, output: Output, key: KeyMaterial, options: SessionOptions) -> CryptResult<Self> {
        let mut options = options;
        let input = match &source {
            Source::Path(path) => Some(path.clone()),
            Source::Stdin => None,
        };
        let (source, name) = match source {
            Source::Path(path) => {
                let metadata = fs::metadata(&path)?;
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string);
                if metadata.is_dir() {
                    (EncryptSource::Directory(path), name)
                } else {
                    let size = metadata.len();
                    (EncryptSource::File { channel: Channel::open(&path)?, size }, name)
                }
            }
            Source::Stdin => (EncryptSource::Stream(Channel::stdin()), None),
        };

        let directory = matches!(source, EncryptSource::Directory(_));
        let streamed = matches!(source, EncryptSource::Stream(_));
        let version = encrypt::negotiate(&mut options, directory, streamed)?;
        let caps = version.caps();
        let algorithms = options.algorithms(caps.mac && !options.raw);

        let output = match output {
            Output::Path(path) => {
                let path = if path.is_dir() {
                    path.join(format!("{}.x", name.as_deref().unwrap_or("stdin")))
                } else {
                    path
                };
                if let Some(input) = &input {
                    refuse_same_file(input, &path)?;
                }
                Channel::create(&path)?
            }
            Output::Stdout => Channel::stdout(),
        };

        info!(
            output = %output.describe(),
            version = %version,
            cipher = %algorithms.cipher,
            hash = %algorithms.hash,
            mode = %algorithms.mode,
            compressed = options.compress,
            directory,
            raw = options.raw,
            "Prepared encryption session"
        );

        let flags = SessionFlags {
            compressed: options.compress,
            directory,
            follow_links: options.follow_links,
            raw: options.raw,
        };
        let job = EncryptJob {
            source,
            output,
            filename: name,
            key,
            algorithms,
            version,
            raw: options.raw,
            compress: options.compress,
            follow_links: options.follow_links,
            rng: Box::new(OsRng),
        };
        let info = OnceLock::new();
        let _ = info.set(ContainerInfo { version, algorithms });
        Ok(Self::new(Job::Encrypt(job), info, flags))
    }

    /// Prepares a decode. The header is read by the worker; `output` is only
    /// created once the key has been verified.
    pub fn decrypt(source: Source, output: Output, key: KeyMaterial, options: SessionOptions) -> CryptResult<Self> {
        let source = match source {
            Source::Path(path) => Channel::open(&path)?,
            Source::Stdin => Channel::stdin(),
        };
        let output = match output {
            Output::Path(path) => OutputTarget::Path(path),
            Output::Stdout => OutputTarget::Stdout,
        };

        let mut raw_algorithms = None;
        if options.raw {
            let mut algorithms = options.algorithms(false);
            if algorithms.kdf_iterations == 0 {
                algorithms.kdf_iterations = KDF_ITERATIONS_DEFAULT;
            }
            crate::header::validate(FormatVersion::CURRENT, &algorithms)?;
            raw_algorithms = Some(algorithms);
        }

        info!(source = %source.describe(), raw = options.raw, "Prepared decryption session");

        let flags = SessionFlags {
            compressed: options.raw && options.compress,
            raw: options.raw,
            ..SessionFlags::default()
        };
        let job = DecryptJob {
            source,
            output,
            key,
            raw: raw_algorithms,
            compress: options.compress,
        };
        Ok(Self::new(Job::Decrypt(job), OnceLock::new(), flags))
    }

    /// Starts the worker. Must be called from within a Tokio runtime.
    pub fn execute(&mut self) -> CryptResult<()> {
        let (job, reporter) = match (self.job.take(), self.reporter.take()) {
            (Some(job), Some(reporter)) => (job, reporter),
            _ => return Err(CryptError::invalid_state("session already executed")),
        };
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                self.status.advance(Status::FailedInit);
                return Err(CryptError::invalid_state(format!("no async runtime: {err}")));
            }
        };

        self.status.advance(Status::Running);
        let status = Arc::clone(&self.status);
        let info = Arc::clone(&self.info);
        let mut ctx = WorkerContext {
            cancel: self.cancel.clone(),
            progress: reporter,
            warnings: Vec::new(),
        };

        self.worker = Some(handle.spawn_blocking(move || {
            let result = match job {
                Job::Encrypt(job) => encrypt::run(job, &mut ctx),
                Job::Decrypt(job) => decrypt::run(job, &mut ctx, &info),
            };
            let terminal = match result {
                Ok(()) => ctx.outcome(),
                Err(CryptError::Cancelled) => {
                    info!("Operation cancelled");
                    Status::Cancelled
                }
                Err(err) => {
                    error!(error = %err, "Operation failed");
                    Status::from(&err)
                }
            };
            if terminal.is_warning() {
                warn!(warnings = ?ctx.warnings, "Operation finished with warnings");
            }
            status.advance(terminal);
        }));
        debug!("Worker started");
        Ok(())
    }

    /// Waits for the worker and returns the terminal status.
    ///
    /// A session that was never executed reports its current status.
    pub async fn join(&mut self) -> Status {
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                error!(error = %err, "Worker panicked");
                self.status.advance(Status::FailedOther);
            }
        }
        self.status()
    }

    /// True once the worker has stopped, whether or not it set a status.
    /// A session that was never executed has no worker and reports true.
    pub fn worker_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Requests cooperative cancellation at the next block or entry.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> Status {
        self.status.load()
    }

    pub fn status_message(&self) -> &'static str {
        self.status().message()
    }

    pub fn current(&self) -> Progress {
        self.progress.borrow().current
    }

    pub fn total(&self) -> Progress {
        self.progress.borrow().total
    }

    pub fn progress(&self) -> ProgressReport {
        *self.progress.borrow()
    }

    /// Receiver for awaiting progress changes instead of polling.
    pub fn subscribe(&self) -> watch::Receiver<ProgressReport> {
        self.progress.clone()
    }

    /// Header of the container, once known; decode learns it from the worker.
    pub fn info(&self) -> Option<&ContainerInfo> {
        self.info.get()
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Releases the session. A still-running worker is asked to stop; key
    /// material is wiped as soon as the worker drops it.
    pub fn deinit(self) {
        debug!(status = %self.status(), "Releasing session");
        drop(self);
    }

    #[cfg(test)]
    pub(crate) fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        if let Some(Job::Encrypt(job)) = self.job.as_mut() {
            job.rng = rng;
        }
        self
    }

    /// Feeds a file source through the unknown-length path.
    #[cfg(test)]
    pub(crate) fn streamed(mut self) -> Self {
        self.job = match self.job.take() {
            Some(Job::Encrypt(mut job)) => {
                if let EncryptSource::File { channel, .. } = job.source {
                    job.source = EncryptSource::Stream(channel);
                    job.filename = None;
                }
                Some(Job::Encrypt(job))
            }
            other => other,
        };
        self
    }
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let (a, b) = (fs::metadata(a)?, fs::metadata(b)?);
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    Ok(fs::canonicalize(a)? == fs::canonicalize(b)?)
}

/// Creating the output truncates it, so it must not be the input.
fn refuse_same_file(input: &Path, output: &Path) -> CryptResult<()> {
    if output.exists() && same_file(input, output)? {
        return Err(CryptError::output_mismatch(format!(
            "output {} is the same file as the input",
            output.display()
        )));
    }
    Ok(())
}

impl Drop for CryptoSession {
    fn drop(&mut self) {
        if self.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Deterministic RNG so container offsets are predictable.
    struct ZeroRng;

    impl RngCore for ZeroRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            dest.fill(0);
            Ok(())
        }
    }

    #[test]
    fn test_status_transitions_are_forward_only() {
        let cell = StatusCell::new();
        assert!(!cell.advance(Status::Cancelled), "cancel before running");
        assert!(cell.advance(Status::Running));
        assert!(!cell.advance(Status::Init));
        assert!(cell.advance(Status::WarningLink));
        assert!(!cell.advance(Status::Success));
        assert!(!cell.advance(Status::Running));
        assert_eq!(cell.load(), Status::WarningLink);
    }

    #[test]
    fn test_status_codes_round_trip() {
        for status in Status::ALL {
            assert_eq!(Status::from_u8(status as u8), status);
            assert!(!status.message().is_empty());
        }
        assert!(Status::Cancelled.is_failure());
        assert!(!Status::WarningChecksum.is_failure());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn test_progress_never_exceeds_size() {
        let (tx, rx) = watch::channel(ProgressReport::default());
        let reporter = ProgressReporter { tx };
        reporter.set_total(10);
        reporter.begin_item(4);
        reporter.advance(3);
        reporter.advance(3);
        let report = *rx.borrow();
        assert_eq!(report.current, Progress { offset: 6, size: 6 });
        assert_eq!(report.total, Progress { offset: 6, size: 10 });

        // Shrinking the total below the offset is refused
        reporter.set_total(2);
        assert_eq!(rx.borrow().total, Progress { offset: 6, size: 6 });
    }

    #[test]
    fn test_checksum_warning_takes_precedence() {
        let (tx, _rx) = watch::channel(ProgressReport::default());
        let mut ctx = WorkerContext {
            cancel: CancellationToken::new(),
            progress: ProgressReporter { tx },
            warnings: Vec::new(),
        };
        assert_eq!(ctx.outcome(), Status::Success);
        ctx.warn(Warning::Link("a".into()));
        assert_eq!(ctx.outcome(), Status::WarningLink);
        ctx.warn(Warning::Checksum);
        assert_eq!(ctx.outcome(), Status::WarningChecksum);
    }

    #[tokio::test]
    async fn test_execute_twice_is_refused() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, b"twice").unwrap();
        let options = SessionOptions {
            kdf_iterations: 1000,
            ..SessionOptions::default()
        };
        let mut session = CryptoSession::encrypt(
            Source::Path(input),
            Output::Path(dir.path().join("out.x")),
            KeyMaterial::from_password("pw").unwrap(),
            options,
        )
        .unwrap();
        assert_eq!(session.status(), Status::Init);
        session.execute().unwrap();
        assert!(matches!(session.execute(), Err(CryptError::InvalidState(_))));
        assert_eq!(session.join().await, Status::Success);
    }

    #[tokio::test]
    async fn test_flipped_checksum_bit_is_a_warning() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("plain.bin");
        let payload: Vec<u8> = (0..100u8).collect();
        fs::write(&input, &payload).unwrap();
        let container = dir.path().join("plain.x");

        let options = SessionOptions {
            mode: CipherMode::Ctr,
            compress: false,
            version: FormatVersion::V2014_06,
            ..SessionOptions::default()
        };
        let mut session = CryptoSession::encrypt(
            Source::Path(input),
            Output::Path(container.clone()),
            KeyMaterial::from_password("checksum").unwrap(),
            options.clone(),
        )
        .unwrap()
        .with_rng(Box::new(ZeroRng));
        session.execute().unwrap();
        assert_eq!(session.join().await, Status::Success);

        // preamble, clear IV, fillers (1 byte each with a zero RNG),
        // verification triple, tags (count + SIZE + COMPRESSED + DIRECTORY)
        let preamble = 24 + 1 + "AES256/SHA256/CTR".len();
        let checksum_at = preamble + 16 + 1 + 24 + 1 + (1 + 11 + 4 + 4) + 1 + payload.len();
        let mut bytes = fs::read(&container).unwrap();
        bytes[checksum_at] ^= 0x01;
        fs::write(&container, &bytes).unwrap();

        let restored = dir.path().join("restored.bin");
        let mut session = CryptoSession::decrypt(
            Source::Path(container),
            Output::Path(restored.clone()),
            KeyMaterial::from_password("checksum").unwrap(),
            options,
        )
        .unwrap();
        session.execute().unwrap();
        assert_eq!(session.join().await, Status::WarningChecksum);
        assert_eq!(fs::read(&restored).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_panicked_worker_finishes_as_failed_other() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, b"boom").unwrap();
        let mut session = CryptoSession::encrypt(
            Source::Path(input),
            Output::Path(dir.path().join("out.x")),
            KeyMaterial::from_password("pw").unwrap(),
            SessionOptions::default(),
        )
        .unwrap();
        assert!(session.worker_finished());

        session.status.advance(Status::Running);
        session.worker = Some(tokio::task::spawn_blocking(|| panic!("worker died")));
        while !session.worker_finished() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(session.status(), Status::Running);
        assert_eq!(session.join().await, Status::FailedOther);
    }

    #[tokio::test]
    async fn test_streamed_input_is_blocked_and_decodes_to_stdout() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("piped.txt");
        let payload = b"streamed through BLOCKED records\n".repeat(4);
        fs::write(&input, &payload).unwrap();
        let container = dir.path().join("piped.x");
        let options = SessionOptions {
            kdf_iterations: 1000,
            ..SessionOptions::default()
        };

        let mut session = CryptoSession::encrypt(
            Source::Path(input),
            Output::Path(container.clone()),
            KeyMaterial::from_password("pipe").unwrap(),
            options.clone(),
        )
        .unwrap()
        .streamed();
        session.execute().unwrap();
        assert_eq!(session.join().await, Status::Success);

        // SIZE is zero for streamed input, so content only survives via BLOCKED records
        let restored = dir.path().join("restored.txt");
        let mut session = CryptoSession::decrypt(
            Source::Path(container.clone()),
            Output::Path(restored.clone()),
            KeyMaterial::from_password("pipe").unwrap(),
            options.clone(),
        )
        .unwrap();
        session.execute().unwrap();
        assert_eq!(session.join().await, Status::Success);
        assert_eq!(fs::read(&restored).unwrap(), payload);

        let mut session = CryptoSession::decrypt(
            Source::Path(container),
            Output::Stdout,
            KeyMaterial::from_password("pipe").unwrap(),
            options,
        )
        .unwrap();
        session.execute().unwrap();
        assert_eq!(session.join().await, Status::Success);
        assert_eq!(session.total().offset, payload.len() as u64);
    }
}
