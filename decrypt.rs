//! Decode procedure: container to plaintext file, stream or directory tree.
//!
//! The header, IV, key and verification triple are all processed before the
//! output is touched, so a wrong password or a foreign file never creates or
//! truncates anything.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::algorithms::{Algorithms, Direction};
use crate::channel::{self, Channel};
use crate::checksum::{Accumulator, TapReader};
use crate::compression::PayloadReader;
use crate::directory::{DirectoryEntry, EntryPayload, TreeBuilder};
use crate::engine::WorkerContext;
use crate::error::{CryptError, CryptResult, Warning};
use crate::header::{self, ContainerInfo};
use crate::kdf;
use crate::key_manager::KeyMaterial;
use crate::metadata::{StreamMetadata, BLOCK_SIZE};
use crate::streaming::CipherReader;
use crate::version::{FormatVersion, IvScheme};

type DecodeStream = TapReader<PayloadReader<CipherReader<Channel>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutputTarget {
    Path(PathBuf),
    Stdout,
}

pub(crate) struct DecryptJob {
    pub source: Channel,
    pub output: OutputTarget,
    pub key: KeyMaterial,
    /// Algorithms of a raw stream; None means read them from the header
    pub raw: Option<Algorithms>,
    /// Whether a raw stream is compressed
    pub compress: bool,
}

/// Maps read errors inside the container onto the taxonomy.
fn read_error(err: io::Error) -> CryptError {
    match err.kind() {
        io::ErrorKind::InvalidData => CryptError::compression(err.to_string()),
        io::ErrorKind::UnexpectedEof => CryptError::format(format!("container truncated: {err}")),
        _ => CryptError::Io(err),
    }
}

pub(crate) fn run(job: DecryptJob, ctx: &mut WorkerContext, info: &OnceLock<ContainerInfo>) -> CryptResult<()> {
    let DecryptJob {
        mut source,
        output,
        key,
        raw,
        compress,
    } = job;

    let (version, algorithms) = match raw {
        Some(algorithms) => (FormatVersion::CURRENT, algorithms),
        None => {
            let parsed = header::read_preamble(&mut source)?;
            (parsed.version, parsed.algorithms)
        }
    };
    let _ = info.set(ContainerInfo { version, algorithms });
    let caps = version.caps();
    let raw = raw.is_some();

    let iv = if raw || caps.iv == IvScheme::Random {
        let mut iv = Zeroizing::new(vec![0u8; algorithms.cipher.block_size()]);
        source
            .read_exact(&mut iv)
            .map_err(|e| CryptError::truncated(e, "IV"))?;
        iv
    } else {
        kdf::derive_iv(key.as_bytes(), &algorithms)
    };
    let scheme = if raw { FormatVersion::CURRENT.caps().kdf } else { caps.kdf };
    let stream_key = kdf::derive_key(key.as_bytes(), &algorithms, scheme, &iv)?;
    drop(key);

    let transform = algorithms
        .cipher
        .transform(algorithms.mode, Direction::Decrypt, &stream_key, &iv)?;
    let mac = match algorithms.mac {
        Some(mac) if !raw => Some(mac.keyed(&stream_key)?),
        _ => None,
    };
    drop(stream_key);

    let mut stream: DecodeStream = TapReader::new(
        PayloadReader::new(CipherReader::new(source, transform)),
        Accumulator::new(mac),
    );

    let metadata = if raw {
        StreamMetadata {
            blocked: Some(BLOCK_SIZE),
            compressed: compress,
            ..StreamMetadata::default()
        }
    } else {
        if caps.extra_random {
            header::skip_filler(&mut stream).map_err(|_| CryptError::Decryption)?;
        }
        header::check_verification(&mut stream)?;
        header::skip_filler(&mut stream).map_err(read_error)?;
        let metadata = StreamMetadata::read_from(&mut stream, caps)?;
        if caps.extra_random {
            header::skip_filler(&mut stream).map_err(read_error)?;
        }
        metadata
    };
    debug!(?metadata, "Read stream tags");

    if metadata.directory && !caps.directories {
        return Err(CryptError::format(format!("version {version} cannot hold a directory")));
    }
    if metadata.compressed {
        stream.get_mut().start_decompression();
    }
    if caps.checksum && !raw {
        stream.accumulator().start_checksum(algorithms.hash);
    }

    if metadata.directory {
        let root = match output {
            OutputTarget::Path(path) => path,
            OutputTarget::Stdout => {
                return Err(CryptError::output_mismatch("a directory cannot be written to stdout"));
            }
        };
        read_tree(&mut stream, TreeBuilder::new(&root)?, metadata.size, ctx)?;
    } else {
        let mut sink = open_file_output(output, metadata.filename.as_deref())?;
        let written = match metadata.blocked {
            Some(block) => copy_blocked(&mut stream, &mut sink, block, ctx),
            None => {
                ctx.progress.set_total(metadata.size);
                ctx.progress.begin_item(metadata.size);
                copy_sized(&mut stream, &mut sink, metadata.size, ctx)
            }
        };
        if let Err(err) = written.and_then(|_| sink.sync().map_err(CryptError::Io)) {
            if let Some(path) = sink.path() {
                debug!(path = %path.display(), "Removing incomplete output");
                channel::discard(path);
            }
            return Err(err);
        }
    }

    if caps.checksum && !raw {
        let computed = stream.accumulator().take_checksum().unwrap_or_default();
        let mut stored = vec![0u8; algorithms.hash.output_len()];
        stream.read_exact(&mut stored).map_err(read_error)?;
        if computed != stored {
            warn!(hash = %algorithms.hash, "Checksum mismatch");
            ctx.warn(Warning::Checksum);
        }
        header::skip_filler(&mut stream).map_err(read_error)?;
    }
    if let Some(computed) = stream.accumulator().take_mac() {
        let mut stored = vec![0u8; computed.len()];
        stream.read_exact(&mut stored).map_err(read_error)?;
        if computed != stored {
            warn!("MAC mismatch");
            ctx.warn(Warning::Checksum);
        }
    }

    info!(version = %version, directory = metadata.directory, "Decryption complete");
    Ok(())
}

/// Picks the output channel; an existing directory receives the stored
/// file name.
fn open_file_output(output: OutputTarget, filename: Option<&str>) -> CryptResult<Channel> {
    match output {
        OutputTarget::Stdout => Ok(Channel::stdout()),
        OutputTarget::Path(path) if path.is_dir() => match filename {
            Some(name) => Ok(Channel::create(path.join(name))?),
            None => Err(CryptError::output_mismatch(format!(
                "{} is a directory but the container holds a single file",
                path.display()
            ))),
        },
        OutputTarget::Path(path) => Ok(Channel::create(&path)?),
    }
}

fn copy_sized<R: Read, W: Write>(reader: &mut R, writer: &mut W, size: u64, ctx: &mut WorkerContext) -> CryptResult<()> {
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    let mut remaining = size;
    while remaining > 0 {
        ctx.checkpoint()?;
        let want = remaining.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..want]).map_err(read_error)?;
        writer.write_all(&buf[..want])?;
        remaining -= want as u64;
        ctx.progress.advance(want as u64);
    }
    Ok(())
}

fn copy_blocked<R: Read, W: Write>(reader: &mut R, writer: &mut W, block: u64, ctx: &mut WorkerContext) -> CryptResult<()> {
    if block > 1 << 24 {
        return Err(CryptError::format(format!("BLOCKED record size {block} is too large")));
    }
    let mut buf = vec![0u8; block as usize];
    loop {
        ctx.checkpoint()?;
        match reader.read_u8().map_err(read_error)? {
            1 => {
                reader.read_exact(&mut buf).map_err(read_error)?;
                writer.write_all(&buf)?;
                ctx.progress.advance(block);
            }
            0 => {
                let n = reader.read_u64::<BigEndian>().map_err(read_error)?;
                if n > block {
                    return Err(CryptError::format(format!("final record of {n} bytes exceeds {block}")));
                }
                reader.read_exact(&mut buf[..n as usize]).map_err(read_error)?;
                writer.write_all(&buf[..n as usize])?;
                ctx.progress.advance(n);
                return Ok(());
            }
            other => {
                return Err(CryptError::format(format!("invalid BLOCKED record marker {other}")));
            }
        }
    }
}

fn read_tree<R: Read>(reader: &mut R, mut builder: TreeBuilder, count: u64, ctx: &mut WorkerContext) -> CryptResult<()> {
    ctx.progress.set_total(count);
    for _ in 0..count {
        ctx.checkpoint()?;
        let entry = DirectoryEntry::read_header(reader)?;
        match &entry.payload {
            EntryPayload::Directory => builder.directory(&entry.path)?,
            EntryPayload::Regular { size } => {
                let mut file = builder.create_file(&entry.path)?;
                ctx.progress.begin_item(*size);
                copy_entry(reader, &mut file, *size, ctx)?;
                file.sync_all()?;
            }
            EntryPayload::Symlink { target } => {
                if let Some(warning) = builder.symlink(&entry.path, target)? {
                    ctx.warn(warning);
                }
            }
            EntryPayload::Hardlink { target } => builder.hardlink(&entry.path, target)?,
        }
        ctx.progress.advance_total(1);
        debug!(path = %entry.path, kind = ?entry.kind(), "Restored entry");
    }
    Ok(())
}

/// Like `copy_sized`, but only the item counter moves; total counts entries.
fn copy_entry<R: Read, W: Write>(reader: &mut R, writer: &mut W, size: u64, ctx: &mut WorkerContext) -> CryptResult<()> {
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    let mut remaining = size;
    while remaining > 0 {
        ctx.checkpoint()?;
        let want = remaining.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..want]).map_err(read_error)?;
        writer.write_all(&buf[..want])?;
        remaining -= want as u64;
        ctx.progress.advance_item(want as u64);
    }
    Ok(())
}
