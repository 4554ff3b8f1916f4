//! Encode procedure: plaintext source to container.

use byteorder::{BigEndian, WriteBytesExt};
use rand_core::RngCore;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::algorithms::{Algorithms, CipherMode, Direction};
use crate::channel::{self, Channel};
use crate::checksum::{Accumulator, TapWriter};
use crate::compression::PayloadWriter;
use crate::directory::{self, EntryPayload, TreePlan};
use crate::engine::{SessionOptions, WorkerContext};
use crate::error::{CryptError, CryptResult};
use crate::header;
use crate::kdf;
use crate::key_manager::KeyMaterial;
use crate::metadata::{StreamMetadata, BLOCK_SIZE};
use crate::streaming::CipherWriter;
use crate::version::{FormatVersion, IvScheme, KdfScheme, KDF_ITERATIONS_DEFAULT};

type EncodeStream = TapWriter<PayloadWriter<CipherWriter<Channel>>>;

pub(crate) enum EncryptSource {
    File { channel: Channel, size: u64 },
    /// Unknown length; framed as BLOCKED records
    Stream(Channel),
    Directory(PathBuf),
}

pub(crate) struct EncryptJob {
    pub source: EncryptSource,
    pub output: Channel,
    pub filename: Option<String>,
    pub key: KeyMaterial,
    pub algorithms: Algorithms,
    pub version: FormatVersion,
    pub raw: bool,
    pub compress: bool,
    pub follow_links: bool,
    pub rng: Box<dyn RngCore + Send>,
}

/// Fits the requested options to what the chosen version can express.
pub(crate) fn negotiate(options: &mut SessionOptions, directory: bool, streamed: bool) -> CryptResult<FormatVersion> {
    if options.raw {
        if directory {
            return Err(CryptError::compatibility("raw mode cannot encode a directory hierarchy"));
        }
        options.version = FormatVersion::CURRENT;
    }

    let version = options.version;
    let caps = version.caps();

    if directory && !caps.directories {
        return Err(CryptError::compatibility(format!(
            "version {version} cannot store directory hierarchies"
        )));
    }
    if streamed && !caps.tags && !options.raw {
        return Err(CryptError::compatibility(format!(
            "version {version} needs the input size up front; streamed input is not supported"
        )));
    }
    if options.compress && !caps.compression {
        warn!(version = %version, "compression not supported by this version, disabling");
        options.compress = false;
    }
    if !caps.mode_in_header && options.mode != CipherMode::Cbc {
        warn!(version = %version, mode = %options.mode, "version only supports CBC, switching");
        options.mode = CipherMode::Cbc;
    }
    if !caps.links && !options.follow_links {
        debug!(version = %version, "version has no link entries, dereferencing links");
        options.follow_links = true;
    }
    options.kdf_iterations = match caps.kdf {
        KdfScheme::Digest => 0,
        KdfScheme::Pbkdf2Fixed(rounds) => rounds,
        KdfScheme::Pbkdf2 if options.kdf_iterations == 0 => KDF_ITERATIONS_DEFAULT,
        KdfScheme::Pbkdf2 => options.kdf_iterations,
    };

    header::validate(version, &options.algorithms(caps.mac && !options.raw))?;
    Ok(version)
}

pub(crate) fn run(job: EncryptJob, ctx: &mut WorkerContext) -> CryptResult<()> {
    let discard_on_error = job.output.path().map(|p| p.to_path_buf());
    let result = encode(job, ctx);
    if result.is_err() {
        if let Some(path) = discard_on_error {
            debug!(path = %path.display(), "Removing incomplete container");
            channel::discard(&path);
        }
    }
    result
}

fn encode(job: EncryptJob, ctx: &mut WorkerContext) -> CryptResult<()> {
    let EncryptJob {
        source,
        mut output,
        filename,
        key,
        algorithms,
        version,
        raw,
        compress,
        follow_links,
        mut rng,
    } = job;
    let caps = version.caps();

    // Pre-scan before anything is written so progress has a total
    let (plan, metadata) = match &source {
        EncryptSource::File { size, .. } => {
            ctx.progress.set_total(*size);
            ctx.progress.begin_item(*size);
            let meta = StreamMetadata {
                size: *size,
                compressed: compress,
                filename,
                ..StreamMetadata::default()
            };
            (None, meta)
        }
        EncryptSource::Stream(_) => {
            let meta = StreamMetadata {
                blocked: Some(BLOCK_SIZE),
                compressed: compress,
                ..StreamMetadata::default()
            };
            (None, meta)
        }
        EncryptSource::Directory(root) => {
            let plan = directory::scan(root, follow_links, caps.links, &ctx.cancel)?;
            ctx.progress.set_total(plan.total_bytes);
            let meta = StreamMetadata {
                size: plan.entries.len() as u64,
                compressed: compress,
                directory: true,
                ..StreamMetadata::default()
            };
            (Some(plan), meta)
        }
    };
    if let Some(plan) = &plan {
        for warning in &plan.warnings {
            ctx.warn(warning.clone());
        }
    }

    if !raw {
        header::write_preamble(&mut output, version, &algorithms)?;
    }

    let block_size = algorithms.cipher.block_size();
    let iv = if raw || caps.iv == IvScheme::Random {
        let mut iv = Zeroizing::new(vec![0u8; block_size]);
        rng.fill_bytes(&mut iv);
        output.write_all(&iv)?;
        iv
    } else {
        kdf::derive_iv(key.as_bytes(), &algorithms)
    };
    let scheme = if raw { FormatVersion::CURRENT.caps().kdf } else { caps.kdf };
    let stream_key = kdf::derive_key(key.as_bytes(), &algorithms, scheme, &iv)?;
    drop(key);

    let transform = algorithms
        .cipher
        .transform(algorithms.mode, Direction::Encrypt, &stream_key, &iv)?;
    let mac = match algorithms.mac {
        Some(mac) if !raw => Some(mac.keyed(&stream_key)?),
        _ => None,
    };
    drop(stream_key);

    let mut stream: EncodeStream = TapWriter::new(
        PayloadWriter::new(CipherWriter::new(output, transform)),
        Accumulator::new(mac),
    );

    if !raw {
        if caps.extra_random {
            header::write_filler(&mut stream, &mut *rng)?;
        }
        header::write_verification(&mut stream, &mut *rng)?;
        header::write_filler(&mut stream, &mut *rng)?;
        metadata.write_to(&mut stream, caps)?;
        if caps.extra_random {
            header::write_filler(&mut stream, &mut *rng)?;
        }
    }

    if compress {
        stream.get_mut().start_compression();
    }
    if caps.checksum && !raw {
        stream.accumulator().start_checksum(algorithms.hash);
    }

    match source {
        // Raw streams carry no size, so even files are framed
        EncryptSource::File { mut channel, .. } if raw => copy_blocked(&mut channel, &mut stream, ctx)?,
        EncryptSource::File { mut channel, size } => copy_sized(&mut channel, &mut stream, size, ctx)?,
        EncryptSource::Stream(mut channel) => copy_blocked(&mut channel, &mut stream, ctx)?,
        EncryptSource::Directory(_) => {
            if let Some(plan) = plan {
                write_tree(plan, &mut stream, ctx)?;
            }
        }
    }

    if caps.checksum && !raw {
        if let Some(digest) = stream.accumulator().take_checksum() {
            stream.write_all(&digest)?;
        }
        header::write_filler(&mut stream, &mut *rng)?;
    }
    if let Some(tag) = stream.accumulator().take_mac() {
        stream.write_all(&tag)?;
    }

    let cipher = stream.into_inner().finish().map_err(compression_error)?;
    let output = cipher.finish(&mut *rng)?;
    output.close()?;

    info!(version = %version, compressed = compress, "Encryption complete");
    Ok(())
}

fn compression_error(err: io::Error) -> CryptError {
    if err.kind() == io::ErrorKind::InvalidData {
        CryptError::compression(err.to_string())
    } else {
        CryptError::Io(err)
    }
}

/// Copies exactly `size` bytes, checking for cancellation per block.
fn copy_sized<R: Read, W: Write>(reader: &mut R, writer: &mut W, size: u64, ctx: &mut WorkerContext) -> CryptResult<()> {
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    let mut remaining = size;
    while remaining > 0 {
        ctx.checkpoint()?;
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(CryptError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("input shrank while encrypting; {remaining} bytes missing"),
            )));
        }
        writer.write_all(&buf[..n])?;
        remaining -= n as u64;
        ctx.progress.advance(n as u64);
    }
    Ok(())
}

/// Fills `buf` unless the input ends first; returns the bytes read.
fn read_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(got)
}

/// BLOCKED framing: `1, block` records ended by `0, u64 n, n bytes`.
fn copy_blocked<R: Read, W: Write>(reader: &mut R, writer: &mut W, ctx: &mut WorkerContext) -> CryptResult<()> {
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    loop {
        ctx.checkpoint()?;
        let n = read_block(reader, &mut buf)?;
        if n == buf.len() {
            writer.write_u8(1)?;
            writer.write_all(&buf)?;
            ctx.progress.advance(n as u64);
            continue;
        }
        writer.write_u8(0)?;
        writer.write_u64::<BigEndian>(n as u64)?;
        writer.write_all(&buf[..n])?;
        ctx.progress.advance(n as u64);
        return Ok(());
    }
}

fn write_tree<W: Write>(plan: TreePlan, writer: &mut W, ctx: &mut WorkerContext) -> CryptResult<()> {
    for planned in plan.entries {
        ctx.checkpoint()?;
        let entry = planned.entry;
        match entry.payload {
            EntryPayload::Regular { size } => {
                let mut file = File::open(&planned.source)?;
                // The file may have changed since the scan
                let now = file.metadata()?.len();
                if now != size {
                    return Err(CryptError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        format!("{} changed size during encryption", planned.source.display()),
                    )));
                }
                entry.write_header(writer)?;
                ctx.progress.begin_item(size);
                copy_sized(&mut file, writer, size, ctx)?;
            }
            _ => {
                entry.write_header(writer)?;
            }
        }
        debug!(path = %entry.path, "Stored entry");
    }
    Ok(())
}
