//! Container header codec.
//!
//! ## Clear preamble
//!
//! ```text
//! [HEADER_0:u64][HEADER_1:u64][version magic:u64][algorithm section]
//!
//! Separate layout: [len:u8][cipher][len:u8][hash]
//! Joined layout:   [len:u8]["CIPHER/HASH[/MODE][/MAC][/KDF hex]"]
//! ```
//!
//! ## Encrypted prologue
//!
//! The random IV (when the version has one) follows the preamble in clear.
//! Everything after it goes through the cipher: optional random filler, the
//! verification triple `x, y, x ^ y`, another filler, then the stream tags.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand_core::RngCore;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::debug;

use crate::algorithms::{Algorithms, CipherAlgorithm, CipherMode, HashAlgorithm, MacAlgorithm};
use crate::error::{AlgorithmKind, CryptError, CryptResult};
use crate::version::{AlgorithmLayout, FormatVersion, KdfScheme};

pub const HEADER_0: u64 = 0x3697_de5d_96fc_a0fa;
pub const HEADER_1: u64 = 0xc845_c2fa_95e2_f52d;

/// What a container's clear preamble declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub version: FormatVersion,
    pub algorithms: Algorithms,
}

/// Checks that `algorithms` can be written under `version`.
pub fn validate(version: FormatVersion, algorithms: &Algorithms) -> CryptResult<()> {
    let caps = version.caps();
    if !caps.ciphers.contains(&algorithms.cipher) {
        return Err(CryptError::algorithm(AlgorithmKind::Cipher, algorithms.cipher.name()));
    }
    if !caps.hashes.contains(&algorithms.hash) {
        return Err(CryptError::algorithm(AlgorithmKind::Hash, algorithms.hash.name()));
    }
    if !caps.modes.contains(&algorithms.mode) {
        return Err(CryptError::algorithm(AlgorithmKind::Mode, algorithms.mode.name()));
    }
    if let Some(mac) = algorithms.mac {
        if !caps.mac || !caps.hashes.contains(&mac.hash()) {
            return Err(CryptError::algorithm(AlgorithmKind::Mac, mac.to_string()));
        }
    }
    Ok(())
}

fn write_short_string<W: Write>(w: &mut W, value: &str) -> CryptResult<()> {
    let len = u8::try_from(value.len())
        .map_err(|_| CryptError::compatibility(format!("'{value}' is too long for the header")))?;
    w.write_u8(len)?;
    w.write_all(value.as_bytes())?;
    Ok(())
}

fn read_short_string<R: Read>(r: &mut R) -> CryptResult<String> {
    let len = r
        .read_u8()
        .map_err(|e| CryptError::truncated(e, "algorithm section"))?;
    let mut raw = vec![0u8; len as usize];
    r.read_exact(&mut raw)
        .map_err(|e| CryptError::truncated(e, "algorithm section"))?;
    String::from_utf8(raw).map_err(|_| CryptError::format("algorithm section is not valid UTF-8"))
}

/// Writes magic, version and algorithm section.
pub fn write_preamble<W: Write>(w: &mut W, version: FormatVersion, algorithms: &Algorithms) -> CryptResult<()> {
    validate(version, algorithms)?;
    let caps = version.caps();

    w.write_u64::<BigEndian>(HEADER_0)?;
    w.write_u64::<BigEndian>(HEADER_1)?;
    w.write_u64::<BigEndian>(version.magic())?;

    match caps.layout {
        AlgorithmLayout::Separate => {
            write_short_string(w, algorithms.cipher.name())?;
            write_short_string(w, algorithms.hash.name())?;
        }
        AlgorithmLayout::Joined => {
            let mut joined = format!("{}/{}", algorithms.cipher, algorithms.hash);
            if caps.mode_in_header {
                joined.push('/');
                joined.push_str(algorithms.mode.name());
            }
            if caps.mac {
                let mac = algorithms
                    .mac
                    .ok_or_else(|| CryptError::compatibility(format!("version {version} requires a MAC")))?;
                joined.push('/');
                joined.push_str(&mac.to_string());
            }
            if caps.kdf == KdfScheme::Pbkdf2 {
                joined.push_str(&format!("/{:x}", algorithms.kdf_iterations));
            }
            write_short_string(w, &joined)?;
        }
    }
    Ok(())
}

/// Reads the format magic and maps the version magic.
fn read_version<R: Read>(r: &mut R) -> CryptResult<FormatVersion> {
    let mut words = [0u64; 2];
    for word in &mut words {
        *word = r
            .read_u64::<BigEndian>()
            .map_err(|e| CryptError::truncated(e, "format magic"))?;
    }
    if words != [HEADER_0, HEADER_1] {
        return Err(CryptError::format("not an encrypted container (bad magic)"));
    }
    let magic = r
        .read_u64::<BigEndian>()
        .map_err(|e| CryptError::truncated(e, "version"))?;
    FormatVersion::from_magic(magic)
}

fn parse_algorithms<R: Read>(r: &mut R, version: FormatVersion) -> CryptResult<Algorithms> {
    let caps = version.caps();
    let mut algorithms = Algorithms {
        cipher: CipherAlgorithm::Aes256,
        hash: HashAlgorithm::Sha256,
        mode: CipherMode::Cbc,
        mac: None,
        kdf_iterations: match caps.kdf {
            KdfScheme::Pbkdf2Fixed(rounds) => rounds,
            _ => 0,
        },
    };

    match caps.layout {
        AlgorithmLayout::Separate => {
            algorithms.cipher = read_short_string(r)?.parse()?;
            algorithms.hash = read_short_string(r)?.parse()?;
        }
        AlgorithmLayout::Joined => {
            let joined = read_short_string(r)?;
            let parts: Vec<&str> = joined.split('/').collect();
            let expected = 2
                + usize::from(caps.mode_in_header)
                + usize::from(caps.mac)
                + usize::from(caps.kdf == KdfScheme::Pbkdf2);
            if parts.len() != expected {
                return Err(CryptError::format(format!(
                    "algorithm section '{joined}' has {} fields, expected {expected}",
                    parts.len()
                )));
            }

            let mut fields = parts.into_iter();
            let mut next = || fields.next().unwrap_or_default();
            algorithms.cipher = next().parse()?;
            algorithms.hash = next().parse()?;
            if caps.mode_in_header {
                algorithms.mode = next().parse()?;
            }
            if caps.mac {
                algorithms.mac = Some(next().parse::<MacAlgorithm>()?);
            }
            if caps.kdf == KdfScheme::Pbkdf2 {
                let field = next();
                algorithms.kdf_iterations = u32::from_str_radix(field, 16)
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| CryptError::format(format!("invalid KDF iteration count '{field}'")))?;
            }
        }
    }

    validate(version, &algorithms)?;
    Ok(algorithms)
}

/// Reads and validates the whole clear preamble.
pub fn read_preamble<R: Read>(r: &mut R) -> CryptResult<ContainerInfo> {
    let version = read_version(r)?;
    let algorithms = parse_algorithms(r, version)?;
    debug!(
        version = %version,
        cipher = %algorithms.cipher,
        hash = %algorithms.hash,
        mode = %algorithms.mode,
        "Parsed container header"
    );
    Ok(ContainerInfo { version, algorithms })
}

/// Reports whether `r` starts with a container preamble this build reads.
///
/// Returns `Ok(None)` for foreign data (bad magic, unknown version or input
/// too short); an algorithm section that names unknown algorithms is still
/// an error since the data is clearly a container.
pub fn probe<R: Read>(r: &mut R) -> CryptResult<Option<ContainerInfo>> {
    let version = match read_version(r) {
        Ok(version) => version,
        Err(CryptError::Format(_)) | Err(CryptError::UnknownVersion(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let algorithms = parse_algorithms(r, version)?;
    Ok(Some(ContainerInfo { version, algorithms }))
}

pub fn is_encrypted(path: impl AsRef<Path>) -> bool {
    File::open(path.as_ref())
        .ok()
        .and_then(|mut file| probe(&mut file).ok().flatten())
        .is_some()
}

/// `u8 n` followed by `n` random bytes.
pub fn write_filler<W: Write>(w: &mut W, rng: &mut dyn RngCore) -> io::Result<()> {
    let mut len = [0u8; 1];
    rng.fill_bytes(&mut len);
    let mut filler = vec![0u8; len[0] as usize];
    rng.fill_bytes(&mut filler);
    w.write_u8(len[0])?;
    w.write_all(&filler)
}

pub fn skip_filler<R: Read>(r: &mut R) -> io::Result<()> {
    let len = r.read_u8()?;
    let mut filler = vec![0u8; len as usize];
    r.read_exact(&mut filler)
}

pub fn write_verification<W: Write>(w: &mut W, rng: &mut dyn RngCore) -> io::Result<()> {
    let x = rng.next_u64();
    let y = rng.next_u64();
    w.write_u64::<BigEndian>(x)?;
    w.write_u64::<BigEndian>(y)?;
    w.write_u64::<BigEndian>(x ^ y)
}

/// Wrong keys decrypt the triple into noise that fails `x ^ y == z`.
pub fn check_verification<R: Read>(r: &mut R) -> CryptResult<()> {
    let mut triple = [0u64; 3];
    for word in &mut triple {
        *word = r.read_u64::<BigEndian>().map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => CryptError::Decryption,
            _ => CryptError::Io(e),
        })?;
    }
    if triple[0] ^ triple[1] != triple[2] {
        return Err(CryptError::Decryption);
    }
    Ok(())
}
