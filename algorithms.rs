//! Capability providers: named block ciphers, cipher modes, digests and MACs.
//!
//! Containers refer to every primitive by name. This module maps those names
//! onto RustCrypto implementations and hides them behind small object-safe
//! traits ([`BlockTransform`], [`StreamMac`]) so the pipeline never depends
//! on a concrete cipher type.

use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, InnerIvInit, KeyInit, StreamCipher};
use digest::DynDigest;
use hmac::{Hmac, Mac};
use std::fmt;
use std::str::FromStr;

use crate::error::{AlgorithmKind, CryptError, CryptResult};

/// Whether a transform encrypts or decrypts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// A keyed cipher in a fixed mode, applied one whole block at a time.
pub trait BlockTransform: Send {
    fn block_size(&self) -> usize;

    /// Transforms `block` in place. `block.len()` must equal `block_size()`.
    fn apply(&mut self, block: &mut [u8]);
}

struct Encrypting<M>(M);

impl<M: BlockEncryptMut + Send> BlockTransform for Encrypting<M> {
    fn block_size(&self) -> usize {
        M::block_size()
    }

    fn apply(&mut self, block: &mut [u8]) {
        self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

struct Decrypting<M>(M);

impl<M: BlockDecryptMut + Send> BlockTransform for Decrypting<M> {
    fn block_size(&self) -> usize {
        M::block_size()
    }

    fn apply(&mut self, block: &mut [u8]) {
        self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Keystream modes (OFB, CTR) are their own inverse.
struct Keystream<S> {
    cipher: S,
    block: usize,
}

impl<S: StreamCipher + Send> BlockTransform for Keystream<S> {
    fn block_size(&self) -> usize {
        self.block
    }

    fn apply(&mut self, block: &mut [u8]) {
        self.cipher.apply_keystream(block);
    }
}

fn invalid_key() -> CryptError {
    CryptError::key("derived key has an invalid length for the cipher")
}

fn invalid_iv() -> CryptError {
    CryptError::key("IV has an invalid length for the cipher")
}

macro_rules! block_transform {
    ($cipher:ty, $ctr:ty, $mode:expr, $direction:expr, $key:expr, $iv:expr) => {{
        let inner = <$cipher as KeyInit>::new_from_slice($key).map_err(|_| invalid_key())?;
        let transform: Box<dyn BlockTransform> = match ($mode, $direction) {
            (CipherMode::Cbc, Direction::Encrypt) => Box::new(Encrypting(
                cbc::Encryptor::<$cipher>::inner_iv_slice_init(inner, $iv).map_err(|_| invalid_iv())?,
            )),
            (CipherMode::Cbc, Direction::Decrypt) => Box::new(Decrypting(
                cbc::Decryptor::<$cipher>::inner_iv_slice_init(inner, $iv).map_err(|_| invalid_iv())?,
            )),
            (CipherMode::Cfb, Direction::Encrypt) => Box::new(Encrypting(
                cfb_mode::Encryptor::<$cipher>::inner_iv_slice_init(inner, $iv)
                    .map_err(|_| invalid_iv())?,
            )),
            (CipherMode::Cfb, Direction::Decrypt) => Box::new(Decrypting(
                cfb_mode::Decryptor::<$cipher>::inner_iv_slice_init(inner, $iv)
                    .map_err(|_| invalid_iv())?,
            )),
            // Keystream modes are core wrappers; key the core, then wrap it
            (CipherMode::Ofb, _) => Box::new(Keystream {
                cipher: ofb::Ofb::<$cipher>::from_core(
                    ofb::OfbCore::<$cipher>::inner_iv_slice_init(inner, $iv).map_err(|_| invalid_iv())?,
                ),
                block: <$cipher as BlockSizeUser>::block_size(),
            }),
            (CipherMode::Ctr, _) => Box::new(Keystream {
                cipher: <$ctr>::from_core(InnerIvInit::inner_iv_slice_init(inner, $iv).map_err(|_| invalid_iv())?),
                block: <$cipher as BlockSizeUser>::block_size(),
            }),
        };
        transform
    }};
}

/// Block ciphers compiled into this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    Aes128,
    Aes192,
    Aes256,
    Twofish256,
    Serpent256,
    Camellia256,
    Blowfish128,
    Cast5,
}

impl CipherAlgorithm {
    pub const ALL: [CipherAlgorithm; 8] = [
        Self::Aes128,
        Self::Aes192,
        Self::Aes256,
        Self::Twofish256,
        Self::Serpent256,
        Self::Camellia256,
        Self::Blowfish128,
        Self::Cast5,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Aes128 => "AES128",
            Self::Aes192 => "AES192",
            Self::Aes256 => "AES256",
            Self::Twofish256 => "TWOFISH256",
            Self::Serpent256 => "SERPENT256",
            Self::Camellia256 => "CAMELLIA256",
            Self::Blowfish128 => "BLOWFISH128",
            Self::Cast5 => "CAST5",
        }
    }

    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128 | Self::Blowfish128 | Self::Cast5 => 16,
            Self::Aes192 => 24,
            Self::Aes256 | Self::Twofish256 | Self::Serpent256 | Self::Camellia256 => 32,
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            Self::Blowfish128 | Self::Cast5 => 8,
            _ => 16,
        }
    }

    /// Keys this cipher in `mode` for one direction of one stream.
    pub fn transform(
        self,
        mode: CipherMode,
        direction: Direction,
        key: &[u8],
        iv: &[u8],
    ) -> CryptResult<Box<dyn BlockTransform>> {
        let transform = match self {
            Self::Aes128 => {
                block_transform!(aes::Aes128, ctr::Ctr128BE<aes::Aes128>, mode, direction, key, iv)
            }
            Self::Aes192 => {
                block_transform!(aes::Aes192, ctr::Ctr128BE<aes::Aes192>, mode, direction, key, iv)
            }
            Self::Aes256 => {
                block_transform!(aes::Aes256, ctr::Ctr128BE<aes::Aes256>, mode, direction, key, iv)
            }
            Self::Twofish256 => block_transform!(
                twofish::Twofish,
                ctr::Ctr128BE<twofish::Twofish>,
                mode,
                direction,
                key,
                iv
            ),
            Self::Serpent256 => block_transform!(
                serpent::Serpent,
                ctr::Ctr128BE<serpent::Serpent>,
                mode,
                direction,
                key,
                iv
            ),
            Self::Camellia256 => block_transform!(
                camellia::Camellia256,
                ctr::Ctr128BE<camellia::Camellia256>,
                mode,
                direction,
                key,
                iv
            ),
            Self::Blowfish128 => block_transform!(
                blowfish::Blowfish,
                ctr::Ctr64BE<blowfish::Blowfish>,
                mode,
                direction,
                key,
                iv
            ),
            Self::Cast5 => {
                block_transform!(cast5::Cast5, ctr::Ctr64BE<cast5::Cast5>, mode, direction, key, iv)
            }
        };
        Ok(transform)
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = CryptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "AES" => Ok(Self::Aes256),
            "TWOFISH" => Ok(Self::Twofish256),
            "SERPENT" => Ok(Self::Serpent256),
            "CAMELLIA" => Ok(Self::Camellia256),
            "BLOWFISH" => Ok(Self::Blowfish128),
            "CAST128" => Ok(Self::Cast5),
            other => Self::ALL
                .into_iter()
                .find(|c| c.name() == other)
                .ok_or_else(|| CryptError::algorithm(AlgorithmKind::Cipher, s)),
        }
    }
}

/// Block cipher modes of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    Cbc,
    Cfb,
    Ofb,
    Ctr,
}

impl CipherMode {
    pub const ALL: [CipherMode; 4] = [Self::Cbc, Self::Cfb, Self::Ofb, Self::Ctr];

    pub fn name(self) -> &'static str {
        match self {
            Self::Cbc => "CBC",
            Self::Cfb => "CFB",
            Self::Ofb => "OFB",
            Self::Ctr => "CTR",
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherMode {
    type Err = CryptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|m| m.name() == upper)
            .ok_or_else(|| CryptError::algorithm(AlgorithmKind::Mode, s))
    }
}

/// Message digests used for key derivation, checksums and HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Sha3_256,
    Sha3_512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 7] = [
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
        Self::Sha3_256,
        Self::Sha3_512,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha224 => "SHA224",
            Self::Sha256 => "SHA256",
            Self::Sha384 => "SHA384",
            Self::Sha512 => "SHA512",
            Self::Sha3_256 => "SHA3-256",
            Self::Sha3_512 => "SHA3-512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 | Self::Sha3_256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 | Self::Sha3_512 => 64,
        }
    }

    pub fn digest(self) -> Box<dyn DynDigest + Send> {
        match self {
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha224 => Box::new(sha2::Sha224::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
            Self::Sha384 => Box::new(sha2::Sha384::default()),
            Self::Sha512 => Box::new(sha2::Sha512::default()),
            Self::Sha3_256 => Box::new(sha3::Sha3_256::default()),
            Self::Sha3_512 => Box::new(sha3::Sha3_512::default()),
        }
    }

    /// One-shot digest of `data`.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        let mut digest = self.digest();
        digest.update(data);
        digest.finalize().into_vec()
    }

    /// PBKDF2 with HMAC over this digest, filling all of `out`.
    pub fn pbkdf2(self, password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) {
        match self {
            Self::Sha1 => pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password, salt, rounds, out),
            Self::Sha224 => pbkdf2::pbkdf2_hmac::<sha2::Sha224>(password, salt, rounds, out),
            Self::Sha256 => pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password, salt, rounds, out),
            Self::Sha384 => pbkdf2::pbkdf2_hmac::<sha2::Sha384>(password, salt, rounds, out),
            Self::Sha512 => pbkdf2::pbkdf2_hmac::<sha2::Sha512>(password, salt, rounds, out),
            Self::Sha3_256 => pbkdf2::pbkdf2_hmac::<sha3::Sha3_256>(password, salt, rounds, out),
            Self::Sha3_512 => pbkdf2::pbkdf2_hmac::<sha3::Sha3_512>(password, salt, rounds, out),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = CryptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|h| h.name() == upper)
            .ok_or_else(|| CryptError::algorithm(AlgorithmKind::Hash, s))
    }
}

/// Running MAC over a byte stream.
pub trait StreamMac: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

struct MacState<M>(M);

impl<M: Mac + Send> StreamMac for MacState<M> {
    fn update(&mut self, data: &[u8]) {
        Mac::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().into_bytes().to_vec()
    }
}

fn keyed<M>(key: &[u8]) -> CryptResult<Box<dyn StreamMac>>
where
    M: Mac + KeyInit + Send + 'static,
{
    let mac = <M as Mac>::new_from_slice(key).map_err(|_| CryptError::key("invalid MAC key"))?;
    Ok(Box::new(MacState(mac)))
}

/// HMAC over one of the supported digests, named `HMAC_<DIGEST>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAlgorithm(pub HashAlgorithm);

impl MacAlgorithm {
    pub fn all() -> impl Iterator<Item = MacAlgorithm> {
        HashAlgorithm::ALL.into_iter().map(MacAlgorithm)
    }

    pub fn hash(self) -> HashAlgorithm {
        self.0
    }

    pub fn output_len(self) -> usize {
        self.0.output_len()
    }

    pub fn keyed(self, key: &[u8]) -> CryptResult<Box<dyn StreamMac>> {
        match self.0 {
            HashAlgorithm::Sha1 => keyed::<Hmac<sha1::Sha1>>(key),
            HashAlgorithm::Sha224 => keyed::<Hmac<sha2::Sha224>>(key),
            HashAlgorithm::Sha256 => keyed::<Hmac<sha2::Sha256>>(key),
            HashAlgorithm::Sha384 => keyed::<Hmac<sha2::Sha384>>(key),
            HashAlgorithm::Sha512 => keyed::<Hmac<sha2::Sha512>>(key),
            HashAlgorithm::Sha3_256 => keyed::<Hmac<sha3::Sha3_256>>(key),
            HashAlgorithm::Sha3_512 => keyed::<Hmac<sha3::Sha3_512>>(key),
        }
    }
}

impl fmt::Display for MacAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HMAC_{}", self.0.name())
    }
}

impl FromStr for MacAlgorithm {
    type Err = CryptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let digest = upper
            .strip_prefix("HMAC_")
            .or_else(|| upper.strip_prefix("HMAC-"))
            .ok_or_else(|| CryptError::algorithm(AlgorithmKind::Mac, s))?;
        digest
            .parse::<HashAlgorithm>()
            .map(MacAlgorithm)
            .map_err(|_| CryptError::algorithm(AlgorithmKind::Mac, s))
    }
}

/// The algorithm selection carried by a container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Algorithms {
    pub cipher: CipherAlgorithm,
    pub hash: HashAlgorithm,
    pub mode: CipherMode,
    pub mac: Option<MacAlgorithm>,
    /// Zero when the version derives keys without PBKDF2
    pub kdf_iterations: u32,
}
