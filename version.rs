//! Container format versions and their capabilities.
//!
//! Every historical wire format is a variant of [`FormatVersion`]. What a
//! version can express lives in one static [`Capabilities`] row, so the codec
//! consults data instead of branching on version numbers. Adding a version
//! means appending a variant and a row.

use std::fmt;
use std::str::FromStr;

use crate::algorithms::{CipherAlgorithm as C, CipherMode as M, HashAlgorithm as H};
use crate::error::{CryptError, CryptResult};

/// PBKDF2 rounds used when the caller asks for zero.
pub const KDF_ITERATIONS_DEFAULT: u32 = 0x0001_0000;

/// Fixed PBKDF2 rounds of the 2017.09 format.
pub const KDF_ITERATIONS_201709: u32 = 0x0000_8000;

/// How cipher/hash/mode names are laid out in the clear header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmLayout {
    /// `u8 len, cipher, u8 len, hash`
    Separate,
    /// `u8 len, "CIPHER/HASH[/MODE][/MAC][/KDF]"`
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfScheme {
    /// Key is the digest of the key material
    Digest,
    /// PBKDF2 with a round count fixed by the format
    Pbkdf2Fixed(u32),
    /// PBKDF2 with the round count stored in the header
    Pbkdf2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvScheme {
    /// IV is derived from the key material
    Derived,
    /// Random IV written in clear after the header
    Random,
}

#[derive(Debug)]
pub struct Capabilities {
    pub magic: u64,
    pub name: &'static str,
    pub layout: AlgorithmLayout,
    pub tags: bool,
    pub checksum: bool,
    pub compression: bool,
    pub directories: bool,
    pub links: bool,
    pub filename_tag: bool,
    pub mode_in_header: bool,
    pub mac: bool,
    pub kdf: KdfScheme,
    pub iv: IvScheme,
    pub extra_random: bool,
    pub ciphers: &'static [C],
    pub hashes: &'static [H],
    pub modes: &'static [M],
}

const LEGACY_CIPHERS: &[C] = &[C::Aes128, C::Aes192, C::Aes256, C::Twofish256, C::Serpent256, C::Blowfish128];
const CIPHERS: &[C] = &C::ALL;
const LEGACY_HASHES: &[H] = &[H::Sha1, H::Sha256, H::Sha512];
const SHA2_HASHES: &[H] = &[H::Sha1, H::Sha224, H::Sha256, H::Sha384, H::Sha512];
const HASHES: &[H] = &H::ALL;
const CBC_ONLY: &[M] = &[M::Cbc];
const MODES: &[M] = &M::ALL;

static CAPABILITIES: [Capabilities; 9] = [
    Capabilities {
        magic: 0x8bc6_2745_3fd9_9c6e,
        name: "2011.08",
        layout: AlgorithmLayout::Separate,
        tags: false,
        checksum: false,
        compression: false,
        directories: false,
        links: false,
        filename_tag: false,
        mode_in_header: false,
        mac: false,
        kdf: KdfScheme::Digest,
        iv: IvScheme::Derived,
        extra_random: false,
        ciphers: LEGACY_CIPHERS,
        hashes: LEGACY_HASHES,
        modes: CBC_ONLY,
    },
    Capabilities {
        magic: 0x4d3b_7c19_a6e2_51f0,
        name: "2011.10",
        layout: AlgorithmLayout::Separate,
        tags: false,
        checksum: true,
        compression: false,
        directories: false,
        links: false,
        filename_tag: false,
        mode_in_header: false,
        mac: false,
        kdf: KdfScheme::Digest,
        iv: IvScheme::Derived,
        extra_random: false,
        ciphers: LEGACY_CIPHERS,
        hashes: LEGACY_HASHES,
        modes: CBC_ONLY,
    },
    Capabilities {
        magic: 0x2d44_f1a2_8e6b_33c7,
        name: "2012.11",
        layout: AlgorithmLayout::Joined,
        tags: true,
        checksum: true,
        compression: true,
        directories: false,
        links: false,
        filename_tag: false,
        mode_in_header: false,
        mac: false,
        kdf: KdfScheme::Digest,
        iv: IvScheme::Derived,
        extra_random: false,
        ciphers: CIPHERS,
        hashes: SHA2_HASHES,
        modes: CBC_ONLY,
    },
    Capabilities {
        magic: 0xd3a1_88f5_07b2_6e94,
        name: "2013.02",
        layout: AlgorithmLayout::Joined,
        tags: true,
        checksum: true,
        compression: true,
        directories: true,
        links: false,
        filename_tag: false,
        mode_in_header: false,
        mac: false,
        kdf: KdfScheme::Digest,
        iv: IvScheme::Random,
        extra_random: true,
        ciphers: CIPHERS,
        hashes: SHA2_HASHES,
        modes: CBC_ONLY,
    },
    Capabilities {
        magic: 0x6a9f_0c3e_b45d_17a8,
        name: "2013.11",
        layout: AlgorithmLayout::Joined,
        tags: true,
        checksum: true,
        compression: true,
        directories: true,
        links: true,
        filename_tag: false,
        mode_in_header: false,
        mac: false,
        kdf: KdfScheme::Digest,
        iv: IvScheme::Random,
        extra_random: true,
        ciphers: CIPHERS,
        hashes: SHA2_HASHES,
        modes: CBC_ONLY,
    },
    Capabilities {
        magic: 0xf12e_5b70_c98a_4d36,
        name: "2014.06",
        layout: AlgorithmLayout::Joined,
        tags: true,
        checksum: true,
        compression: true,
        directories: true,
        links: true,
        filename_tag: false,
        mode_in_header: true,
        mac: false,
        kdf: KdfScheme::Digest,
        iv: IvScheme::Random,
        extra_random: true,
        ciphers: CIPHERS,
        hashes: HASHES,
        modes: MODES,
    },
    Capabilities {
        magic: 0x39c7_e0d4_62f1_a85b,
        name: "2015.01",
        layout: AlgorithmLayout::Joined,
        tags: true,
        checksum: true,
        compression: true,
        directories: true,
        links: true,
        filename_tag: true,
        mode_in_header: true,
        mac: false,
        kdf: KdfScheme::Digest,
        iv: IvScheme::Random,
        extra_random: true,
        ciphers: CIPHERS,
        hashes: HASHES,
        modes: MODES,
    },
    Capabilities {
        magic: 0xa5b8_4f26_1d93_ce07,
        name: "2017.09",
        layout: AlgorithmLayout::Joined,
        tags: true,
        checksum: true,
        compression: true,
        directories: true,
        links: true,
        filename_tag: true,
        mode_in_header: true,
        mac: true,
        kdf: KdfScheme::Pbkdf2Fixed(KDF_ITERATIONS_201709),
        iv: IvScheme::Random,
        extra_random: true,
        ciphers: CIPHERS,
        hashes: HASHES,
        modes: MODES,
    },
    Capabilities {
        magic: 0x5e02_9ad7_f346_b81c,
        name: "2020.01",
        layout: AlgorithmLayout::Joined,
        tags: true,
        checksum: true,
        compression: true,
        directories: true,
        links: true,
        filename_tag: true,
        mode_in_header: true,
        mac: true,
        kdf: KdfScheme::Pbkdf2,
        iv: IvScheme::Random,
        extra_random: true,
        ciphers: CIPHERS,
        hashes: HASHES,
        modes: MODES,
    },
];

/// Known container versions, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FormatVersion {
    V2011_08,
    V2011_10,
    V2012_11,
    V2013_02,
    V2013_11,
    V2014_06,
    V2015_01,
    V2017_09,
    V2020_01,
}

impl FormatVersion {
    pub const CURRENT: FormatVersion = FormatVersion::V2020_01;

    pub const ALL: [FormatVersion; 9] = [
        Self::V2011_08,
        Self::V2011_10,
        Self::V2012_11,
        Self::V2013_02,
        Self::V2013_11,
        Self::V2014_06,
        Self::V2015_01,
        Self::V2017_09,
        Self::V2020_01,
    ];

    pub fn caps(self) -> &'static Capabilities {
        &CAPABILITIES[self as usize]
    }

    pub fn magic(self) -> u64 {
        self.caps().magic
    }

    pub fn name(self) -> &'static str {
        self.caps().name
    }

    pub fn from_magic(magic: u64) -> CryptResult<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.magic() == magic)
            .ok_or(CryptError::UnknownVersion(magic))
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FormatVersion {
    type Err = CryptError;

    /// Accepts `YYYY.MM` names and `current`/`latest`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        if wanted.eq_ignore_ascii_case("current") || wanted.eq_ignore_ascii_case("latest") {
            return Ok(Self::CURRENT);
        }
        Self::ALL
            .into_iter()
            .find(|v| v.name() == wanted)
            .ok_or_else(|| CryptError::compatibility(format!("unknown container version '{wanted}'")))
    }
}
