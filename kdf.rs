//! Key and IV derivation from raw key material.

use tracing::debug;
use zeroize::Zeroizing;

use crate::algorithms::Algorithms;
use crate::error::{CryptError, CryptResult};
use crate::version::KdfScheme;

/// Derives the cipher key for one stream.
///
/// `salt` is the clear IV block and is only consulted by the PBKDF2
/// schemes. For the digest scheme a key longer than the digest is extended
/// by hashing the previous output again.
pub fn derive_key(
    material: &[u8],
    algorithms: &Algorithms,
    scheme: KdfScheme,
    salt: &[u8],
) -> CryptResult<Zeroizing<Vec<u8>>> {
    let key_len = algorithms.cipher.key_len();
    let mut key = Zeroizing::new(vec![0u8; key_len]);

    match scheme {
        KdfScheme::Digest => {
            let mut block = Zeroizing::new(algorithms.hash.hash(material));
            let mut filled = 0;
            while filled < key_len {
                let take = block.len().min(key_len - filled);
                key[filled..filled + take].copy_from_slice(&block[..take]);
                filled += take;
                if filled < key_len {
                    block = Zeroizing::new(algorithms.hash.hash(&block));
                }
            }
        }
        KdfScheme::Pbkdf2Fixed(rounds) => {
            algorithms.hash.pbkdf2(material, salt, rounds, &mut key);
        }
        KdfScheme::Pbkdf2 => {
            if algorithms.kdf_iterations == 0 {
                return Err(CryptError::key("PBKDF2 requires a non-zero iteration count"));
            }
            algorithms
                .hash
                .pbkdf2(material, salt, algorithms.kdf_iterations, &mut key);
        }
    }

    debug!(
        cipher = %algorithms.cipher,
        hash = %algorithms.hash,
        scheme = ?scheme,
        "Derived stream key"
    );
    Ok(key)
}

/// IV for versions that store no IV: the digest of the digest of the key
/// material, cut to the cipher block size.
pub fn derive_iv(material: &[u8], algorithms: &Algorithms) -> Zeroizing<Vec<u8>> {
    let block_size = algorithms.cipher.block_size();
    let first = Zeroizing::new(algorithms.hash.hash(material));
    let mut iv = algorithms.hash.hash(&first);
    iv.resize(block_size, 0);
    Zeroizing::new(iv)
}
