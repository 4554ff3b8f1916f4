//! Configuration management with environment variable support.
//!
//! This module provides [`Config`]: default algorithm and feature choices
//! loaded from a JSON file and environment variables, and turned into
//! [`SessionOptions`].
//!
//! ## Environment Variables
//!
//! - `XCRYPT_CONFIG`: Override config file path
//! - `XCRYPT_CIPHER`, `XCRYPT_HASH`, `XCRYPT_MODE`, `XCRYPT_MAC`: Override algorithms
//! - `XCRYPT_KDF_ITERATIONS`: Override PBKDF2 rounds

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::algorithms::{CipherAlgorithm, CipherMode, HashAlgorithm, MacAlgorithm};
use crate::engine::SessionOptions;
use crate::version::{FormatVersion, KDF_ITERATIONS_DEFAULT};

/// Environment variable names for configuration overrides
pub const ENV_CONFIG_PATH: &str = "XCRYPT_CONFIG";
pub const ENV_CIPHER: &str = "XCRYPT_CIPHER";
pub const ENV_HASH: &str = "XCRYPT_HASH";
pub const ENV_MODE: &str = "XCRYPT_MODE";
pub const ENV_MAC: &str = "XCRYPT_MAC";
pub const ENV_KDF_ITERATIONS: &str = "XCRYPT_KDF_ITERATIONS";

/// Fewer PBKDF2 rounds than this draw a warning.
const WEAK_KDF_ITERATIONS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cipher: String,
    pub hash: String,
    pub mode: String,
    pub mac: String,
    pub kdf_iterations: u32,
    pub compress: bool,
    pub follow_links: bool,
    /// Container version to write; newest when absent
    pub compat: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let options = SessionOptions::default();
        Self {
            cipher: options.cipher.to_string(),
            hash: options.hash.to_string(),
            mode: options.mode.to_string(),
            mac: options.mac.to_string(),
            kdf_iterations: KDF_ITERATIONS_DEFAULT,
            compress: options.compress,
            follow_links: options.follow_links,
            compat: None,
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                return Self::load(p);
            }
            Some(ref p) => {
                warn!(path = p, "config file not found, using defaults");
                Config::default()
            }
            None => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to config
    fn apply_env_overrides(&mut self) {
        for (var, field) in [
            (ENV_CIPHER, &mut self.cipher),
            (ENV_HASH, &mut self.hash),
            (ENV_MODE, &mut self.mode),
            (ENV_MAC, &mut self.mac),
        ] {
            if let Ok(value) = env::var(var) {
                debug!(var, value = %value, "overriding from environment");
                *field = value;
            }
        }

        if let Ok(raw) = env::var(ENV_KDF_ITERATIONS) {
            match raw.trim().parse::<u32>() {
                Ok(n) => {
                    debug!(kdf_iterations = n, "overriding kdf_iterations from environment");
                    self.kdf_iterations = n;
                }
                Err(_) => warn!(value = %raw, "ignoring invalid {}", ENV_KDF_ITERATIONS),
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.cipher
            .parse::<CipherAlgorithm>()
            .with_context(|| format!("invalid cipher in config: {}", self.cipher))?;
        self.hash
            .parse::<HashAlgorithm>()
            .with_context(|| format!("invalid hash in config: {}", self.hash))?;
        self.mode
            .parse::<CipherMode>()
            .with_context(|| format!("invalid mode in config: {}", self.mode))?;
        self.mac
            .parse::<MacAlgorithm>()
            .with_context(|| format!("invalid MAC in config: {}", self.mac))?;
        if let Some(compat) = &self.compat {
            compat
                .parse::<FormatVersion>()
                .with_context(|| format!("invalid compat version in config: {}", compat))?;
        }

        if self.kdf_iterations != 0 && self.kdf_iterations < WEAK_KDF_ITERATIONS {
            warn!(
                kdf_iterations = self.kdf_iterations,
                "very low key derivation iteration count - keys will be easy to brute force"
            );
        }
        Ok(())
    }

    /// Converts the validated config into session options.
    pub fn to_options(&self) -> Result<SessionOptions> {
        let version = match &self.compat {
            Some(v) => v.parse()?,
            None => FormatVersion::CURRENT,
        };
        Ok(SessionOptions {
            cipher: self.cipher.parse()?,
            hash: self.hash.parse()?,
            mode: self.mode.parse()?,
            mac: self.mac.parse()?,
            kdf_iterations: self.kdf_iterations,
            raw: false,
            compress: self.compress,
            follow_links: self.follow_links,
            version,
        })
    }
}
