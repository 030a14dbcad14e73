//! Process-wide configuration, loaded once at startup.
//!
//! Values come from the environment (optionally seeded from a `.env`
//! file). Nothing here is mutated after `main` hands it to the
//! components that need it.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::ConfigError;

/// Shortest signing secret accepted for HS256 tokens.
pub const MIN_SECRET_LEN: usize = 32;

/// Symmetric signing secret. `Debug` never prints the bytes.
#[derive(Clone)]
pub struct SigningSecret(String);

impl SigningSecret {
    pub fn new(raw: impl Into<String>) -> Result<Self, ConfigError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if raw.len() < MIN_SECRET_LEN {
            return Err(ConfigError::WeakSecret {
                min: MIN_SECRET_LEN,
            });
        }
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

/// Argon2id cost parameters used for new hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            memory_kib: 128 * 1024,
            iterations: 2,
            parallelism: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub jwt_secret: SigningSecret,
    /// Session token lifetime in hours.
    pub token_ttl_hours: i64,
    pub bind_addr: SocketAddr,
    /// sled database directory.
    pub data_dir: String,
    pub hash_params: HashParams,
    /// Include internal error detail in HTTP responses.
    pub debug: bool,
    pub log_dir: String,
}

impl AppConfig {
    /// Build the configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    /// `JWT_SECRET_KEY` has no default: startup fails without it.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Missing .env is fine; real deployments inject the environment.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] but with an explicit lookup, so
    /// callers (and tests) need not touch the global environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = SigningSecret::new(lookup("JWT_SECRET_KEY").unwrap_or_default())?;
        let defaults = HashParams::default();

        Ok(Self {
            jwt_secret,
            token_ttl_hours: parse_or(&lookup, "TOKEN_TTL_HOURS", 24)?,
            bind_addr: parse_or(
                &lookup,
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            data_dir: lookup("DATA_DIR").unwrap_or_else(|| "salon_data".to_string()),
            hash_params: HashParams {
                memory_kib: parse_or(&lookup, "ARGON2_MEMORY_KIB", defaults.memory_kib)?,
                iterations: parse_or(&lookup, "ARGON2_ITERATIONS", defaults.iterations)?,
                parallelism: parse_or(&lookup, "ARGON2_PARALLELISM", defaults.parallelism)?,
            },
            debug: lookup("APP_DEBUG")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(false),
            log_dir: lookup("LOG_DIR").unwrap_or_else(|| "logs".to_string()),
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
    }
}
