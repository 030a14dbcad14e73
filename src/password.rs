//! Password hashing with self-describing encoded strings.
//!
//! New hashes are Argon2id in PHC format
//! (`$argon2id$v=19$m=..,t=..,p=..$<salt>$<key>`). Verification always
//! re-derives with the parameters stored in the string, so raising the
//! defaults later never breaks existing accounts. Legacy bcrypt strings
//! still verify and are reported by [`PasswordHasher::needs_rehash`].

use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::config::HashParams;
use crate::error::HashError;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// PHC strings have an empty leading field, then id, version, params, salt, key.
const PHC_FIELDS: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    params: HashParams,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(HashParams::default())
    }
}

impl PasswordHasher {
    pub fn new(params: HashParams) -> Self {
        Self { params }
    }

    /// Hash `plaintext` with a fresh random salt and the current parameters.
    pub fn hash(&self, plaintext: &str) -> Result<String, HashError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|e| HashError::Randomness(e.to_string()))?;
        let salt = SaltString::encode_b64(&salt).map_err(|e| HashError::Backend(e.to_string()))?;

        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| HashError::Backend(e.to_string()))?;

        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| HashError::Backend(e.to_string()))
    }

    /// Check `plaintext` against an encoded hash.
    ///
    /// `Ok(false)` means a well-formed hash that does not match. A string
    /// that cannot be parsed is `Err(HashError::Format)`. The key
    /// comparison is constant-time.
    pub fn verify(&self, plaintext: &str, encoded: &str) -> Result<bool, HashError> {
        if is_bcrypt(encoded) {
            return bcrypt::verify(plaintext, encoded).map_err(|e| HashError::Format(e.to_string()));
        }

        let parsed = parse_argon2(encoded)?;
        // Algorithm, version and cost come from `parsed`, not from self.params.
        match Argon2::default().verify_password(plaintext.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(HashError::Format(e.to_string())),
        }
    }

    /// True when `encoded` was produced by anything other than Argon2id
    /// with the current parameters.
    pub fn needs_rehash(&self, encoded: &str) -> bool {
        if is_bcrypt(encoded) {
            return true;
        }
        let Ok(parsed) = parse_argon2(encoded) else {
            return true;
        };
        if Algorithm::try_from(parsed.algorithm).ok() != Some(Algorithm::Argon2id)
            || parsed.version != Some(Version::V0x13.into())
        {
            return true;
        }
        match Params::try_from(&parsed) {
            Ok(params) => {
                params.m_cost() != self.params.memory_kib
                    || params.t_cost() != self.params.iterations
                    || params.p_cost() != self.params.parallelism
            }
            Err(_) => true,
        }
    }
}

fn is_bcrypt(encoded: &str) -> bool {
    ["$2a$", "$2b$", "$2x$", "$2y$"]
        .iter()
        .any(|prefix| encoded.starts_with(prefix))
}

fn parse_argon2(encoded: &str) -> Result<PasswordHash<'_>, HashError> {
    let fields = encoded.split('$').count();
    if fields != PHC_FIELDS {
        return Err(HashError::Format(format!(
            "expected {PHC_FIELDS} fields, found {fields}"
        )));
    }
    let parsed = PasswordHash::new(encoded).map_err(|e| HashError::Format(e.to_string()))?;
    Algorithm::try_from(parsed.algorithm).map_err(|e| HashError::Format(e.to_string()))?;
    if parsed.hash.is_none() {
        return Err(HashError::Format("missing derived key".to_string()));
    }
    Ok(parsed)
}
