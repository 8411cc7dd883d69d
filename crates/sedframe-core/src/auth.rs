//! Credentials and the password-to-bytes hashing hook.
//!
//! The engine never stores credentials; callers build a [`Credential`] from
//! raw bytes (an MSID read from the drive, a PSID from the label) or from a
//! password run through a [`PasswordHasher`]. Credential buffers are
//! zeroized on drop.

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// A credential presented to an authority.
pub struct Credential(Vec<u8>);

impl Credential {
    /// Wrap raw credential bytes (MSID, PSID, pre-hashed PIN).
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Hash a password with the given hasher and salt.
    #[must_use]
    pub fn from_password(password: &str, hasher: &dyn PasswordHasher, salt: &[u8]) -> Self {
        Self(hasher.hash(password, salt))
    }

    /// A password passed through verbatim, for drives provisioned with
    /// plain-text PINs.
    #[must_use]
    pub fn plain(password: &str) -> Self {
        Self(password.as_bytes().to_vec())
    }

    /// The credential bytes as sent in the Authenticate challenge.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for an empty credential.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print credential bytes
        write!(f, "Credential({} bytes)", self.0.len())
    }
}

/// Password-to-bytes hook injected into credential construction.
pub trait PasswordHasher: Send + Sync {
    /// Derive credential bytes from a password and a salt.
    fn hash(&self, password: &str, salt: &[u8]) -> Vec<u8>;
}

/// SHA-256 over salt then password; 32-byte output.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl PasswordHasher for Sha256Hasher {
    fn hash(&self, password: &str, salt: &[u8]) -> Vec<u8> {
        let mut h = Sha256::new();
        h.update(salt);
        h.update(password.as_bytes());
        h.finalize().to_vec()
    }
}

/// Derive a per-drive salt from the factory MSID credential.
#[must_use]
pub fn msid_salt(msid: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(b"sed-msid-salt");
    h.update(msid);
    h.finalize()[..16].to_vec()
}
