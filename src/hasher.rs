// Password hashing for registration and login

use rand::Rng;
use sha2::{Digest, Sha256};

const SALT_LEN: usize = 32;

/// Turns a password into the string kept in `users.password_hash`, and
/// checks a password against it.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> String;

    fn verify(&self, password: &str, stored: &str) -> bool;
}

/// SHA-256 over a random salt followed by the password.
///
/// Stored as `<salt hex>$<digest hex>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SaltedSha256;

impl SaltedSha256 {
    fn digest(salt: &[u8], password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl PasswordHasher for SaltedSha256 {
    fn hash(&self, password: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill(&mut salt);
        format!("{}${}", hex::encode(salt), Self::digest(&salt, password))
    }

    fn verify(&self, password: &str, stored: &str) -> bool {
        let Some((salt, digest)) = stored.split_once('$') else {
            return false;
        };
        let Ok(salt) = hex::decode(salt) else {
            return false;
        };
        Self::digest(&salt, password) == digest
    }
}
