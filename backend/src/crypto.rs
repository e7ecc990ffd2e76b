//! Password hashing for account credentials
//!
//! Uses Argon2id in PHC string format. Token issuance is handled outside
//! this crate; only credential storage and verification live here.

use crate::error::{AppError, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use rand::RngCore;

const SALT_SIZE: usize = 16; // 128 bits

/// Hash a password into a self-describing PHC string
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let salt_string = SaltString::encode_b64(&salt)
        .map_err(|e| AppError::Config(format!("Salt encoding failed: {}", e)))?;

    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt_string)
        .map_err(|e| AppError::Config(format!("Password hashing failed: {}", e)))?;

    Ok(hash.to_string())
}

/// Check a password against a stored PHC string
pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|e| AppError::Config(format!("Stored hash is malformed: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
