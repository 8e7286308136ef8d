//! Credential helpers: PIN hashing, one-time code generation, masking.

use anyhow::{anyhow, Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::Rng;

/// Hashes a card PIN into an Argon2 PHC string for storage.
pub fn hash_pin(pin: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(pin.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("Failed to hash PIN: {}", e))
}

/// Verifies `pin` against a stored PHC string on the blocking pool.
///
/// A malformed stored hash is an infrastructure error, not a wrong PIN.
pub async fn verify_pin(pin: String, stored_hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || -> Result<bool> {
        let parsed = PasswordHash::new(&stored_hash)
            .map_err(|e| anyhow!("Stored PIN hash is malformed: {}", e))?;
        Ok(Argon2::default()
            .verify_password(pin.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .context("PIN verification task failed")?
}

/// Uniformly random numeric code of exactly `digits` digits (leading zeros kept).
pub fn generate_numeric_code(digits: u32) -> String {
    let upper = 10u64.pow(digits);
    let value = OsRng.gen_range(0..upper);
    format!("{:0width$}", value, width = digits as usize)
}

/// `12345678` → `****5678`. Anything of 4 characters or fewer is fully masked.
pub fn mask_secret(secret: &str) -> String {
    let len = secret.chars().count();
    if len <= 4 {
        return "*".repeat(len);
    }
    let tail: String = secret.chars().skip(len - 4).collect();
    format!("{}{}", "*".repeat(len - 4), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pin_hash_roundtrip() {
        let hash = hash_pin("1234").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_pin("1234".to_string(), hash.clone()).await.unwrap());
        assert!(!verify_pin("4321".to_string(), hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_hash_is_an_error() {
        assert!(verify_pin("1234".to_string(), "not-a-hash".to_string())
            .await
            .is_err());
    }

    #[test]
    fn test_numeric_code_shape() {
        for _ in 0..50 {
            let code = generate_numeric_code(8);
            assert_eq!(code.len(), 8);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
        assert_eq!(generate_numeric_code(6).len(), 6);
    }

    #[test]
    fn test_masking() {
        assert_eq!(mask_secret("12345678"), "****5678");
        assert_eq!(mask_secret("12345"), "*2345");
        assert_eq!(mask_secret("1234"), "****");
        assert_eq!(mask_secret("12"), "**");
        assert_eq!(mask_secret(""), "");
    }
}
