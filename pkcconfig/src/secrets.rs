//! Sealing of secrets (media server token) stored in `config.yaml`.
//!
//! Values are sealed with AES-256-GCM under a key derived from the machine
//! identifier, so a copied config file cannot be read elsewhere. Sealed values
//! are stored as `sealed:BASE64(nonce || ciphertext)`; anything without the
//! prefix is treated as plaintext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Result};
use base64::Engine;
use sha2::{Digest, Sha256};

const SEALED_PREFIX: &str = "sealed:";
const NONCE_LEN: usize = 12;

fn machine_id() -> Result<String> {
    #[cfg(target_os = "linux")]
    {
        for candidate in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(id) = std::fs::read_to_string(candidate) {
                let id = id.trim();
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
        }
        Err(anyhow!("Failed to read machine-id"))
    }

    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("ioreg")
            .args(["-d2", "-c", "IOPlatformExpertDevice"])
            .output()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find(|line| line.contains("IOPlatformUUID"))
            .and_then(|line| line.split('"').nth(3))
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Failed to extract IOPlatformUUID from ioreg"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(anyhow!("Unsupported platform for machine identifier"))
    }
}

fn derive_key(seed: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b"pkcompanion-secret-v1");
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// Seals `plain` with an explicit key.
pub fn seal_with_key(plain: &str, key: &[u8; 32]) -> Result<String> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Deterministic nonce: re-sealing an unchanged token leaves the file untouched.
    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    hasher.update(key);
    let digest = hasher.finalize();
    let nonce_bytes = &digest[..NONCE_LEN];

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce_bytes), plain.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(format!(
        "{}{}",
        SEALED_PREFIX,
        base64::engine::general_purpose::STANDARD.encode(&combined)
    ))
}

/// Opens a value produced by [`seal_with_key`].
pub fn open_with_key(sealed: &str, key: &[u8; 32]) -> Result<String> {
    let encoded = sealed
        .strip_prefix(SEALED_PREFIX)
        .ok_or_else(|| anyhow!("Invalid sealed value (missing prefix)"))?;

    let data = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    if data.len() < NONCE_LEN {
        return Err(anyhow!("Invalid sealed value (too short)"));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| anyhow!("Decryption failed (wrong machine or corrupted data): {}", e))?;

    String::from_utf8(plain).map_err(|e| anyhow!("Invalid UTF-8: {}", e))
}

pub fn is_sealed(value: &str) -> bool {
    value.starts_with(SEALED_PREFIX)
}

/// Seals `plain` with the machine key.
pub fn seal_secret(plain: &str) -> Result<String> {
    seal_with_key(plain, &derive_key(&machine_id()?))
}

/// Returns the plaintext of `value`, opening it with the machine key if sealed.
pub fn get_secret(value: &str) -> Result<String> {
    if is_sealed(value) {
        open_with_key(value, &derive_key(&machine_id()?))
    } else {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open_with_key() {
        let key = derive_key("test-machine");
        let sealed = seal_with_key("xyz-token", &key).unwrap();
        assert!(is_sealed(&sealed));
        assert!(!sealed.contains("xyz-token"));
        assert_eq!(open_with_key(&sealed, &key).unwrap(), "xyz-token");
    }

    #[test]
    fn test_sealing_is_deterministic() {
        let key = derive_key("test-machine");
        assert_eq!(
            seal_with_key("abc", &key).unwrap(),
            seal_with_key("abc", &key).unwrap()
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal_with_key("abc", &derive_key("one")).unwrap();
        assert!(open_with_key(&sealed, &derive_key("two")).is_err());
    }

    #[test]
    fn test_plaintext_passes_through() {
        assert_eq!(get_secret("plain-token").unwrap(), "plain-token");
        assert!(open_with_key("plain-token", &derive_key("k")).is_err());
    }
}
