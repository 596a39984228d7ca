use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose};
use std::env;

/// Environment variable consulted when no key is configured.
pub const ENCRYPTION_KEY_ENV: &str = "INFOBI_ENCRYPTION_KEY";

const NONCE_LEN: usize = 12;

/// Picks the configured key, falling back to `INFOBI_ENCRYPTION_KEY`.
pub fn resolve_key(configured: Option<&str>) -> Option<String> {
    configured
        .map(str::to_string)
        .or_else(|| env::var(ENCRYPTION_KEY_ENV).ok())
        .filter(|key| !key.trim().is_empty())
}

fn cipher(key_b64: &str) -> Result<Aes256Gcm, anyhow::Error> {
    let key_bytes = general_purpose::STANDARD
        .decode(key_b64.trim())
        .map_err(|e| anyhow::anyhow!("Failed to decode encryption key: {}", e))?;

    if key_bytes.len() != 32 {
        return Err(anyhow::anyhow!(
            "Encryption key must be 32 bytes (256 bits), got {} bytes",
            key_bytes.len()
        ));
    }

    Aes256Gcm::new_from_slice(&key_bytes).map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))
}

/// Encrypts data using AES-256-GCM.
///
/// The output is base64 of `nonce || ciphertext`, which is the format expected in
/// `password_encrypted` fields of connection definitions.
pub fn encrypt(key_b64: &str, plaintext: &[u8]) -> Result<String, anyhow::Error> {
    let cipher = cipher(key_b64)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

    let mut result = nonce.to_vec();
    result.extend_from_slice(&ciphertext);
    Ok(general_purpose::STANDARD.encode(result))
}

/// Decrypts data produced by [`encrypt`].
pub fn decrypt(key_b64: &str, encrypted_b64: &str) -> Result<Vec<u8>, anyhow::Error> {
    let cipher = cipher(key_b64)?;

    let encrypted_data = general_purpose::STANDARD
        .decode(encrypted_b64.trim())
        .map_err(|e| anyhow::anyhow!("Failed to decode encrypted data: {}", e))?;

    if encrypted_data.len() < NONCE_LEN {
        return Err(anyhow::anyhow!("Encrypted data too short"));
    }

    let (nonce_bytes, ciphertext) = encrypted_data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))
}

/// Decrypts a stored password into a string.
pub fn decrypt_password(key_b64: &str, encrypted_b64: &str) -> Result<String, anyhow::Error> {
    let bytes = decrypt(key_b64, encrypted_b64)?;
    String::from_utf8(bytes).map_err(|_| anyhow::anyhow!("Decrypted password is not valid UTF-8"))
}
