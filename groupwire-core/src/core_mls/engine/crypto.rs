//! Key derivation and AEAD helpers for the reference engine

use crate::core_mls::errors::{EngineError, EngineResult};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

pub(crate) const NONCE_LEN: usize = 12;

/// Domain separation labels
pub(crate) const LABEL_EPOCH: &[u8] = b"groupwire/v1/epoch";
pub(crate) const LABEL_COMMIT_KEY: &[u8] = b"groupwire/v1/commit-key";
pub(crate) const LABEL_APPLICATION_KEY: &[u8] = b"groupwire/v1/application-key";
pub(crate) const LABEL_WELCOME_KEY: &[u8] = b"groupwire/v1/welcome-key";

pub(crate) type Secret = Zeroizing<[u8; 32]>;

pub(crate) fn random_secret() -> Secret {
    let mut secret = Zeroizing::new([0u8; 32]);
    rand::rng().fill_bytes(secret.as_mut());
    secret
}

/// HKDF-SHA256 with `label || context` as info
pub(crate) fn derive(
    ikm: &[u8],
    salt: Option<&[u8]>,
    label: &[u8],
    context: &[u8],
) -> EngineResult<Secret> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut info = Vec::with_capacity(label.len() + context.len());
    info.extend_from_slice(label);
    info.extend_from_slice(context);

    let mut out = Zeroizing::new([0u8; 32]);
    hkdf.expand(&info, out.as_mut())
        .map_err(|e| EngineError::CryptoError(format!("HKDF expand failed: {}", e)))?;
    Ok(out)
}

/// Encrypt under `key`; returns (nonce, ciphertext)
pub(crate) fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> EngineResult<(Vec<u8>, Vec<u8>)> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| EngineError::CryptoError(format!("Encryption failed: {}", e)))?;
    Ok((nonce.to_vec(), ciphertext))
}

pub(crate) fn open(key: &[u8; 32], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(EngineError::InvalidMessage(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| EngineError::VerifyFailed("authentication tag mismatch".to_string()))
}
