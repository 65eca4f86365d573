//! Local identity: the long-term signing key of the logged-in user

use crate::core_mls::types::{KeyParseError, PublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[from] KeyParseError),

    #[error("Private key does not match public key")]
    KeyMismatch,
}

/// Signing identity.
///
/// The secret half lives only inside the ed25519 `SigningKey`, which wipes
/// itself on drop. Cloning duplicates the secret, so the session keeps a
/// single `Arc<Identity>` instead.
#[derive(Clone)]
pub struct Identity {
    public_key: PublicKey,
    signing_key: SigningKey,
}

impl Identity {
    /// Fresh random identity
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(secret.as_mut());
        Self::from_secret_bytes(&secret)
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let public_key = PublicKey::from_bytes(signing_key.verifying_key().to_bytes());
        Self {
            public_key,
            signing_key,
        }
    }

    /// Build an identity from hex-encoded keys, checking that the private
    /// key actually derives the given public key.
    pub fn from_hex(private_hex: &str, public_hex: &str) -> Result<Self, IdentityError> {
        let expected = PublicKey::parse(public_hex)?;

        let trimmed = Zeroizing::new(private_hex.trim().to_ascii_lowercase());
        if trimmed.len() != 64 {
            return Err(IdentityError::InvalidPrivateKey(format!(
                "expected 64 hex characters, got {}",
                trimmed.len()
            )));
        }

        let mut secret = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(trimmed.as_str(), secret.as_mut())
            .map_err(|_| IdentityError::InvalidPrivateKey("not a hex string".to_string()))?;

        let identity = Self::from_secret_bytes(&secret);
        if identity.public_key != expected {
            return Err(IdentityError::KeyMismatch);
        }
        Ok(identity)
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Hex export of the secret key (for `keygen` style tooling)
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Check an ed25519 signature made by `signer`
pub fn verify_signature(signer: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(signer.as_bytes()) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&bytes)).is_ok()
}
