//! Ed25519 helpers for the challenge-response handshakes.
//!
//! Keys, nonces and signatures travel as standard base64 strings. A peer
//! proves its identity by signing the UTF-8 bytes of the nonce string it was
//! given, not the bytes the nonce encodes.

use crate::types::NONCE_LEN;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

/// Something that can sign on behalf of a peer.
///
/// Implemented for [`SigningKey`]; hosts backed by a keychain or secure
/// enclave can provide their own implementation.
pub trait SigningIdentity: Send + Sync {
    /// Raw 32-byte Ed25519 public key.
    fn public_key_bytes(&self) -> [u8; 32];
    /// Raw 64-byte Ed25519 signature over `message`.
    fn sign_bytes(&self, message: &[u8]) -> [u8; 64];
}

impl SigningIdentity for SigningKey {
    fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    fn sign_bytes(&self, message: &[u8]) -> [u8; 64] {
        self.sign(message).to_bytes()
    }
}

/// Base64 of the identity's public key, as sent in registration and pairing.
#[must_use]
pub fn public_key_base64<I: SigningIdentity + ?Sized>(identity: &I) -> String {
    STANDARD.encode(identity.public_key_bytes())
}

/// Fresh random nonce: base64 of 32 bytes from the OS RNG.
#[must_use]
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Sign a challenge nonce (or any protocol string) and return base64.
///
/// # Examples
///
/// ```
/// use ed25519_dalek::SigningKey;
/// use hub_common::crypto;
///
/// let key = SigningKey::from_bytes(&[7u8; 32]);
/// let nonce = crypto::generate_nonce();
/// let sig = crypto::sign_nonce(&key, &nonce);
/// assert!(crypto::verify_nonce(&crypto::public_key_base64(&key), &nonce, &sig));
/// ```
#[must_use]
pub fn sign_nonce<I: SigningIdentity + ?Sized>(identity: &I, nonce: &str) -> String {
    STANDARD.encode(identity.sign_bytes(nonce.as_bytes()))
}

/// Check a base64 signature over `nonce` against a base64 public key.
///
/// Any decoding problem counts as a failed verification.
#[must_use]
pub fn verify_nonce(public_key_b64: &str, nonce: &str, signature_b64: &str) -> bool {
    let Ok(key_bytes) = STANDARD.decode(public_key_b64) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(nonce.as_bytes(), &signature).is_ok()
}
