//! Payload encryption and signing for envelopes.
//!
//! Asymmetric: ephemeral X25519 Diffie-Hellman against the recipient's
//! Ed25519 identity (converted Edwards to Montgomery), HKDF-SHA256,
//! XChaCha20-Poly1305. Symmetric: XChaCha20-Poly1305 under a shared
//! 32-byte key with a random 24-byte nonce appended to the ciphertext.
//! Signatures: Ed25519.
use chacha20poly1305::{
    aead::rand_core::{OsRng, RngCore},
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::error::ProtocolError;

/// HKDF info string for the asymmetric scheme.
const HKDF_INFO: &[u8] = b"ferry-envelope-x25519-xchacha20poly1305-v1";

/// HKDF info string for password-derived symmetric keys.
const PASSWORD_INFO: &[u8] = b"ferry-envelope-password-key-v1";

/// Symmetric key length.
pub const SYM_KEY_LENGTH: usize = 32;

/// XChaCha20 nonce length.
pub const NONCE_LENGTH: usize = 24;

/// Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

/// Output of the asymmetric scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// XChaCha20-Poly1305 ciphertext (includes the 16-byte tag).
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LENGTH],
    /// Sender's ephemeral X25519 public key.
    pub ephemeral_pk: [u8; 32],
}

impl EncryptedPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

/// Ed25519 public key for a 32-byte seed.
pub fn public_key(seed: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(seed).verifying_key().to_bytes()
}

/// Fresh random 32-byte secret (symmetric key or signing seed).
pub fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Fill `buf` with random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Derive a symmetric key from a shared password.
pub fn sym_key_from_password(password: &str) -> [u8; SYM_KEY_LENGTH] {
    let hkdf = Hkdf::<Sha256>::new(None, password.as_bytes());
    let mut key = [0u8; SYM_KEY_LENGTH];
    hkdf.expand(PASSWORD_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

/// Convert an Ed25519 public key to X25519 (libsodium's
/// `crypto_sign_ed25519_pk_to_curve25519`).
pub fn ed25519_to_x25519_public(ed25519_pk: &[u8; 32]) -> Result<[u8; 32], ProtocolError> {
    let edwards = CompressedEdwardsY(*ed25519_pk)
        .decompress()
        .ok_or_else(|| ProtocolError::Crypto("invalid Ed25519 public key".into()))?;
    Ok(edwards.to_montgomery().to_bytes())
}

/// Convert an Ed25519 seed to a clamped X25519 secret.
pub fn ed25519_to_x25519_secret(ed25519_seed: &[u8; 32]) -> [u8; 32] {
    let hash = Sha512::digest(ed25519_seed);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hash[..32]);
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

fn derive_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

/// Encrypt for the holder of `recipient_pk` (Ed25519 public key).
pub fn encrypt_asymmetric(
    plaintext: &[u8],
    recipient_pk: &[u8; 32],
) -> Result<EncryptedPayload, ProtocolError> {
    let recipient = X25519PublicKey::from(ed25519_to_x25519_public(recipient_pk)?);

    let ephemeral_secret = X25519Secret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&recipient);
    let cipher = XChaCha20Poly1305::new(&derive_key(shared_secret.as_bytes()).into());

    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(&XNonce::from(nonce), plaintext)
        .map_err(|e| ProtocolError::Crypto(format!("encryption failed: {e}")))?;

    Ok(EncryptedPayload {
        ciphertext,
        nonce,
        ephemeral_pk: ephemeral_public.to_bytes(),
    })
}

/// Decrypt with the recipient's Ed25519 seed.
pub fn decrypt_asymmetric(
    payload: &EncryptedPayload,
    recipient_seed: &[u8; 32],
) -> Result<Vec<u8>, ProtocolError> {
    let secret = X25519Secret::from(ed25519_to_x25519_secret(recipient_seed));
    let shared_secret = secret.diffie_hellman(&X25519PublicKey::from(payload.ephemeral_pk));
    let cipher = XChaCha20Poly1305::new(&derive_key(shared_secret.as_bytes()).into());
    cipher
        .decrypt(&XNonce::from(payload.nonce), payload.ciphertext.as_ref())
        .map_err(|_| ProtocolError::Crypto("decryption failed: authentication error".into()))
}

/// Encrypt under a shared key. Output: `ciphertext || nonce`.
pub fn encrypt_symmetric(plaintext: &[u8], key: &[u8; SYM_KEY_LENGTH]) -> Result<Vec<u8>, ProtocolError> {
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    let mut out = cipher
        .encrypt(&XNonce::from(nonce), plaintext)
        .map_err(|e| ProtocolError::Crypto(format!("encryption failed: {e}")))?;
    out.extend_from_slice(&nonce);
    Ok(out)
}

/// Reverse of [`encrypt_symmetric`].
pub fn decrypt_symmetric(data: &[u8], key: &[u8; SYM_KEY_LENGTH]) -> Result<Vec<u8>, ProtocolError> {
    if data.len() < NONCE_LENGTH {
        return Err(ProtocolError::Crypto("ciphertext shorter than nonce".into()));
    }
    let (ciphertext, nonce) = data.split_at(data.len() - NONCE_LENGTH);
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| ProtocolError::Crypto("decryption failed: authentication error".into()))
}

/// Sign `data` with an Ed25519 seed.
pub fn sign(data: &[u8], seed: &[u8; 32]) -> [u8; SIGNATURE_LENGTH] {
    SigningKey::from_bytes(seed).sign(data).to_bytes()
}

/// Verify an Ed25519 signature.
pub fn verify(data: &[u8], signature: &[u8; SIGNATURE_LENGTH], public_key: &[u8; 32]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(data, &Signature::from_bytes(signature)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed_byte: u8) -> ([u8; 32], [u8; 32]) {
        let seed = [seed_byte; 32];
        (seed, public_key(&seed))
    }

    #[test]
    fn asymmetric_roundtrip() {
        let (sk, pk) = keypair(42);
        let encrypted = encrypt_asymmetric(b"hello mailserver", &pk).unwrap();
        assert_eq!(decrypt_asymmetric(&encrypted, &sk).unwrap(), b"hello mailserver");
    }

    #[test]
    fn asymmetric_wrong_key_fails() {
        let (_, pk) = keypair(1);
        let (other, _) = keypair(2);
        let encrypted = encrypt_asymmetric(b"secret", &pk).unwrap();
        assert!(decrypt_asymmetric(&encrypted, &other).is_err());
    }

    #[test]
    fn symmetric_roundtrip_and_tamper() {
        let key = [9u8; 32];
        let mut data = encrypt_symmetric(b"payload", &key).unwrap();
        assert_eq!(decrypt_symmetric(&data, &key).unwrap(), b"payload");
        data[0] ^= 1;
        assert!(decrypt_symmetric(&data, &key).is_err());
    }

    #[test]
    fn symmetric_rejects_truncated() {
        assert!(decrypt_symmetric(&[0u8; 10], &[1u8; 32]).is_err());
    }

    #[test]
    fn password_keys_are_deterministic() {
        assert_eq!(sym_key_from_password("pw"), sym_key_from_password("pw"));
        assert_ne!(sym_key_from_password("pw"), sym_key_from_password("pw2"));
    }

    #[test]
    fn signatures_verify() {
        let (sk, pk) = keypair(7);
        let sig = sign(b"data", &sk);
        assert!(verify(b"data", &sig, &pk));
        assert!(!verify(b"other", &sig, &pk));
    }

    #[test]
    fn x25519_secret_is_clamped() {
        let secret = ed25519_to_x25519_secret(&[3u8; 32]);
        assert_eq!(secret[0] & 7, 0);
        assert_eq!(secret[31] & 128, 0);
        assert_eq!(secret[31] & 64, 64);
    }
}
