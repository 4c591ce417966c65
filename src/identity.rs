//! Identity & Crypto (ID): the cryptographic identity that survives
//! address changes, and the primitives every other component builds
//! on — pairwise key agreement, message encryption, and rendezvous
//! slug derivation.
//!
//! A single P-256 keypair serves both roles the design document asks
//! for: ECDSA signing (`sign`/`verify`) and, via the same private
//! scalar, ECDH key agreement (`derive_shared`). Unlike an Ed25519
//! identity, P-256 needs no birational curve conversion to switch
//! roles — the scalar is usable directly with either the `ecdsa` or
//! `ecdh` module of the `p256` crate.
//!
//! Signing private keys never leave this module; every other
//! component is handed a [`PublicIdentity`] or a derived [`SharedKey`]
//! handle instead.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use getrandom::SysRng;
use rand_core::{Rng, UnwrapErr};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::Fingerprint;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("no secure context available to generate or load a keypair")]
    NoSecureContext,
    #[error("failed to import a key from its encoded bytes")]
    KeyImportFailed,
    #[error("signature verification failed")]
    VerifyFailed,
    #[error("AEAD decryption failed (wrong key, tampered ciphertext, or bad nonce)")]
    DecryptFailed,
    #[error("key derivation failed")]
    KeyDeriveFailed,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// A locally-persisted ECDSA P-256 keypair. Created on first launch and
/// never rotated — losing it is equivalent to creating a new identity.
pub struct Identity {
    signing_key: SigningKey,
}

/// The public half of an [`Identity`], safe to hand to every component
/// and to send over the wire.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct PublicIdentity {
    /// SEC1 encoded point, compressed form.
    pub encoded: Vec<u8>,
}

/// A derived AES-256-GCM pairwise key, plus its own fingerprint so it
/// can be persisted and recognized across restarts without re-running
/// ECDH (§4.5, pairwise shared key cache).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey {
    bytes: [u8; 32],
}

impl Identity {
    /// `generate_keypair`.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut UnwrapErr(SysRng));
        Self { signing_key }
    }

    /// Load an identity from a previously-persisted raw scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let signing_key = SigningKey::from_slice(bytes).map_err(|_| CryptoError::KeyImportFailed)?;
        Ok(Self { signing_key })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    pub fn public(&self) -> PublicIdentity {
        let verifying_key: VerifyingKey = *self.signing_key.verifying_key();
        let encoded = verifying_key.to_encoded_point(true).as_bytes().to_vec();
        PublicIdentity { encoded }
    }

    /// `fingerprint(pk)` for our own public key.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(&self.public())
    }

    /// `sign(msg)`.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let sig: Signature = self.signing_key.sign(msg);
        sig.to_der().as_bytes().to_vec()
    }

    /// `derive_shared(my_private, peer_public)` — ECDH over P-256
    /// followed by HKDF-SHA256 to a 256-bit AES key.
    pub fn derive_shared(&self, peer_public: &PublicIdentity) -> Result<SharedKey> {
        let peer_point = p256::PublicKey::from_sec1_bytes(&peer_public.encoded)
            .map_err(|_| CryptoError::KeyImportFailed)?;
        let secret_scalar = self.signing_key.as_nonzero_scalar();
        let shared = p256::ecdh::diffie_hellman(secret_scalar, peer_point.as_affine());

        let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());
        let mut okm = [0u8; 32];
        hk.expand(b"peerns-overlay-pairwise-key-v1", &mut okm)
            .map_err(|_| CryptoError::KeyDeriveFailed)?;
        Ok(SharedKey { bytes: okm })
    }
}

/// `verify(pk, sig, msg)`, free function since it needs no private key.
pub fn verify(public: &PublicIdentity, signature: &[u8], msg: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_sec1_bytes(&public.encoded)
        .map_err(|_| CryptoError::KeyImportFailed)?;
    let sig = Signature::from_der(signature).map_err(|_| CryptoError::VerifyFailed)?;
    verifying_key
        .verify(msg, &sig)
        .map_err(|_| CryptoError::VerifyFailed)
}

/// `fingerprint(pk) = first 8 bytes of SHA-256(pk)`, hex-rendered.
pub fn fingerprint(public: &PublicIdentity) -> Fingerprint {
    let digest = Sha256::digest(&public.encoded);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    Fingerprint::from_bytes(bytes)
}

impl SharedKey {
    /// Reconstruct a cached shared key from persisted raw bytes. Used
    /// only by the storage layer when restoring a contact whose
    /// shared-key fingerprint was cached but the raw key itself still
    /// needs deriving fresh — callers should prefer `Identity::derive_shared`
    /// and use this only for tests/fixtures that already hold the bytes.
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// `fingerprint_key(key)` = hex-truncated SHA-256 of raw key bytes.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(self.bytes);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Fingerprint::from_bytes(bytes)
    }

    /// `encrypt(k, plaintext)` — random 96-bit IV, AES-256-GCM.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.bytes));
        let mut iv_bytes = [0u8; 12];
        UnwrapErr(SysRng).fill_bytes(&mut iv_bytes);
        let nonce = Nonce::from_slice(&iv_bytes);
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: b"" })
            .map_err(|_| CryptoError::KeyDeriveFailed)?;
        Ok((iv_bytes.to_vec(), ciphertext))
    }

    /// `decrypt(k, iv, ct)`.
    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != 12 {
            return Err(CryptoError::DecryptFailed);
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.bytes));
        let nonce = Nonce::from_slice(iv);
        cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad: b"" })
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// `rendezvous_slug(pair_key, window_index) =
    /// HMAC-SHA256(pair_key, window_index as 64-bit big-endian)`,
    /// truncated to a URL-safe token suitable for a namespace-id path
    /// segment.
    pub fn rendezvous_slug(&self, window_index: u64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.bytes).expect("HMAC accepts any key length");
        mac.update(&window_index.to_be_bytes());
        let tag = mac.finalize().into_bytes();
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &tag[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_16_hex_chars_and_stable() {
        let id = Identity::generate();
        let fp1 = id.fingerprint();
        let fp2 = fingerprint(&id.public());
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.to_hex().len(), 16);
    }

    #[test]
    fn fingerprint_stable_across_reload() {
        let id = Identity::generate();
        let bytes = id.to_bytes();
        let reloaded = Identity::from_bytes(&bytes).unwrap();
        assert_eq!(id.fingerprint(), reloaded.fingerprint());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let id = Identity::generate();
        let msg = b"hello overlay";
        let sig = id.sign(msg);
        verify(&id.public(), &sig, msg).unwrap();
        assert!(verify(&id.public(), &sig, b"tampered").is_err());
    }

    #[test]
    fn pairwise_key_is_symmetric() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let k_ab = alice.derive_shared(&bob.public()).unwrap();
        let k_ba = bob.derive_shared(&alice.public()).unwrap();
        assert_eq!(k_ab.as_bytes(), k_ba.as_bytes());
        assert_eq!(k_ab.fingerprint(), k_ba.fingerprint());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let key = alice.derive_shared(&bob.public()).unwrap();
        let (iv, ct) = key.encrypt(b"secret message").unwrap();
        let pt = key.decrypt(&iv, &ct).unwrap();
        assert_eq!(pt, b"secret message");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let eve = Identity::generate();
        let key_ab = alice.derive_shared(&bob.public()).unwrap();
        let key_ae = alice.derive_shared(&eve.public()).unwrap();
        let (iv, ct) = key_ab.encrypt(b"secret").unwrap();
        assert!(key_ae.decrypt(&iv, &ct).is_err());
    }

    #[test]
    fn rendezvous_slug_symmetric_and_window_sensitive() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let k_ab = alice.derive_shared(&bob.public()).unwrap();
        let k_ba = bob.derive_shared(&alice.public()).unwrap();
        assert_eq!(k_ab.rendezvous_slug(42), k_ba.rendezvous_slug(42));
        assert_ne!(k_ab.rendezvous_slug(42), k_ab.rendezvous_slug(43));
    }
}
