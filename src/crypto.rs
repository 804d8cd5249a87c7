//! ECDH, signing, AEAD record encryption, and key derivation.
//!
//! All key material that must not outlive its purpose is wrapped in a
//! zeroizing newtype, following the donor identity module's
//! zeroize-on-drop discipline.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{MeshError, Result};

pub const ED25519_SIGNATURE_LEN: usize = 64;
pub const X25519_PUBLIC_LEN: usize = 32;
pub const AEAD_KEY_LEN: usize = 32;
pub const AEAD_NONCE_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;

/// A long-lived X25519 static private key (node-to-node ECDH identity).
#[derive(ZeroizeOnDrop)]
pub struct StaticEcdhKey(StaticSecret);

impl StaticEcdhKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.0)
    }

    pub fn diffie_hellman(&self, peer_public: &X25519PublicKey) -> [u8; 32] {
        self.0.diffie_hellman(peer_public).to_bytes()
    }
}

/// A single-use ephemeral ECDH keypair, generated fresh for every SPTPS
/// handshake.
pub struct EphemeralEcdhKey(Option<EphemeralSecret>);

impl EphemeralEcdhKey {
    pub fn generate() -> (Self, X25519PublicKey) {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        (Self(Some(secret)), public)
    }

    /// Consumes the ephemeral secret, as ECDH on an ephemeral key must
    /// only ever happen once.
    pub fn diffie_hellman(mut self, peer_public: &X25519PublicKey) -> Result<[u8; 32]> {
        let secret = self
            .0
            .take()
            .ok_or_else(|| MeshError::crypto("ephemeral key already consumed"))?;
        Ok(secret.diffie_hellman(peer_public).to_bytes())
    }
}

pub fn ecdh_generate_keypair() -> StaticEcdhKey {
    StaticEcdhKey::generate()
}

pub fn ecdh_shared_secret(private: &StaticEcdhKey, peer_public: &X25519PublicKey) -> [u8; 32] {
    private.diffie_hellman(peer_public)
}

/// Node identity signing keypair.
#[derive(ZeroizeOnDrop)]
pub struct SigningIdentity {
    #[zeroize(skip)]
    verifying: VerifyingKey,
    signing: SigningKey,
}

impl SigningIdentity {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    pub fn from_bytes(mut bytes: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&bytes);
        bytes.zeroize();
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; ED25519_SIGNATURE_LEN] {
        ed25519_sign(&self.signing, msg)
    }
}

pub fn ed25519_sign(private: &SigningKey, msg: &[u8]) -> [u8; ED25519_SIGNATURE_LEN] {
    private.sign(msg).to_bytes()
}

pub fn ed25519_verify(public: &VerifyingKey, msg: &[u8], sig: &[u8]) -> Result<()> {
    let sig_bytes: [u8; ED25519_SIGNATURE_LEN] = sig
        .try_into()
        .map_err(|_| MeshError::crypto("malformed signature length"))?;
    let signature = Signature::from_bytes(&sig_bytes);
    public
        .verify(msg, &signature)
        .map_err(|_| MeshError::crypto("signature verification failed"))
}

/// Key material for one direction of an SPTPS session.
#[derive(ZeroizeOnDrop)]
pub struct AeadKey([u8; AEAD_KEY_LEN]);

impl AeadKey {
    pub fn from_bytes(bytes: [u8; AEAD_KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    /// Encrypts `plaintext` with a 12-byte nonce built from `seqno`
    /// (low bytes, big-endian) zero-padded in the high bytes, matching
    /// SPTPS's counter-nonce convention.
    pub fn seal(&self, seqno: u64, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = nonce_from_seqno(seqno);
        self.cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| MeshError::crypto("AEAD seal failed"))
    }

    pub fn open(&self, seqno: u64, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = nonce_from_seqno(seqno);
        self.cipher()
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| MeshError::crypto("AEAD open failed (tag mismatch or replay)"))
    }
}

fn nonce_from_seqno(seqno: u64) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce[4..].copy_from_slice(&seqno.to_be_bytes());
    nonce
}

/// HKDF-SHA512 over the ECDH output and handshake transcript, producing
/// `n` bytes of directional key material. `info` domain-separates uses
/// (SPTPS session keys vs. the at-rest storage envelope key).
pub fn kdf(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut out = vec![0u8; out_len];
    hk.expand(info, &mut out)
        .expect("HKDF output length within RFC 5869 bound");
    out
}

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_agrees() {
        let a = StaticEcdhKey::generate();
        let b = StaticEcdhKey::generate();
        assert_eq!(
            a.diffie_hellman(&b.public()),
            b.diffie_hellman(&a.public())
        );
    }

    #[test]
    fn sign_verify_roundtrip() {
        let id = SigningIdentity::generate();
        let msg = b"transcript bytes";
        let sig = id.sign(msg);
        assert!(ed25519_verify(&id.verifying_key(), msg, &sig).is_ok());

        let mut tampered = msg.to_vec();
        tampered[0] ^= 1;
        assert!(ed25519_verify(&id.verifying_key(), &tampered, &sig).is_err());

        let mut bad_sig = sig;
        bad_sig[0] ^= 1;
        assert!(ed25519_verify(&id.verifying_key(), msg, &bad_sig).is_err());
    }

    #[test]
    fn aead_seal_open_roundtrip() {
        let key = AeadKey::from_bytes(random_array());
        let pt = b"hello mesh";
        let ct = key.seal(1, pt, b"meta").unwrap();
        let back = key.open(1, &ct, b"meta").unwrap();
        assert_eq!(back, pt);

        assert!(key.open(2, &ct, b"meta").is_err());
        assert!(key.open(1, &ct, b"other-aad").is_err());
    }

    #[test]
    fn kdf_is_deterministic_and_domain_separated() {
        let ikm = random_bytes(32);
        let salt = random_bytes(16);
        let a = kdf(&ikm, &salt, b"sptps-session", 64);
        let b = kdf(&ikm, &salt, b"sptps-session", 64);
        let c = kdf(&ikm, &salt, b"storage-envelope", 64);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
