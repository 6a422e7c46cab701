//! Keystore (component B): generate/open an encrypted local signing key
//! derived from machine identity.
//!
//! No direct teacher analogue (the teacher's `audit.rs` chains with SHA-256
//! only, never signs). Grounded on the `ed25519-dalek`/`aes-gcm`/`pbkdf2`
//! combination seen across the retrieval pack (`GlobalSushrut-PARVYOM-metanode`'s
//! `wallet-identity` crate for Ed25519 keypair handling; `aes-gcm`+`pbkdf2`
//! for encryption-at-rest as used by `Fabstir-fabstir-llm-node`). Machine
//! identity uses `gethostname`, the way `metjm-planning-agent` does for its
//! own container/session identification.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey as DalekSigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand_core::OsRng;
use tracing::warn;
use useai_types::{KeystoreFile, UNSIGNED};

const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A live Ed25519 signing key, held in memory for the lifetime of the engine.
pub struct SigningKey(DalekSigningKey);

impl SigningKey {
    /// Signs the raw bytes behind a hex-encoded SHA-256 hash, returning the
    /// signature hex-encoded. Returns `None` if `hash_hex` isn't valid hex.
    pub fn sign_hex(&self, hash_hex: &str) -> Option<String> {
        let hash_bytes = hex::decode(hash_hex).ok()?;
        let signature: Signature = self.0.sign(&hash_bytes);
        Some(hex::encode(signature.to_bytes()))
    }

    pub fn public_key_pem(&self) -> String {
        self.0
            .verifying_key()
            .to_public_key_pem(ed25519_dalek::pkcs8::LineEnding::LF)
            .expect("verifying key always encodes to PEM")
    }
}

pub fn verifying_key_from_pem(pem: &str) -> Option<VerifyingKey> {
    VerifyingKey::from_public_key_pem(pem).ok()
}

/// Verifies a hex-encoded Ed25519 signature over a hex-encoded hash.
/// Returns `false` (never panics) for `"unsigned"`, malformed hex, or a
/// signature that doesn't validate.
pub fn verify_signature(verifying_key: &VerifyingKey, hash_hex: &str, signature_hex: &str) -> bool {
    if signature_hex == UNSIGNED {
        return false;
    }
    let Ok(hash_bytes) = hex::decode(hash_hex) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);
    verifying_key.verify(&hash_bytes, &signature).is_ok()
}

/// The live keystore state held by the session engine. `signing_key` is
/// `None` when signing is unavailable (no keystore yet generated, or
/// decryption failed) — in which case the engine falls back to unsigned
/// mode and continues; signing is best-effort, never a hard dependency.
pub struct Keystore {
    pub signing_key: Option<SigningKey>,
}

impl Keystore {
    pub fn unsigned() -> Self {
        Self { signing_key: None }
    }

    pub fn is_signing_available(&self) -> bool {
        self.signing_key.is_some()
    }

    pub fn public_key_pem(&self) -> Option<String> {
        self.signing_key.as_ref().map(SigningKey::public_key_pem)
    }
}

fn machine_identity_material() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{hostname}:{username}:useai-keystore")
}

fn derive_key(salt: &[u8]) -> [u8; 32] {
    let material = machine_identity_material();
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(material.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Generates a fresh Ed25519 key pair, encrypts the PKCS#8 PEM of the
/// private half under the machine-derived key, and returns both the live
/// signing key and the file to persist.
pub fn generate() -> (SigningKey, KeystoreFile) {
    let dalek_key = DalekSigningKey::generate(&mut OsRng);
    let public_key_pem = dalek_key
        .verifying_key()
        .to_public_key_pem(ed25519_dalek::pkcs8::LineEnding::LF)
        .expect("verifying key always encodes to PEM");
    let private_key_pem = dalek_key
        .to_pkcs8_pem(ed25519_dalek::pkcs8::LineEnding::LF)
        .expect("signing key always encodes to PEM");

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let derived = derive_key(&salt);

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived));
    let nonce = Nonce::from_slice(&iv);
    let ciphertext_and_tag = cipher
        .encrypt(nonce, private_key_pem.as_bytes())
        .expect("AES-256-GCM encryption of an in-memory key never fails");

    let tag_start = ciphertext_and_tag.len() - TAG_LEN;
    let (ciphertext, tag) = ciphertext_and_tag.split_at(tag_start);

    let file = KeystoreFile {
        public_key_pem,
        encrypted_private_key: hex::encode(ciphertext),
        iv: hex::encode(iv),
        tag: hex::encode(tag),
        salt: hex::encode(salt),
        created_at: chrono::Utc::now(),
    };

    (SigningKey(dalek_key), file)
}

/// Attempts to decrypt a persisted keystore file. Returns `None` (never an
/// error) if authenticated decryption fails — bad tag, wrong salt, wrong
/// machine — so the caller can fall back to unsigned mode.
pub fn open(file: &KeystoreFile) -> Option<SigningKey> {
    let salt = hex::decode(&file.salt).ok()?;
    let iv = hex::decode(&file.iv).ok()?;
    let tag = hex::decode(&file.tag).ok()?;
    let ciphertext = hex::decode(&file.encrypted_private_key).ok()?;

    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return None;
    }

    let derived = derive_key(&salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived));
    let nonce = Nonce::from_slice(&iv);

    let mut combined = ciphertext;
    combined.extend_from_slice(&tag);

    let plaintext = match cipher.decrypt(nonce, combined.as_slice()) {
        Ok(p) => p,
        Err(_) => {
            warn!("keystore decryption failed (bad tag, wrong salt, or wrong machine); falling back to unsigned mode");
            return None;
        }
    };

    let pem = String::from_utf8(plaintext).ok()?;
    let dalek_key = DalekSigningKey::from_pkcs8_pem(&pem).ok()?;
    Some(SigningKey(dalek_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_can_sign_and_verify() {
        let (key, file) = generate();
        let hash = "aa".repeat(32);
        let sig = key.sign_hex(&hash).unwrap();
        let vk = verifying_key_from_pem(&file.public_key_pem).unwrap();
        assert!(verify_signature(&vk, &hash, &sig));
    }

    #[test]
    fn tampered_hash_fails_verification() {
        let (key, file) = generate();
        let hash = "aa".repeat(32);
        let sig = key.sign_hex(&hash).unwrap();
        let vk = verifying_key_from_pem(&file.public_key_pem).unwrap();
        let other_hash = "bb".repeat(32);
        assert!(!verify_signature(&vk, &other_hash, &sig));
    }

    #[test]
    fn round_trip_open_decrypts_successfully() {
        let (_key, file) = generate();
        let reopened = open(&file);
        assert!(reopened.is_some());
    }

    #[test]
    fn corrupted_tag_falls_back_to_none_not_panic() {
        let (_key, mut file) = generate();
        file.tag = "00".repeat(16);
        let reopened = open(&file);
        assert!(reopened.is_none());
    }

    #[test]
    fn unsigned_signature_never_verifies() {
        let (_key, file) = generate();
        let vk = verifying_key_from_pem(&file.public_key_pem).unwrap();
        assert!(!verify_signature(&vk, &"aa".repeat(32), UNSIGNED));
    }
}
