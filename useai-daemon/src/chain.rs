//! Chain codec (component A): build, hash, sign, and verify append-only
//! chain records.
//!
//! Grounded on `audit.rs`'s `AuditBlock::compute_hash` / `AuditBlock::verify`
//! / `AuditLogger::append` shape — one write path that hashes the previous
//! block's hash together with the new block's fields — generalized from a
//! single SHA-256-only event type to the five-field, Ed25519-signed
//! `ChainRecord`.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};
use useai_types::{ChainRecord, ChainRecordCore, RecordType, GENESIS_HASH, UNSIGNED};

use crate::keystore::SigningKey;

fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// `hash = SHA-256(canonical_json({id,type,session_id,timestamp,data}) || prev_hash)`.
pub fn compute_hash(core: &ChainRecordCore<'_>, prev_hash: &str) -> String {
    let canonical = serde_json::to_vec(core).expect("ChainRecordCore always serializes");
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hasher.update(prev_hash.as_bytes());
    to_hex(&hasher.finalize())
}

/// Ed25519 signature over the raw hash bytes, or `"unsigned"` if no key is
/// supplied or the key cannot sign.
pub fn sign_hash(hash: &str, key: Option<&SigningKey>) -> String {
    match key.and_then(|k| k.sign_hex(hash)) {
        Some(sig) => sig,
        None => UNSIGNED.to_string(),
    }
}

/// Allocates a fresh id, stamps the current time, computes the hash, signs
/// it, and returns the fully formed record.
pub fn build_chain_record(
    record_type: RecordType,
    session_id: &str,
    data: serde_json::Map<String, serde_json::Value>,
    prev_hash: &str,
    key: Option<&SigningKey>,
) -> ChainRecord {
    let id = format!("r-{}", uuid::Uuid::new_v4().simple());
    let timestamp = chrono::Utc::now();

    let core = ChainRecordCore {
        id: &id,
        record_type,
        session_id,
        timestamp,
        data: &data,
    };
    let hash = compute_hash(&core, prev_hash);
    let signature = sign_hash(&hash, key);

    ChainRecord {
        id,
        record_type,
        session_id: session_id.to_string(),
        timestamp,
        data,
        prev_hash: prev_hash.to_string(),
        hash,
        signature,
    }
}

/// Recomputes a single record's hash and compares it against `expected_prev`
/// and the record's own stored hash.
pub fn verify_chain_record(record: &ChainRecord, expected_prev: &str) -> bool {
    if record.prev_hash != expected_prev {
        return false;
    }
    let core = ChainRecordCore {
        id: &record.id,
        record_type: record.record_type,
        session_id: &record.session_id,
        timestamp: record.timestamp,
        data: &record.data,
    };
    compute_hash(&core, &record.prev_hash) == record.hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    pub signature_valid: bool,
    pub broken_at: Option<usize>,
}

/// Walks the chain from `GENESIS`, returning the first index that breaks
/// hash linkage. Hash failures take precedence over signature failures: a
/// chain with a broken hash is reported broken at that index regardless of
/// what the signatures say.
///
/// With no public key supplied, `signature_valid` is `true` only for the
/// empty chain (there is nothing to fail to verify); otherwise `false` — the
/// absence of a key to check against is reported, not silently accepted.
pub fn verify_chain(
    records: &[ChainRecord],
    public_key_pem: Option<&str>,
) -> ChainVerification {
    let mut prev_hash = GENESIS_HASH.to_string();
    let mut broken_at = None;

    for (idx, record) in records.iter().enumerate() {
        if !verify_chain_record(record, &prev_hash) {
            broken_at = Some(idx);
            break;
        }
        prev_hash = record.hash.clone();
    }

    let valid = broken_at.is_none();

    let signature_valid = if !valid {
        false
    } else {
        match public_key_pem {
            None => records.is_empty(),
            Some(pem) => {
                let verifying_key = crate::keystore::verifying_key_from_pem(pem);
                match verifying_key {
                    Some(vk) => records
                        .iter()
                        .all(|r| crate::keystore::verify_signature(&vk, &r.hash, &r.signature)),
                    None => false,
                }
            }
        }
    };

    ChainVerification {
        valid,
        signature_valid,
        broken_at,
    }
}
