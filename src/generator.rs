//! Random code generation.
//!
//! Codes are drawn uniformly from `[A-Z0-9]` using the thread-local CSPRNG.
//! Every call yields new values; replacement records for a shortfall are
//! produced by simply calling [`generate`] again.

use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::model::{CodeRecord, CodeStatus};

pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A single random code of `length` characters.
pub fn random_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Produce `count` fresh records tagged with `batch` and `sequence`.
pub fn generate(count: usize, code_length: usize, batch: &str, sequence: &str) -> Vec<CodeRecord> {
    let now = Utc::now();
    (0..count)
        .map(|_| CodeRecord {
            id: Uuid::new_v4().to_string(),
            value: random_code(code_length),
            batch: batch.to_string(),
            sequence: sequence.to_string(),
            status: CodeStatus::Generated,
            created_at: now,
            updated_at: now,
        })
        .collect()
}

/// Batch tag used when a request does not carry one: `yyyyMMddHHmmss` plus 8 hex chars.
pub fn batch_number(now: DateTime<Utc>) -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{}{}", now.format("%Y%m%d%H%M%S"), &simple[..8])
}
