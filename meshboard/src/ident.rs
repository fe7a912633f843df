//! Participant id generation.
//!
//! Each process picks exactly one id at startup: a wall-clock prefix plus a
//! 6-character random suffix. Ids only need to be unique across the handful
//! of participants sharing a board, and are compared as opaque strings.

use rand::Rng;

const SUFFIX_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SUFFIX_LEN: usize = 6;

/// Generate a fresh participant id.
pub fn generate() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();

    format!(
        "{:06}{:06}{}",
        now.as_secs() % 1_000_000,
        now.subsec_micros(),
        suffix
    )
}
