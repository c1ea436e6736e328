//! Payload masking (RFC 6455 Section 5.3).
//!
//! Masking is an XOR with a 4-byte key repeated over the payload, so the same
//! operation both masks and unmasks.

use std::sync::atomic::{AtomicU32, Ordering};

/// Mixer state used only when the OS random source is unavailable.
static FALLBACK_STATE: AtomicU32 = AtomicU32::new(0x9E37_79B9);

/// Apply the masking key to `data` in place.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let mask_word = u32::from_ne_bytes(mask);
    let mut chunks = data.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ mask_word;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i];
    }
}

/// Generate a fresh masking key for one client frame.
#[must_use]
pub fn generate_mask() -> [u8; 4] {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_ok() {
        return buf;
    }
    let a = FALLBACK_STATE.fetch_add(0x9E37_79B9, Ordering::Relaxed);
    let b = a.wrapping_mul(0x85EB_CA6B);
    let c = b ^ (b >> 13);
    c.wrapping_mul(0xC2B2_AE35).to_le_bytes()
}
