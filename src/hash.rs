/// Address anonymization: salted link-layer address → 16-bit id.
///
/// The 48-bit address is widened to a `u64`, the salt is shifted into the top
/// 16 bits, the result is rendered as 16 uppercase hex digits and hashed with
/// Paul Hsieh's SuperFastHash. Only the low 16 bits are kept, so distinct
/// devices can collide; counts are an approximation by construction.
use core::fmt::Write;

use crate::salt::Salt;

/// Anonymized, salted device id. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnonymizedId(pub u16);

/// Big-endian 48-bit integer of a link-layer address.
pub fn address_to_u64(address: &[u8; 6]) -> u64 {
    address
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Combines an address with the current salt into an [`AnonymizedId`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MacHasher;

impl MacHasher {
    pub fn anonymize(&self, address: &[u8; 6], salt: Salt) -> AnonymizedId {
        let salted = address_to_u64(address) | ((salt.0 as u64) << 48);

        let mut hex: heapless::String<16> = heapless::String::new();
        // 16 hex digits always fit
        let _ = write!(hex, "{:016X}", salted);

        AnonymizedId(super_fast_hash(hex.as_bytes()) as u16)
    }
}

/// Paul Hsieh's SuperFastHash. Returns 0 for empty input.
pub fn super_fast_hash(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }

    let mut hash = data.len() as u32;
    let mut chunks = data.chunks_exact(4);

    for c in &mut chunks {
        hash = hash.wrapping_add(u16::from_le_bytes([c[0], c[1]]) as u32);
        let tmp = ((u16::from_le_bytes([c[2], c[3]]) as u32) << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        hash = hash.wrapping_add(hash >> 11);
    }

    let tail = chunks.remainder();
    match tail.len() {
        3 => {
            hash = hash.wrapping_add(u16::from_le_bytes([tail[0], tail[1]]) as u32);
            hash ^= hash << 16;
            hash ^= (tail[2] as i8 as i32 as u32) << 18;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            hash = hash.wrapping_add(u16::from_le_bytes([tail[0], tail[1]]) as u32);
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add(tail[0] as i8 as i32 as u32);
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }

    // Final avalanche
    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash = hash.wrapping_add(hash >> 6);

    hash
}
