//! Identity of a monitored target.

use std::collections::HashMap;

/// A byte that cannot occur in valid UTF-8, used to separate label names,
/// label values and the address from each other while hashing.
const SEPARATOR_BYTE: u8 = 255;

/// Marks the start of the address field, after all label pairs.
const ADDRESS_FIELD: &str = "__addr__";

// FNV-1a 64 bit.
const OFFSET64: u64 = 14695981039346656037;
const PRIME64: u64 = 1099511628211;

#[inline]
fn hash_add(mut h: u64, s: &str) -> u64 {
    for b in s.bytes() {
        h = hash_add_byte(h, b);
    }
    h
}

#[inline]
fn hash_add_byte(mut h: u64, b: u8) -> u64 {
    h ^= b as u64;
    h = h.wrapping_mul(PRIME64);
    h
}

/// Computes the fingerprint of `address` carrying `labels`.
///
/// Label names are sorted first, so the result does not depend on the
/// order labels were inserted in.  An empty label set is hashed like any
/// other, it only contributes nothing before the address.
pub fn fingerprint(address: &str, labels: &HashMap<String, String>) -> u64 {
    let mut names = labels.keys().collect::<Vec<_>>();
    names.sort_unstable();

    let mut sum = OFFSET64;
    for name in names {
        sum = hash_add(sum, name);
        sum = hash_add_byte(sum, SEPARATOR_BYTE);
        sum = hash_add(sum, &labels[name]);
        sum = hash_add_byte(sum, SEPARATOR_BYTE);
    }

    sum = hash_add(sum, ADDRESS_FIELD);
    sum = hash_add_byte(sum, SEPARATOR_BYTE);
    sum = hash_add(sum, address);
    hash_add_byte(sum, SEPARATOR_BYTE)
}
