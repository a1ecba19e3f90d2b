use crate::errors::{BridgeError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

/// Odd multiplier, so multiplication is a bijection modulo 2^64.
const MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;
const XOR_MASK: u64 = 0x5DEE_CE66_D5C4_C9B3;

/// Multiplicative inverse modulo 2^64 via Newton iteration over the
/// 2-adics; each step doubles the number of correct low bits.
const fn mul_inverse(a: u64) -> u64 {
    let mut x = a; // correct to 3 bits for odd a
    let mut i = 0;
    while i < 5 {
        x = x.wrapping_mul(2u64.wrapping_sub(a.wrapping_mul(x)));
        i += 1;
    }
    x
}

const INVERSE: u64 = mul_inverse(MULTIPLIER);

/// Encoded length of a transformed 8-byte id in unpadded base64.
const ENCODED_LEN: usize = 11;

/// Encode a message id as an opaque, URL-safe reference string.
///
/// This is obfuscation to discourage enumeration, not authentication.
pub fn encode(message_id: i64) -> String {
    let transformed = (message_id as u64).wrapping_mul(MULTIPLIER) ^ XOR_MASK;
    URL_SAFE_NO_PAD.encode(transformed.to_be_bytes())
}

/// Decode a reference string back to a message id. Rejects anything that is
/// not the exact image of a nonnegative 63-bit id under `encode`.
pub fn decode(encoded: &str) -> Result<i64> {
    if encoded.len() != ENCODED_LEN {
        return Err(BridgeError::InvalidReference);
    }
    let raw = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| BridgeError::InvalidReference)?;
    let bytes: [u8; 8] = raw.try_into().map_err(|_| BridgeError::InvalidReference)?;
    let transformed = u64::from_be_bytes(bytes) ^ XOR_MASK;
    let message_id = transformed.wrapping_mul(INVERSE);
    if message_id > i64::MAX as u64 {
        return Err(BridgeError::InvalidReference);
    }
    Ok(message_id as i64)
}
