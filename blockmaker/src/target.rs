//! Compact difficulty encoding and the 256-bit target it stands for.
//!
//! Block headers carry the proof-of-work threshold in a 32-bit "compact"
//! floating point form: the high byte is a base-256 exponent, the low 23
//! bits a mantissa, and bit 23 a sign flag. A header hash meets the target
//! when, read as a little-endian 256-bit integer, it is less than or equal
//! to the expanded value.
//!
//! ```text
//! bits = 0x1d00ffff
//!        ^^ size (bytes)   ^^^^^^ mantissa
//! target = 0x00ffff << 8 * (0x1d - 3)
//! ```

use std::fmt;

use bitcoin::pow::CompactTarget;
use ruint::aliases::U256;
use thiserror::Error;

/// Sign bit inside the compact mantissa.
const SIGN_BIT: u32 = 0x0080_0000;

/// Mantissa mask (sign bit excluded).
const MANTISSA_MASK: u32 = 0x007f_ffff;

/// Errors produced when decoding compact bits.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("compact bits {0:#010x} encode a negative target")]
    Negative(u32),

    #[error("compact bits {0:#010x} overflow 256 bits")]
    Overflow(u32),
}

/// A decoded proof-of-work target.
///
/// Ordering is numeric; a larger target is an easier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DifficultyTarget(U256);

impl DifficultyTarget {
    /// Target of zero. Nothing but an all-zero hash can meet it.
    pub const ZERO: Self = Self(U256::ZERO);

    /// Expand compact bits, rejecting negative and overflowing encodings.
    pub fn from_compact(bits: CompactTarget) -> Result<Self, TargetError> {
        let raw = bits.to_consensus();
        let (value, negative, overflow) = decode(raw);
        if negative {
            return Err(TargetError::Negative(raw));
        }
        if overflow {
            return Err(TargetError::Overflow(raw));
        }
        Ok(Self(value))
    }

    /// Expand compact bits ignoring the sign and overflow flags.
    ///
    /// Matches what a header hash is compared against when the bits were
    /// already accepted by consensus.
    pub fn from_compact_lossy(bits: CompactTarget) -> Self {
        Self(decode(bits.to_consensus()).0)
    }

    /// Encode as compact bits, truncating the mantissa to 23 bits.
    pub fn to_compact(self) -> CompactTarget {
        CompactTarget::from_consensus(encode(self.0))
    }

    pub fn from_u256(value: U256) -> Self {
        Self(value)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    /// Whether a hash (little-endian byte order) is at or below the target.
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        U256::from_le_bytes(*hash) <= self.0
    }

    /// Difficulty relative to the conventional difficulty-1 target
    /// (`0x1d00ffff`). Lossy; for logs only.
    pub fn difficulty(&self) -> f64 {
        if self.0.is_zero() {
            return f64::INFINITY;
        }
        let one = decode(0x1d00_ffff).0;
        u256_to_f64(one) / u256_to_f64(self.0)
    }
}

impl fmt::Display for DifficultyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:064x}", self.0)
    }
}

/// Returns `(value, negative, overflow)`.
fn decode(compact: u32) -> (U256, bool, bool) {
    let size = (compact >> 24) as usize;
    let mut word = compact & MANTISSA_MASK;

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        // Shifting past 256 bits drops the value; the overflow flag covers it.
        U256::from(word)
            .checked_shl(8 * (size - 3))
            .unwrap_or(U256::ZERO)
    };

    let negative = word != 0 && (compact & SIGN_BIT) != 0;
    let overflow =
        word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));

    (value, negative, overflow)
}

fn encode(value: U256) -> u32 {
    let mut size = value.bit_len().div_ceil(8);
    let mut compact = if size <= 3 {
        (value.as_limbs()[0] << (8 * (3 - size))) as u32
    } else {
        (value >> (8 * (size - 3))).as_limbs()[0] as u32
    };

    // A set sign bit would read back as negative; move a byte into the
    // exponent instead.
    if compact & SIGN_BIT != 0 {
        compact >>= 8;
        size += 1;
    }

    compact | ((size as u32) << 24)
}

fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn bits(raw: u32) -> CompactTarget {
        CompactTarget::from_consensus(raw)
    }

    #[test_case(0x1d00ffff; "difficulty_one")]
    #[test_case(0x1b0404cb; "block_32255")]
    #[test_case(0x207fffff; "regtest")]
    #[test_case(0x1e0ffff0; "scrypt_genesis")]
    #[test_case(0x170331db; "mainnet_2020")]
    #[test_case(0x03123456; "three_byte_mantissa")]
    #[test_case(0x02008000; "sign_bit_promoted")]
    fn compact_round_trips(raw: u32) {
        let target = DifficultyTarget::from_compact(bits(raw)).unwrap();
        assert_eq!(target.to_compact(), bits(raw));

        let again = DifficultyTarget::from_compact(target.to_compact()).unwrap();
        assert_eq!(again, target);
    }

    #[test]
    fn difficulty_one_expands_to_known_value() {
        let target = DifficultyTarget::from_compact(bits(0x1d00ffff)).unwrap();
        let expected = U256::from(0xffffu64) << 208;
        assert_eq!(target.as_u256(), expected);
        assert!((target.difficulty() - 1.0).abs() < 1e-9);
    }

    #[test_case(0x01003456, 0x00; "size_one_shifts_out")]
    #[test_case(0x01123456, 0x12; "size_one")]
    #[test_case(0x02123456, 0x1234; "size_two")]
    #[test_case(0x03123456, 0x123456; "size_three")]
    #[test_case(0x00123456, 0x00; "size_zero")]
    fn small_exponents_shift_right(raw: u32, expected: u64) {
        let target = DifficultyTarget::from_compact(bits(raw)).unwrap();
        assert_eq!(target.as_u256(), U256::from(expected));
    }

    #[test]
    fn negative_bits_are_rejected() {
        assert_eq!(
            DifficultyTarget::from_compact(bits(0x04923456)),
            Err(TargetError::Negative(0x04923456))
        );
        // Sign bit with a zero mantissa is not negative.
        assert_eq!(
            DifficultyTarget::from_compact(bits(0x01803456)).unwrap(),
            DifficultyTarget::ZERO
        );
    }

    #[test_case(0xff123456; "huge_exponent")]
    #[test_case(0x23000100; "two_byte_word_at_35")]
    #[test_case(0x22010000; "three_byte_word_at_34")]
    fn overflowing_bits_are_rejected(raw: u32) {
        assert_eq!(
            DifficultyTarget::from_compact(bits(raw)),
            Err(TargetError::Overflow(raw))
        );
    }

    #[test]
    fn encode_normalizes_sign_bit() {
        let target = DifficultyTarget::from_u256(U256::from(0x80u64));
        assert_eq!(target.to_compact(), bits(0x02008000));
        assert_eq!(DifficultyTarget::ZERO.to_compact(), bits(0));
    }

    #[test]
    fn encode_truncates_low_bits() {
        let target = DifficultyTarget::from_u256(U256::from(0x1234_5678u64));
        assert_eq!(target.to_compact(), bits(0x04123456));
    }

    #[test]
    fn hash_comparison_is_little_endian() {
        let target = DifficultyTarget::from_compact(bits(0x1d00ffff)).unwrap();

        // Everything below the target's mantissa bytes: meets target.
        let mut easy = [0xffu8; 32];
        easy[26..].fill(0);
        assert!(target.is_met_by(&easy));

        // Any set bit above the target's top byte fails.
        let mut hard = [0u8; 32];
        hard[31] = 0x01;
        assert!(!target.is_met_by(&hard));

        // Equality counts as a hit.
        assert!(target.is_met_by(&target.as_u256().to_le_bytes::<32>()));
    }

    #[test]
    fn ordering_follows_numeric_value() {
        let easy = DifficultyTarget::from_compact(bits(0x207fffff)).unwrap();
        let hard = DifficultyTarget::from_compact(bits(0x1d00ffff)).unwrap();
        assert!(easy > hard);
        assert!(easy.difficulty() < hard.difficulty());
    }
}
