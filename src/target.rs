use std::fmt;

/// 256-bit unsigned value stored big-endian. Used both for block targets and
/// for header hashes interpreted as integers, so the two compare directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target([u8; 32]);

/// Difficulty-1 target of Bitcoin, `0x00000000ffff0000...`.
pub const DIFF1: Target = {
    let mut bytes = [0u8; 32];
    bytes[4] = 0xff;
    bytes[5] = 0xff;
    Target(bytes)
};

impl Target {
    pub const fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Header hashes come out of sha256d little-endian.
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut b = *bytes;
        b.reverse();
        Self(b)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.trim_start_matches("0x");
        if s.is_empty() || s.len() > 64 {
            return None;
        }
        let padded = format!("{:0>64}", s);
        let bytes = hex::decode(padded).ok()?;
        bytes.try_into().ok().map(Self)
    }

    /// Expand compact `nBits`: the high byte is the size in bytes, the low
    /// three bytes the mantissa.
    pub fn from_compact(bits: u32) -> Option<Self> {
        let exponent = (bits >> 24) as usize;
        let mantissa = bits & 0x00ff_ffff;
        let mut out = [0u8; 32];
        if exponent <= 3 {
            let value = mantissa >> (8 * (3 - exponent));
            out[28..].copy_from_slice(&value.to_be_bytes());
        } else {
            if exponent > 32 {
                return None;
            }
            let start = 32 - exponent;
            out[start..start + 3].copy_from_slice(&mantissa.to_be_bytes()[1..]);
        }
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_f64(&self) -> f64 {
        self.0.iter().fold(0.0, |acc, b| acc * 256.0 + *b as f64)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.to_hex())
    }
}

/// Network difficulty of a target, rounded to nine decimals.
pub fn difficulty(target: &Target) -> f64 {
    let raw = DIFF1.to_f64() / target.to_f64();
    (raw * 1e9).round() / 1e9
}

/// Difficulty a hash meets, scaled by the algorithm's share multiplier.
pub fn share_difficulty(hash_value: &Target, multiplier: f64) -> f64 {
    DIFF1.to_f64() / hash_value.to_f64() * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_diff1_expands_to_diff1_constant() {
        assert_eq!(Target::from_compact(0x1d00ffff), Some(DIFF1));
        assert_eq!(difficulty(&DIFF1), 1.0);
    }

    #[test]
    fn known_mainnet_difficulty() {
        let target = Target::from_compact(0x1b0404cb).unwrap();
        assert_eq!(
            target.to_hex(),
            "00000000000404cb000000000000000000000000000000000000000000000000"
        );
        assert!((difficulty(&target) - 16307.420938524).abs() < 1e-6);
    }

    #[test]
    fn regtest_bits() {
        let target = Target::from_compact(0x207fffff).unwrap();
        assert_eq!(&target.as_bytes()[..3], &[0x7f, 0xff, 0xff]);
        assert!(Target::from_compact(0x21010000).is_none());
    }

    #[test]
    fn small_exponent_shifts_mantissa_down() {
        let target = Target::from_compact(0x02123456).unwrap();
        assert_eq!(&target.as_bytes()[28..], &[0, 0, 0x12, 0x34]);
    }

    #[test]
    fn explicit_hex_target_is_left_padded() {
        let t = Target::from_hex("ffff").unwrap();
        assert_eq!(&t.as_bytes()[30..], &[0xff, 0xff]);
        assert!(Target::from_hex("").is_none());
    }

    #[test]
    fn little_endian_hash_compares_as_integer() {
        let mut hash = [0u8; 32];
        hash[0] = 1; // least significant byte
        let small = Target::from_le_bytes(&hash);
        assert!(small < DIFF1);
        assert_eq!(small.to_f64(), 1.0);
    }
}
