use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

pub fn reversed32(bytes: &[u8; 32]) -> [u8; 32] {
    let mut out = *bytes;
    out.reverse();
    out
}

/// Parse a 64-char hex hash into exactly 32 bytes, keeping the byte order.
pub fn hash_from_hex(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// RPC hashes are displayed big-endian; internal (hashing) order is reversed.
pub fn uint256_from_display_hex(s: &str) -> Option<[u8; 32]> {
    hash_from_hex(s).map(|h| reversed32(&h))
}

/// Reverse the order of the eight 4-byte words, keeping bytes inside a word.
/// This is the layout stratum `mining.notify` expects for the previous hash.
pub fn reverse_word_order(hash: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, word) in hash.chunks_exact(4).enumerate() {
        let dst = 28 - i * 4;
        out[dst..dst + 4].copy_from_slice(word);
    }
    out
}

/// Bitcoin CompactSize.
pub fn var_int(n: u64) -> Vec<u8> {
    if n < 0xfd {
        vec![n as u8]
    } else if n <= 0xffff {
        let mut v = vec![0xfd];
        v.extend_from_slice(&(n as u16).to_le_bytes());
        v
    } else if n <= 0xffff_ffff {
        let mut v = vec![0xfe];
        v.extend_from_slice(&(n as u32).to_le_bytes());
        v
    } else {
        let mut v = vec![0xff];
        v.extend_from_slice(&n.to_le_bytes());
        v
    }
}

/// Script number push as used for the BIP34 height and the coinbase time:
/// small values use OP_1..OP_16, otherwise a length byte then little-endian bytes.
pub fn serialize_number(mut n: u64) -> Vec<u8> {
    if (1..=16).contains(&n) {
        return vec![0x50 + n as u8];
    }
    let mut out = vec![0u8];
    while n > 0x7f {
        out.push((n & 0xff) as u8);
        n >>= 8;
    }
    out.push(n as u8);
    out[0] = (out.len() - 1) as u8;
    out
}

pub fn serialize_string(s: &[u8]) -> Vec<u8> {
    let mut out = var_int(s.len() as u64);
    out.extend_from_slice(s);
    out
}

/// Parse an exact-width hex field (e.g. nTime, nonce) as a big-endian u32.
pub fn u32_from_hex(s: &str) -> Option<u32> {
    if s.len() != 8 {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_boundaries() {
        assert_eq!(var_int(0xfc), vec![0xfc]);
        assert_eq!(var_int(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(var_int(0x1_0000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(var_int(0x1_0000_0000)[0], 0xff);
        assert_eq!(var_int(0x1_0000_0000).len(), 9);
    }

    #[test]
    fn serialize_number_matches_coinbase_pushes() {
        assert_eq!(serialize_number(1), vec![0x51]);
        assert_eq!(serialize_number(16), vec![0x60]);
        assert_eq!(serialize_number(467), hex::decode("02d301").unwrap());
        assert_eq!(serialize_number(0x6337_8143), hex::decode("0443813763").unwrap());
        // High bit set on the last byte needs an extra zero byte.
        assert_eq!(serialize_number(0x80), hex::decode("028000").unwrap());
    }

    #[test]
    fn reverse_word_order_swaps_words_not_bytes() {
        let mut hash = [0u8; 32];
        for (i, b) in hash.iter_mut().enumerate() {
            *b = i as u8;
        }
        let out = reverse_word_order(&hash);
        assert_eq!(&out[..4], &[28, 29, 30, 31]);
        assert_eq!(&out[28..], &[0, 1, 2, 3]);
    }

    #[test]
    fn u32_from_hex_requires_eight_chars() {
        assert_eq!(u32_from_hex("495fab29"), Some(0x495f_ab29));
        assert_eq!(u32_from_hex("495fab2"), None);
        assert_eq!(u32_from_hex("zzzzzzzz"), None);
    }

    #[test]
    fn sha256d_of_empty_input() {
        assert_eq!(
            hex::encode(sha256d(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }
}
