//! Variable-length integers for cell headers.
//!
//! A varint is 1 to 9 bytes. The first eight bytes carry 7 bits each, most
//! significant group first, with the high bit set on every byte except the
//! last. A ninth byte, if present, contributes all 8 bits.
//!
//! ```text
//! 0x00                      becomes  0x00000000
//! 0x7f                      becomes  0x0000007f
//! 0x81 0x00                 becomes  0x00000080
//! 0x82 0x00                 becomes  0x00000100
//! 0x8a 0x91 0xd1 0xac 0x78  becomes  0x12345678
//! ```
//!
//! All functions are pure and allocation free.

/// Values with any of these bits set need the 9-byte form.
const NINE_BYTE_MASK: u64 = 0xff00_0000 << 32;

/// Longest encoding in bytes.
pub const MAX_VARINT_LEN: usize = 9;

pub fn varint_len(value: u64) -> usize {
    if value & NINE_BYTE_MASK != 0 {
        return 9;
    }
    let mut v = value;
    let mut n = 1;
    while v > 0x7f {
        v >>= 7;
        n += 1;
    }
    n
}

/// Encode `value` at the start of `buf`, returning the number of bytes
/// written.
///
/// # Panics
/// Panics if `buf` is shorter than [`varint_len(value)`](varint_len).
pub fn put_varint(buf: &mut [u8], value: u64) -> usize {
    if value & NINE_BYTE_MASK != 0 {
        let mut v = value;
        buf[8] = v as u8;
        v >>= 8;
        for i in (0..8).rev() {
            buf[i] = ((v & 0x7f) | 0x80) as u8;
            v >>= 7;
        }
        return 9;
    }

    let n = varint_len(value);
    let mut v = value;
    for i in (0..n).rev() {
        let continuation = if i == n - 1 { 0 } else { 0x80 };
        buf[i] = ((v & 0x7f) as u8) | continuation;
        v >>= 7;
    }
    n
}

/// Decode a varint from the start of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if `buf`
/// ends in the middle of the encoding.
pub fn get_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for i in 0..8 {
        let byte = *buf.get(i)?;
        value = (value << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    let last = *buf.get(8)?;
    Some(((value << 8) | last as u64, 9))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u64) -> usize {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let n = put_varint(&mut buf, value);
        assert_eq!(n, varint_len(value), "length of {:#x}", value);
        assert_eq!(get_varint(&buf[..n]), Some((value, n)), "decode of {:#x}", value);
        n
    }

    #[test]
    fn test_documented_encodings() {
        assert_eq!(get_varint(&[0x00]), Some((0, 1)));
        assert_eq!(get_varint(&[0x7f]), Some((0x7f, 1)));
        assert_eq!(get_varint(&[0x81, 0x00]), Some((0x80, 2)));
        assert_eq!(get_varint(&[0x82, 0x00]), Some((0x100, 2)));
        assert_eq!(get_varint(&[0x80, 0x7f]), Some((0x7f, 2)));
        assert_eq!(
            get_varint(&[0x8a, 0x91, 0xd1, 0xac, 0x78]),
            Some((0x1234_5678, 5))
        );
        assert_eq!(
            get_varint(&[0x81, 0x81, 0x81, 0x81, 0x01]),
            Some((0x1020_4081, 5))
        );

        let mut buf = [0u8; 9];
        assert_eq!(put_varint(&mut buf, 0x1234_5678), 5);
        assert_eq!(&buf[..5], &[0x8a, 0x91, 0xd1, 0xac, 0x78]);
    }

    #[test]
    fn test_length_boundaries() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(0x7f), 1);
        assert_eq!(roundtrip(0x80), 2);
        assert_eq!(roundtrip(0x3fff), 2);
        assert_eq!(roundtrip(0x4000), 3);
        assert_eq!(roundtrip((1 << 56) - 1), 8);
        assert_eq!(roundtrip(1 << 56), 9);
        assert_eq!(roundtrip(u64::MAX), 9);
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(get_varint(&[]), None);
        assert_eq!(get_varint(&[0x81]), None);
        assert_eq!(get_varint(&[0xff; 8]), None);
        assert_eq!(get_varint(&[0xff; 9]), Some((u64::MAX, 9)));
    }
}
