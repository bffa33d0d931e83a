//! LEB128 variable-length integer decoding.

/// Decodes an unsigned LEB128 value. Returns `(value, bytes_consumed)`.
#[must_use]
pub fn decode_uleb128(data: &[u8]) -> Option<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None; // overlong encoding
        }
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
        shift += 7;
    }
    None // ran out of input mid-value
}

/// Decodes a signed LEB128 value. Returns `(value, bytes_consumed)`.
#[must_use]
pub fn decode_sleb128(data: &[u8]) -> Option<(i64, usize)> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        result |= i64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            // Sign-extend if the sign bit of the last byte is set.
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Some((result, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb_single_byte() {
        assert_eq!(decode_uleb128(&[0x00]), Some((0, 1)));
        assert_eq!(decode_uleb128(&[0x7F]), Some((127, 1)));
    }

    #[test]
    fn uleb_multi_byte() {
        // 624485 = 0xE5 0x8E 0x26
        assert_eq!(decode_uleb128(&[0xE5, 0x8E, 0x26]), Some((624_485, 3)));
    }

    #[test]
    fn uleb_truncated() {
        assert_eq!(decode_uleb128(&[0x80]), None);
        assert_eq!(decode_uleb128(&[]), None);
    }

    #[test]
    fn sleb_positive_and_negative() {
        assert_eq!(decode_sleb128(&[0x02]), Some((2, 1)));
        assert_eq!(decode_sleb128(&[0x7E]), Some((-2, 1)));
        // -123456 = 0xC0 0xBB 0x78
        assert_eq!(decode_sleb128(&[0xC0, 0xBB, 0x78]), Some((-123_456, 3)));
    }

    #[test]
    fn sleb_truncated() {
        assert_eq!(decode_sleb128(&[0xFF]), None);
    }
}
