//! Base64 VLQ codec used by the `mappings` field of V3 source maps.

const B64: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const CONTINUATION_BIT: u8 = 0x20;
const VALUE_MASK: u8 = 0x1f;

/// VLQ-encode a signed integer and append to output string.
pub fn encode(value: i64, out: &mut String) {
    #[allow(clippy::cast_sign_loss)]
    let mut v = (if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    }) as u64;
    loop {
        let mut digit = (v & u64::from(VALUE_MASK)) as u8;
        v >>= 5;
        if v > 0 {
            digit |= CONTINUATION_BIT;
        }
        out.push(B64[digit as usize] as char);
        if v == 0 {
            break;
        }
    }
}

fn b64_value(byte: u8) -> Option<u8> {
    match byte {
        b'A'..=b'Z' => Some(byte - b'A'),
        b'a'..=b'z' => Some(byte - b'a' + 26),
        b'0'..=b'9' => Some(byte - b'0' + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Decode every VLQ value of one segment (the text between `,`/`;`).
///
/// Returns `None` on an invalid character, a dangling continuation bit, or a
/// value that overflows `i64`.
pub fn decode_segment(segment: &str) -> Option<Vec<i64>> {
    let mut values = Vec::with_capacity(5);
    let mut acc: u64 = 0;
    let mut shift: u32 = 0;
    let mut pending = false;

    for byte in segment.bytes() {
        let digit = b64_value(byte)?;
        if shift > 60 {
            return None;
        }
        acc |= u64::from(digit & VALUE_MASK) << shift;
        if digit & CONTINUATION_BIT == 0 {
            let magnitude = i64::try_from(acc >> 1).ok()?;
            values.push(if acc & 1 == 1 { -magnitude } else { magnitude });
            acc = 0;
            shift = 0;
            pending = false;
        } else {
            shift += 5;
            pending = true;
        }
    }

    if pending {
        return None;
    }
    Some(values)
}
