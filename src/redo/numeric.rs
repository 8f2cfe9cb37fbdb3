//! Decimal decoding of the on-wire numeric format.
//!
//! A number is a digits-indicator byte followed by base-100 digit pairs.
//! `0x80` is zero. Above `0x80` the value is positive: the indicator
//! minus `0xC0` gives the pre-decimal pair count and each digit byte
//! encodes `pair + 1`. Below `0x80` the value is negative: `0x3F` minus
//! the indicator gives the pre-decimal pair count, digit bytes encode
//! `101 - pair`, and a trailing `0x66` terminator is stripped. Any other
//! shape is a parse error.

use crate::{Error, Result};

/// Decodes a wire number into its exact decimal text form.
pub fn decode_number(data: &[u8]) -> Result<String> {
    if data.is_empty() {
        return Err(Error::redo(60002, "empty numeric value"));
    }

    let indicator = data[0];
    if indicator == 0x80 {
        return Ok("0".to_string());
    }

    let negative = indicator < 0x80;
    let (pre_pairs, digits) = if negative {
        let mut digits = &data[1..];
        if let Some((&0x66, rest)) = digits.split_last() {
            digits = rest;
        }
        (0x3F_i32 - indicator as i32, decode_digits(digits, true)?)
    } else {
        (indicator as i32 - 0xC0_i32, decode_digits(&data[1..], false)?)
    };

    if digits.is_empty() {
        return Err(Error::redo(60002, format!("numeric value with no digits, indicator: {indicator:#04x}")));
    }

    Ok(render(negative, pre_pairs, &digits))
}

fn decode_digits(bytes: &[u8], negative: bool) -> Result<Vec<u8>> {
    let mut digits = Vec::with_capacity(bytes.len());
    for &b in bytes {
        let pair = if negative {
            if !(2..=101).contains(&b) {
                return Err(Error::redo(60002, format!("bad negative digit byte: {b:#04x}")));
            }
            101 - b
        } else {
            if !(1..=100).contains(&b) {
                return Err(Error::redo(60002, format!("bad digit byte: {b:#04x}")));
            }
            b - 1
        };
        digits.push(pair);
    }
    Ok(digits)
}

fn render(negative: bool, pre_pairs: i32, digits: &[u8]) -> String {
    let mut out = String::new();
    if negative {
        out.push('-');
    }

    if pre_pairs <= 0 {
        out.push('0');
    } else {
        let int_pairs = (pre_pairs as usize).min(digits.len());
        for (i, &pair) in digits[..int_pairs].iter().enumerate() {
            if i == 0 {
                out.push_str(&pair.to_string());
            } else {
                out.push_str(&format!("{pair:02}"));
            }
        }
        // Implied trailing zero pairs when the mantissa is shorter than
        // the pre-decimal pair count.
        for _ in int_pairs..pre_pairs as usize {
            out.push_str("00");
        }
    }

    let mut fraction = String::new();
    for _ in pre_pairs..0 {
        fraction.push_str("00");
    }
    let frac_start = (pre_pairs.max(0) as usize).min(digits.len());
    for &pair in &digits[frac_start..] {
        fraction.push_str(&format!("{pair:02}"));
    }
    while fraction.ends_with('0') {
        fraction.pop();
    }
    if !fraction.is_empty() {
        out.push('.');
        out.push_str(&fraction);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of [`decode_number`] over exact decimals, used to exercise
    /// the decode round trip.
    pub fn encode_number(text: &str) -> Vec<u8> {
        let negative = text.starts_with('-');
        let unsigned = text.trim_start_matches('-');
        let (int_part, frac_part) = match unsigned.split_once('.') {
            Some((i, f)) => (i.to_string(), f.to_string()),
            None => (unsigned.to_string(), String::new()),
        };

        if int_part.trim_start_matches('0').is_empty() && frac_part.trim_end_matches('0').is_empty() {
            return vec![0x80];
        }

        // Pad the integer part to whole pairs on the left, the fraction
        // on the right.
        let int_digits = int_part.trim_start_matches('0');
        let padded_int = if int_digits.len() % 2 == 1 {
            format!("0{int_digits}")
        } else {
            int_digits.to_string()
        };
        let padded_frac = if frac_part.len() % 2 == 1 {
            format!("{frac_part}0")
        } else {
            frac_part.clone()
        };

        let mut pairs: Vec<u8> = Vec::new();
        for chunk in padded_int.as_bytes().chunks(2) {
            pairs.push((chunk[0] - b'0') * 10 + (chunk[1] - b'0'));
        }
        let mut pre_pairs = pairs.len() as i32;
        for chunk in padded_frac.as_bytes().chunks(2) {
            pairs.push((chunk[0] - b'0') * 10 + (chunk[1] - b'0'));
        }
        // Leading zero pairs move into the exponent.
        while pairs.first() == Some(&0) {
            pairs.remove(0);
            pre_pairs -= 1;
        }
        while pairs.last() == Some(&0) {
            pairs.pop();
        }

        let mut out = Vec::with_capacity(pairs.len() + 2);
        if negative {
            out.push((0x3F - pre_pairs) as u8);
            for pair in &pairs {
                out.push(101 - pair);
            }
            out.push(0x66);
        } else {
            out.push((0xC0 + pre_pairs) as u8);
            for pair in &pairs {
                out.push(pair + 1);
            }
        }
        out
    }

    #[test]
    fn decodes_zero() {
        assert_eq!(decode_number(&[0x80]).unwrap(), "0");
    }

    #[test]
    fn decodes_small_positives() {
        assert_eq!(decode_number(&[0xC1, 0x02]).unwrap(), "1");
        assert_eq!(decode_number(&[0xC1, 0x03]).unwrap(), "2");
        assert_eq!(decode_number(&[0xC2, 0x02, 0x18]).unwrap(), "123");
        assert_eq!(decode_number(&[0xC2, 0x02]).unwrap(), "100");
    }

    #[test]
    fn decodes_fractions() {
        assert_eq!(decode_number(&[0xC0, 0x33]).unwrap(), "0.5");
        // 0.0001 = pair 01 at exponent -1
        assert_eq!(decode_number(&[0xBF, 0x02]).unwrap(), "0.0001");
        assert_eq!(decode_number(&[0xC1, 0x02, 0x33]).unwrap(), "1.5");
    }

    #[test]
    fn decodes_negatives() {
        assert_eq!(decode_number(&[0x3E, 0x64, 0x66]).unwrap(), "-1");
        assert_eq!(decode_number(&[0x3D, 0x64, 0x4E, 0x66]).unwrap(), "-123");
        assert_eq!(decode_number(&[0x3F, 0x33, 0x66]).unwrap(), "-0.5");
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(decode_number(&[]).is_err());
        assert!(decode_number(&[0xC1]).is_err());
        assert!(decode_number(&[0xC1, 0x00]).is_err());
        assert!(decode_number(&[0x3E, 0x01, 0x66]).is_err());
    }

    #[test]
    fn errors_are_recoverable() {
        assert!(!decode_number(&[0xC1]).unwrap_err().is_fatal());
    }

    #[test]
    fn encode_decode_identity() {
        for text in [
            "0", "1", "2", "10", "99", "100", "123", "1234", "12345", "0.5", "0.05", "1.5",
            "123.456", "9999999999", "0.0001", "-1", "-123", "-0.5", "-123.456", "-10000",
        ] {
            let wire = encode_number(text);
            assert_eq!(decode_number(&wire).unwrap(), text, "round trip of {text} via {wire:?}");
        }
    }
}
