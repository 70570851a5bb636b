//! Payload escape parsing for config values (`will_message`, dummy `payload`).
//!
//! A value containing `\x` is treated as a sequence of `\xHH` units, each decoding
//! to one raw byte; the whole value must then be a run of such 4-character units.
//! A value without `\x` is taken as literal UTF-8 bytes.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("binary payload length is not a multiple of 4")]
    InvalidLength,

    #[error("expected '\\x' prefix at offset {0}")]
    BadPrefix(usize),

    #[error("could not parse hex digits {0:?}")]
    BadHex(String),
}

/// Parses a config value into raw bytes, decoding `\xHH` escapes if present.
///
/// On error, returns the best-effort partial decoding accumulated before the
/// failure alongside the error, so callers can choose to keep the partial
/// bytes rather than discard them.
pub fn parse_payload(arg: &str) -> Result<Vec<u8>, (Vec<u8>, PayloadError)> {
    if !arg.contains(r"\x") {
        return Ok(arg.as_bytes().to_vec());
    }

    if arg.len() % 4 != 0 {
        return Err((Vec::new(), PayloadError::InvalidLength));
    }

    let mut out = Vec::with_capacity(arg.len() / 4);
    let bytes = arg.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let unit = &arg[i..i + 4];
        if &unit[0..2] != r"\x" {
            return Err((out, PayloadError::BadPrefix(i)));
        }
        match u8::from_str_radix(&unit[2..4], 16) {
            Ok(b) => out.push(b),
            Err(_) => return Err((out, PayloadError::BadHex(unit[2..4].to_string()))),
        }
        i += 4;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_passthrough() {
        assert_eq!(parse_payload("hoge"), Ok(b"hoge".to_vec()));
    }

    #[test]
    fn decodes_escapes() {
        assert_eq!(
            parse_payload(r"\x11\x02\xff"),
            Ok(vec![0x11, 0x02, 0xff])
        );
    }

    #[test]
    fn wrong_length_is_error() {
        let err = parse_payload(r"\x01\x0211").unwrap_err();
        assert_eq!(err.0, Vec::<u8>::new());
        assert_eq!(err.1, PayloadError::InvalidLength);
    }

    #[test]
    fn bad_hex_returns_partial() {
        let err = parse_payload(r"\x01\xmm").unwrap_err();
        assert_eq!(err.0, vec![0x01]);
        assert!(matches!(err.1, PayloadError::BadHex(_)));
    }
}
