//! Answer decoding before comparison.

use crate::config::types::{LabError, Result};
use crate::lab::definition::DecodeMethod;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Decode a submitted answer according to its checkpoint's method.
///
/// Hash methods do not invert anything: the student submits the digest and
/// it is normalized to trimmed lower-case hex.
pub fn decode(answer: &str, method: DecodeMethod) -> Result<String> {
    match method {
        DecodeMethod::Plain => Ok(answer.to_string()),
        DecodeMethod::Base64 => {
            let bytes = STANDARD
                .decode(answer.trim())
                .map_err(|e| LabError::Decode(format!("invalid base64: {}", e)))?;
            utf8(bytes)
        }
        DecodeMethod::Hex => {
            let bytes = hex::decode(answer.trim())
                .map_err(|e| LabError::Decode(format!("invalid hex: {}", e)))?;
            utf8(bytes)
        }
        DecodeMethod::Reverse => Ok(answer.chars().rev().collect()),
        DecodeMethod::Md5 | DecodeMethod::Sha1 | DecodeMethod::Sha256 => {
            Ok(answer.trim().to_lowercase())
        }
    }
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| LabError::Decode("decoded bytes are not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_decodes() {
        assert_eq!(decode("c2VjcmV0", DecodeMethod::Base64).unwrap(), "secret");
        assert_eq!(decode(" c2VjcmV0\n", DecodeMethod::Base64).unwrap(), "secret");
    }

    #[test]
    fn malformed_base64_is_a_decode_error() {
        assert!(matches!(
            decode("not base64!", DecodeMethod::Base64),
            Err(LabError::Decode(_))
        ));
    }

    #[test]
    fn hex_and_reverse() {
        assert_eq!(decode("736563726574", DecodeMethod::Hex).unwrap(), "secret");
        assert!(decode("zz", DecodeMethod::Hex).is_err());
        assert_eq!(decode("terces", DecodeMethod::Reverse).unwrap(), "secret");
    }

    #[test]
    fn digests_are_normalized() {
        assert_eq!(decode(" ABCDEF \n", DecodeMethod::Sha256).unwrap(), "abcdef");
        assert_eq!(decode("Plain Text", DecodeMethod::Plain).unwrap(), "Plain Text");
    }
}
