//! Frame encoder: raw JPEG bytes to a text-safe base64 payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Base64 text of exactly one captured frame. Lives for one pipeline run.
#[derive(Debug, PartialEq, Eq)]
pub struct EncodedPayload(String);

impl EncodedPayload {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    EmptyInput,
    /// Output size overflowed or the allocator refused the reservation.
    Allocation { requested: usize },
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyInput => write!(f, "cannot encode an empty frame"),
            Self::Allocation { requested } => {
                write!(f, "failed to allocate {} bytes for base64 output", requested)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Encode `bytes` as padded standard base64 without line wrapping.
///
/// Output length is always `ceil(len / 3) * 4`. The output buffer is reserved
/// up front so an allocation failure surfaces as an error instead of an abort.
pub fn encode_frame(bytes: &[u8]) -> Result<EncodedPayload, EncodeError> {
    if bytes.is_empty() {
        return Err(EncodeError::EmptyInput);
    }
    let requested = base64::encoded_len(bytes.len(), true)
        .ok_or(EncodeError::Allocation { requested: usize::MAX })?;
    let mut out = String::new();
    out.try_reserve_exact(requested)
        .map_err(|_| EncodeError::Allocation { requested })?;
    BASE64.encode_string(bytes, &mut out);
    Ok(EncodedPayload(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_standard_decoder() {
        let inputs: [&[u8]; 4] = [b"a", b"ab", b"abc", &[0xFF, 0xD8, 0x00, 0x10, 0xFF, 0xD9, 0x7F]];
        for input in inputs {
            let encoded = encode_frame(input).unwrap();
            let decoded = BASE64.decode(encoded.as_str()).unwrap();
            assert_eq!(decoded, input);
        }
    }

    #[test]
    fn output_length_matches_padded_formula() {
        for len in 1..64usize {
            let input = vec![0xA5u8; len];
            let encoded = encode_frame(&input).unwrap();
            assert_eq!(encoded.len(), len.div_ceil(3) * 4);
            assert!(!encoded.as_str().contains('\n'));
        }
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(encode_frame(&[]), Err(EncodeError::EmptyInput));
    }
}
