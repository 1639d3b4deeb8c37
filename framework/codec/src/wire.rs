//! Binary encoding of call arguments and results.
//!
//! Fixed-width numbers are written as their native in-memory representation and strings as a
//! native-endian `u32` length followed by the raw bytes. There is no versioning and no byte order
//! negotiation, so both ends of a connection must run on hosts with the same endianness.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::CodecError;

/// Append the encoding of a value to an output buffer.
pub trait WireEncode {
    fn encode(&self, out: &mut BytesMut);
}

/// Consume exactly the bytes of one value from the front of an input buffer.
///
/// On error the cursor position is unspecified and the input should be discarded.
pub trait WireDecode: Sized {
    fn decode<B: Buf>(input: &mut B) -> Result<Self, CodecError>;
}

fn read_exact<B: Buf>(input: &mut B, out: &mut [u8]) -> Result<(), CodecError> {
    if input.remaining() < out.len() {
        return Err(CodecError::Truncated {
            needed: out.len(),
            remaining: input.remaining(),
        });
    }
    input.copy_to_slice(out);
    Ok(())
}

macro_rules! impl_arithmetic {
    ($($t:ty),* $(,)?) => {
        $(
            impl WireEncode for $t {
                fn encode(&self, out: &mut BytesMut) {
                    out.put_slice(&self.to_ne_bytes());
                }
            }

            impl WireDecode for $t {
                fn decode<B: Buf>(input: &mut B) -> Result<Self, CodecError> {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    read_exact(input, &mut raw)?;
                    Ok(<$t>::from_ne_bytes(raw))
                }
            }
        )*
    };
}

impl_arithmetic!(u8, i32, u32, i64, u64, f64);

impl WireEncode for () {
    fn encode(&self, _out: &mut BytesMut) {}
}

impl WireDecode for () {
    fn decode<B: Buf>(_input: &mut B) -> Result<Self, CodecError> {
        Ok(())
    }
}

impl WireEncode for str {
    /// Strings longer than `u32::MAX` bytes cannot be represented and must not be sent.
    fn encode(&self, out: &mut BytesMut) {
        debug_assert!(self.len() <= u32::MAX as usize);
        (self.len() as u32).encode(out);
        out.put_slice(self.as_bytes());
    }
}

impl WireEncode for String {
    fn encode(&self, out: &mut BytesMut) {
        self.as_str().encode(out)
    }
}

impl WireDecode for String {
    fn decode<B: Buf>(input: &mut B) -> Result<Self, CodecError> {
        let len = u32::decode(input)? as usize;
        if input.remaining() < len {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: input.remaining(),
            });
        }
        let mut raw = vec![0u8; len];
        input.copy_to_slice(&mut raw);

        Ok(String::from_utf8(raw)?)
    }
}

/// Encode a single value into its own buffer.
pub fn encode_payload<T: WireEncode + ?Sized>(value: &T) -> Bytes {
    let mut out = BytesMut::new();
    value.encode(&mut out);
    out.freeze()
}

/// Decode a payload that must contain exactly one value.
pub fn decode_payload<T: WireDecode>(mut payload: Bytes) -> Result<T, CodecError> {
    let value = T::decode(&mut payload)?;
    if payload.has_remaining() {
        return Err(CodecError::TrailingBytes(payload.remaining()));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumed_by<T: WireDecode>(encoded: &Bytes) -> (T, usize) {
        let mut input = encoded.clone();
        let value = T::decode(&mut input).unwrap();
        (value, encoded.len() - input.remaining())
    }

    #[test]
    fn u64_max_roundtrip() {
        let encoded = encode_payload(&u64::MAX);
        assert_eq!(8, encoded.len());

        let (decoded, consumed) = consumed_by::<u64>(&encoded);
        assert_eq!(u64::MAX, decoded);
        assert_eq!(8, consumed);
    }

    #[test]
    fn numbers_use_native_byte_order() {
        let encoded = encode_payload(&0x0102_0304_i32);
        assert_eq!(&0x0102_0304_i32.to_ne_bytes()[..], &encoded[..]);
    }

    #[test]
    fn signed_and_float_values_are_bit_identical() {
        for value in [i64::MIN, -1, 0, i64::MAX] {
            assert_eq!(value, decode_payload::<i64>(encode_payload(&value)).unwrap());
        }
        for value in [i32::MIN, -7, i32::MAX] {
            assert_eq!(value, decode_payload::<i32>(encode_payload(&value)).unwrap());
        }
        for value in [0.0, -0.0, f64::MIN_POSITIVE, f64::INFINITY, f64::NAN, 1.0 / 3.0] {
            let decoded = decode_payload::<f64>(encode_payload(&value)).unwrap();
            assert_eq!(value.to_bits(), decoded.to_bits());
        }
    }

    #[test]
    fn empty_string_consumes_length_prefix_only() {
        let encoded = encode_payload("");
        let (decoded, consumed) = consumed_by::<String>(&encoded);

        assert_eq!("", decoded);
        assert_eq!(4, consumed);
    }

    #[test]
    fn string_consumes_prefix_and_bytes() {
        let value = "hello, wörld".to_string();
        let mut encoded = BytesMut::new();
        value.encode(&mut encoded);
        42u64.encode(&mut encoded);
        let encoded = encoded.freeze();

        let mut input = encoded.clone();
        let decoded = String::decode(&mut input).unwrap();
        assert_eq!(value, decoded);
        assert_eq!(4 + value.len(), encoded.len() - input.remaining());
        assert_eq!(42, u64::decode(&mut input).unwrap());
    }

    #[test]
    fn truncated_number_is_an_error() {
        let mut input = Bytes::from_static(&[1, 2, 3]);
        let err = u32::decode(&mut input).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                needed: 4,
                remaining: 3
            }
        ));
    }

    #[test]
    fn truncated_string_is_an_error() {
        let encoded = encode_payload("truncated");
        let mut input = encoded.slice(..encoded.len() - 1);

        let err = String::decode(&mut input).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 9, .. }));
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut encoded = BytesMut::new();
        2u32.encode(&mut encoded);
        encoded.put_slice(&[0xff, 0xfe]);

        let err = decode_payload::<String>(encoded.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::InvalidUtf8(_)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = BytesMut::new();
        7u64.encode(&mut encoded);
        encoded.put_u8(0);

        let err = decode_payload::<u64>(encoded.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes(1)));
    }

    #[test]
    fn unit_is_empty() {
        assert!(encode_payload(&()).is_empty());
        decode_payload::<()>(Bytes::new()).unwrap();
    }
}
