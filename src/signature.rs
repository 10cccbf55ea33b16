//! Canonical signature strings for native trampoline lookup
//!
//! A method signature is rendered as one short ASCII string: the return
//! token followed by one token per parameter, concatenated. The string is
//! the exact-match key into the process-wide trampoline table, and the
//! grammar is a wire-level contract: any independently built table must
//! produce byte-identical keys.
//!
//! Token grammar:
//!
//! | token        | meaning                                   |
//! |--------------|-------------------------------------------|
//! | `v`          | void (return position only)               |
//! | `i1 i2 i4 i8`| integer / register-width value            |
//! | `r4 r8`      | float / double                            |
//! | `vf2..vf4`   | HFA of 2-4 f32 fields                     |
//! | `vd2..vd4`   | HFA of 2-4 f64 fields                     |
//! | `a12..a32`   | size-bucketed aggregate                   |
//! | `p<n>`       | by-reference aggregate of n 8-byte slots  |

use std::fmt::Write as _;

use crate::abi::{classify_type, AbiClass, AbiError};
use crate::metadata::{FloatWidth, MetadataStore, TypeToken};

/// Errors decoding a signature string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigError {
    /// Unexpected byte at the given position.
    UnexpectedToken { pos: usize, byte: u8 },
    /// String ended inside a token.
    Truncated,
    /// Empty input (a signature always has a return token).
    Empty,
    /// Classification failed while encoding.
    Abi(AbiError),
}

impl std::fmt::Display for SigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedToken { pos, byte } => {
                write!(f, "unexpected byte 0x{:02x} at position {}", byte, pos)
            }
            Self::Truncated => write!(f, "signature string truncated"),
            Self::Empty => write!(f, "empty signature string"),
            Self::Abi(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SigError {}

impl From<AbiError> for SigError {
    fn from(e: AbiError) -> Self {
        Self::Abi(e)
    }
}

/// Render one ABI class as its signature token.
pub fn encode_class(class: AbiClass, out: &mut String) {
    match class {
        AbiClass::Void => out.push('v'),
        AbiClass::I1 => out.push_str("i1"),
        AbiClass::I2 => out.push_str("i2"),
        AbiClass::I4 => out.push_str("i4"),
        AbiClass::I8 => out.push_str("i8"),
        AbiClass::R4 => out.push_str("r4"),
        AbiClass::R8 => out.push_str("r8"),
        AbiClass::Hfa(FloatWidth::F32, n) => {
            let _ = write!(out, "vf{}", n);
        }
        AbiClass::Hfa(FloatWidth::F64, n) => {
            let _ = write!(out, "vd{}", n);
        }
        AbiClass::Agg(size) => {
            let _ = write!(out, "a{}", size);
        }
        AbiClass::ByRef(slots) => {
            let _ = write!(out, "p{}", slots);
        }
    }
}

/// Encode a full method signature: return type (None = void) then params.
pub fn encode_method(
    store: &MetadataStore,
    ret: Option<TypeToken>,
    params: &[TypeToken],
) -> Result<String, SigError> {
    let mut out = String::with_capacity(2 + params.len() * 2);
    match ret {
        None => out.push('v'),
        Some(t) => encode_class(classify_type(store, t)?, &mut out),
    }
    for &p in params {
        encode_class(classify_type(store, p)?, &mut out);
    }
    Ok(out)
}

/// Decode a signature string back into (return class, parameter classes).
pub fn decode(sig: &str) -> Result<(AbiClass, Vec<AbiClass>), SigError> {
    let bytes = sig.as_bytes();
    if bytes.is_empty() {
        return Err(SigError::Empty);
    }
    let mut pos = 0usize;
    let ret = decode_one(bytes, &mut pos, true)?;
    let mut params = Vec::new();
    while pos < bytes.len() {
        params.push(decode_one(bytes, &mut pos, false)?);
    }
    Ok((ret, params))
}

fn decode_one(bytes: &[u8], pos: &mut usize, ret_position: bool) -> Result<AbiClass, SigError> {
    let start = *pos;
    let b = *bytes.get(*pos).ok_or(SigError::Truncated)?;
    *pos += 1;
    match b {
        b'v' => {
            // `v` alone is void; `vf<n>`/`vd<n>` are HFAs.
            match bytes.get(*pos) {
                Some(b'f') | Some(b'd') => {
                    let width = if bytes[*pos] == b'f' {
                        FloatWidth::F32
                    } else {
                        FloatWidth::F64
                    };
                    *pos += 1;
                    let n = *bytes.get(*pos).ok_or(SigError::Truncated)?;
                    *pos += 1;
                    match n {
                        b'2'..=b'4' => Ok(AbiClass::Hfa(width, n - b'0')),
                        _ => Err(SigError::UnexpectedToken { pos: *pos - 1, byte: n }),
                    }
                }
                _ if ret_position => Ok(AbiClass::Void),
                _ => Err(SigError::UnexpectedToken { pos: start, byte: b }),
            }
        }
        b'i' => {
            let n = *bytes.get(*pos).ok_or(SigError::Truncated)?;
            *pos += 1;
            match n {
                b'1' => Ok(AbiClass::I1),
                b'2' => Ok(AbiClass::I2),
                b'4' => Ok(AbiClass::I4),
                b'8' => Ok(AbiClass::I8),
                _ => Err(SigError::UnexpectedToken { pos: *pos - 1, byte: n }),
            }
        }
        b'r' => {
            let n = *bytes.get(*pos).ok_or(SigError::Truncated)?;
            *pos += 1;
            match n {
                b'4' => Ok(AbiClass::R4),
                b'8' => Ok(AbiClass::R8),
                _ => Err(SigError::UnexpectedToken { pos: *pos - 1, byte: n }),
            }
        }
        b'a' => {
            let size = decode_number(bytes, pos)?;
            match size {
                12 | 16 | 20 | 24 | 28 | 32 => Ok(AbiClass::Agg(size)),
                _ => Err(SigError::UnexpectedToken { pos: start, byte: b }),
            }
        }
        b'p' => {
            let slots = decode_number(bytes, pos)?;
            if slots == 0 {
                return Err(SigError::UnexpectedToken { pos: start, byte: b });
            }
            Ok(AbiClass::ByRef(slots))
        }
        other => Err(SigError::UnexpectedToken { pos: start, byte: other }),
    }
}

fn decode_number(bytes: &[u8], pos: &mut usize) -> Result<u32, SigError> {
    let start = *pos;
    let mut value: u32 = 0;
    while let Some(&b) = bytes.get(*pos) {
        if !b.is_ascii_digit() {
            break;
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u32::from(b - b'0')))
            .ok_or(SigError::UnexpectedToken { pos: *pos, byte: b })?;
        *pos += 1;
    }
    if *pos == start {
        return Err(SigError::Truncated);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::classify_value;
    use crate::metadata::{MetadataStore, PrimKind, TypeDesc};

    #[test]
    fn test_encode_simple_method() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let r8 = store.add_type(TypeDesc::primitive("System.Double", PrimKind::R8));

        let sig = encode_method(&store, Some(i4), &[i4, i4]).unwrap();
        assert_eq!(sig, "i4i4i4");

        let sig = encode_method(&store, None, &[r8]).unwrap();
        assert_eq!(sig, "vr8");
    }

    #[test]
    fn test_encode_hfa_and_aggregates() {
        let mut store = MetadataStore::new();
        let vec2 = store.add_type(TypeDesc::value("Vec2", 8, 4).with_hfa(FloatWidth::F32, 2));
        let vec3d = store.add_type(TypeDesc::value("Vec3d", 24, 8).with_hfa(FloatWidth::F64, 3));
        let m20 = store.add_type(TypeDesc::value("M20", 20, 4));
        let big = store.add_type(TypeDesc::value("Big", 33, 8));

        let sig = encode_method(&store, Some(vec2), &[vec3d, m20, big]).unwrap();
        assert_eq!(sig, "vf2vd3a20p5");
    }

    #[test]
    fn test_decode_roundtrip_all_sizes() {
        // The classification of every size in the contract set survives an
        // encode/decode round trip.
        for size in [1u32, 2, 4, 8, 12, 16, 20, 24, 28, 32, 33] {
            let class = classify_value(size, 8, None).unwrap();
            let mut s = String::new();
            encode_class(class, &mut s);
            let (ret, params) = decode(&s).unwrap();
            assert_eq!(ret, class, "size {} token {}", size, s);
            assert!(params.is_empty());
        }
    }

    #[test]
    fn test_decode_full_signature() {
        let (ret, params) = decode("vf2i4r8p5a16").unwrap();
        assert_eq!(ret, AbiClass::Hfa(FloatWidth::F32, 2));
        assert_eq!(
            params,
            vec![AbiClass::I4, AbiClass::R8, AbiClass::ByRef(5), AbiClass::Agg(16)]
        );
    }

    #[test]
    fn test_void_only_in_return_position() {
        let (ret, params) = decode("v").unwrap();
        assert_eq!(ret, AbiClass::Void);
        assert!(params.is_empty());

        // `v` as a parameter is not a token.
        assert!(decode("i4v").is_err());
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(decode(""), Err(SigError::Empty));
        assert!(decode("i3").is_err());
        assert!(decode("r2").is_err());
        assert!(decode("vf5").is_err());
        assert!(decode("a13").is_err());
        assert!(decode("p0").is_err());
        assert!(decode("z").is_err());
        assert!(decode("i").is_err());
    }

    #[test]
    fn test_decode_rejects_numbers_past_u32() {
        // 2^32 + 12 must not wrap around into a valid aggregate size.
        assert!(matches!(
            decode("a4294967308"),
            Err(SigError::UnexpectedToken { .. })
        ));
        assert!(decode("p99999999999999999999").is_err());
    }

    #[test]
    fn test_hfa_tokens_exact() {
        let mut s = String::new();
        encode_class(AbiClass::Hfa(FloatWidth::F32, 2), &mut s);
        assert_eq!(s, "vf2");
        s.clear();
        encode_class(AbiClass::Hfa(FloatWidth::F64, 4), &mut s);
        assert_eq!(s, "vd4");
    }
}
