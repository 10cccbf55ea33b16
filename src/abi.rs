//! ABI classification for values crossing the native-call boundary
//!
//! Pure functions deciding how a value is represented under the native
//! calling convention: a direct register-width value, a homogeneous
//! float aggregate (HFA) spread over 2-4 float registers, a size-bucketed
//! multi-register block, or a by-reference pass with an explicit slot
//! count. The classification feeds the signature encoder and the argument
//! packing done by the call bridge.

use crate::metadata::{FloatWidth, MetadataStore, PrimKind, TypeToken};

/// Largest aggregate passed by value; beyond this, pass by reference.
pub const MAX_AGG_BYTES: u32 = 32;

/// How one value crosses the native calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiClass {
    Void,
    /// Signed/unsigned integer of the given byte width, one register.
    I1,
    I2,
    I4,
    /// Register-width integer; also the class of pointers, references,
    /// and any non-HFA aggregate of at most 8 bytes.
    I8,
    R4,
    R8,
    /// Homogeneous float aggregate: 2-4 fields of one float width,
    /// passed in consecutive float registers.
    Hfa(FloatWidth, u8),
    /// Aggregate passed as a block, bucketed to 12/16/20/24/28/32 bytes
    /// and copied with the matching fixed-width helper.
    Agg(u32),
    /// Aggregate passed by reference with an explicit 8-byte slot count.
    ByRef(u32),
}

impl AbiClass {
    /// Number of 8-byte slots this class occupies in a packed argument
    /// buffer (a by-ref argument occupies one pointer slot).
    pub fn arg_slots(self) -> u32 {
        match self {
            Self::Void => 0,
            Self::I1 | Self::I2 | Self::I4 | Self::I8 | Self::R4 | Self::R8 => 1,
            Self::Hfa(w, n) => {
                // f32 pairs share a slot; round up.
                (u32::from(n) * w.size()).div_ceil(8)
            }
            Self::Agg(size) => size.div_ceil(8),
            Self::ByRef(_) => 1,
        }
    }

    /// Number of 8-byte slots of the value itself (for by-ref, the
    /// referenced aggregate).
    pub fn value_slots(self) -> u32 {
        match self {
            Self::ByRef(slots) => slots,
            other => other.arg_slots(),
        }
    }

    #[inline]
    pub fn is_float_like(self) -> bool {
        matches!(self, Self::R4 | Self::R8 | Self::Hfa(..))
    }
}

/// Classification failures; unencodable shapes are translation-time fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiError {
    /// Zero-sized value cannot cross the boundary.
    ZeroSized,
    /// Token does not resolve to a type descriptor.
    UnknownType(TypeToken),
}

impl std::fmt::Display for AbiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroSized => write!(f, "zero-sized value has no ABI classification"),
            Self::UnknownType(t) => write!(f, "unresolved type {} in signature", t),
        }
    }
}

impl std::error::Error for AbiError {}

/// Classify a raw value shape: byte size, alignment, and float
/// homogeneity as precomputed by the layout collaborator.
///
/// HFA recognition applies only to genuine aggregates (2-4 homogeneous
/// float fields); a lone float is simply `R4`/`R8`.
pub fn classify_value(
    size: u32,
    _align: u32,
    hfa: Option<(FloatWidth, u8)>,
) -> Result<AbiClass, AbiError> {
    if size == 0 {
        return Err(AbiError::ZeroSized);
    }
    if let Some((width, count)) = hfa {
        match count {
            1 => {
                return Ok(match width {
                    FloatWidth::F32 => AbiClass::R4,
                    FloatWidth::F64 => AbiClass::R8,
                })
            }
            2..=4 => return Ok(AbiClass::Hfa(width, count)),
            _ => {} // too many fields, falls through to size rules
        }
    }
    Ok(match size {
        1 => AbiClass::I1,
        2 => AbiClass::I2,
        3 | 4 => AbiClass::I4,
        5..=8 => AbiClass::I8,
        9..=MAX_AGG_BYTES => AbiClass::Agg(size.div_ceil(4) * 4),
        _ => AbiClass::ByRef(size.div_ceil(8)),
    })
}

/// Classify a resolved type token.
///
/// Enums reduce to their underlying primitive; reference, array, string,
/// pointer, and boxed types reduce to the register-width class.
pub fn classify_type(store: &MetadataStore, token: TypeToken) -> Result<AbiClass, AbiError> {
    let desc = store.type_desc(token).ok_or(AbiError::UnknownType(token))?;
    if !desc.is_value_type {
        return Ok(AbiClass::I8);
    }
    if desc.is_enum {
        let prim = desc.underlying.unwrap_or(PrimKind::I4);
        return Ok(classify_prim(prim));
    }
    if let Some(prim) = desc.prim {
        return Ok(classify_prim(prim));
    }
    classify_value(desc.size, desc.align, desc.hfa)
}

#[inline]
fn classify_prim(prim: PrimKind) -> AbiClass {
    match prim {
        PrimKind::I1 | PrimKind::U1 | PrimKind::Bool => AbiClass::I1,
        PrimKind::I2 | PrimKind::U2 | PrimKind::Char => AbiClass::I2,
        PrimKind::I4 | PrimKind::U4 => AbiClass::I4,
        PrimKind::I8 | PrimKind::U8 | PrimKind::IntPtr => AbiClass::I8,
        PrimKind::R4 => AbiClass::R4,
        PrimKind::R8 => AbiClass::R8,
    }
}
