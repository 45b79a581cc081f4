//! Element types and scalar values of chunked arrays.
//!
//! Element types use the zarr v2 `dtype` strings (`"<f8"`, `"|u1"`, ...). Only little-endian and
//! single-byte types are accepted since chunks are stored as raw little-endian bytes.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{ArrayError, ArrayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ElementType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl ElementType {
    pub const ALL: [ElementType; 11] = [
        ElementType::Bool,
        ElementType::I8,
        ElementType::I16,
        ElementType::I32,
        ElementType::I64,
        ElementType::U8,
        ElementType::U16,
        ElementType::U32,
        ElementType::U64,
        ElementType::F32,
        ElementType::F64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Bool => "|b1",
            ElementType::I8 => "|i1",
            ElementType::I16 => "<i2",
            ElementType::I32 => "<i4",
            ElementType::I64 => "<i8",
            ElementType::U8 => "|u1",
            ElementType::U16 => "<u2",
            ElementType::U32 => "<u4",
            ElementType::U64 => "<u8",
            ElementType::F32 => "<f4",
            ElementType::F64 => "<f8",
        }
    }

    /// Width of one element in bytes.
    pub fn item_size(&self) -> usize {
        match self {
            ElementType::Bool | ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
        }
    }

    /// Fill value used when the metadata does not carry one.
    pub fn default_fill(&self) -> Scalar {
        match self {
            ElementType::Bool => Scalar::Bool(false),
            ElementType::I8 | ElementType::I16 | ElementType::I32 | ElementType::I64 => {
                Scalar::Int(0)
            }
            ElementType::U8 | ElementType::U16 | ElementType::U32 | ElementType::U64 => {
                Scalar::UInt(0)
            }
            ElementType::F32 | ElementType::F64 => Scalar::Float(0.0),
        }
    }

    /// Converts `value` to this element type, rejecting values that do not fit.
    pub fn coerce(&self, value: Scalar) -> ArrayResult<Scalar> {
        let mismatch = || ArrayError::TypeMismatch {
            dtype: *self,
            value: value.to_string(),
        };
        match self {
            ElementType::Bool => match value {
                Scalar::Bool(v) => Ok(Scalar::Bool(v)),
                _ => Err(mismatch()),
            },
            ElementType::F32 | ElementType::F64 => value
                .as_f64()
                .map(Scalar::Float)
                .ok_or_else(mismatch),
            ElementType::I8 | ElementType::I16 | ElementType::I32 | ElementType::I64 => {
                let (min, max) = self.int_bounds();
                match value.as_i64() {
                    Some(v) if (min..=max).contains(&v) => Ok(Scalar::Int(v)),
                    _ => Err(mismatch()),
                }
            }
            ElementType::U8 | ElementType::U16 | ElementType::U32 | ElementType::U64 => {
                let v = match value {
                    Scalar::UInt(v) => Some(v),
                    Scalar::Int(v) => u64::try_from(v).ok(),
                    _ => None,
                };
                match v {
                    Some(v) if v <= self.uint_max() => Ok(Scalar::UInt(v)),
                    _ => Err(mismatch()),
                }
            }
        }
    }

    /// Appends the little-endian encoding of `value` after coercing it.
    pub fn encode(&self, value: Scalar, out: &mut Vec<u8>) -> ArrayResult<()> {
        match (self, self.coerce(value)?) {
            (ElementType::Bool, Scalar::Bool(v)) => out.push(v as u8),
            (ElementType::I8, Scalar::Int(v)) => out.extend_from_slice(&(v as i8).to_le_bytes()),
            (ElementType::I16, Scalar::Int(v)) => out.extend_from_slice(&(v as i16).to_le_bytes()),
            (ElementType::I32, Scalar::Int(v)) => out.extend_from_slice(&(v as i32).to_le_bytes()),
            (ElementType::I64, Scalar::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (ElementType::U8, Scalar::UInt(v)) => out.push(v as u8),
            (ElementType::U16, Scalar::UInt(v)) => out.extend_from_slice(&(v as u16).to_le_bytes()),
            (ElementType::U32, Scalar::UInt(v)) => out.extend_from_slice(&(v as u32).to_le_bytes()),
            (ElementType::U64, Scalar::UInt(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (ElementType::F32, Scalar::Float(v)) => out.extend_from_slice(&(v as f32).to_le_bytes()),
            (ElementType::F64, Scalar::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (_, coerced) => {
                return Err(ArrayError::TypeMismatch {
                    dtype: *self,
                    value: coerced.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Decodes one element from exactly [`ElementType::item_size`] bytes.
    pub fn decode(&self, bytes: &[u8]) -> Scalar {
        fn arr<const N: usize>(bytes: &[u8]) -> [u8; N] {
            let mut buf = [0u8; N];
            buf.copy_from_slice(&bytes[..N]);
            buf
        }
        match self {
            ElementType::Bool => Scalar::Bool(bytes[0] != 0),
            ElementType::I8 => Scalar::Int(bytes[0] as i8 as i64),
            ElementType::I16 => Scalar::Int(i16::from_le_bytes(arr(bytes)) as i64),
            ElementType::I32 => Scalar::Int(i32::from_le_bytes(arr(bytes)) as i64),
            ElementType::I64 => Scalar::Int(i64::from_le_bytes(arr(bytes))),
            ElementType::U8 => Scalar::UInt(bytes[0] as u64),
            ElementType::U16 => Scalar::UInt(u16::from_le_bytes(arr(bytes)) as u64),
            ElementType::U32 => Scalar::UInt(u32::from_le_bytes(arr(bytes)) as u64),
            ElementType::U64 => Scalar::UInt(u64::from_le_bytes(arr(bytes))),
            ElementType::F32 => Scalar::Float(f32::from_le_bytes(arr(bytes)) as f64),
            ElementType::F64 => Scalar::Float(f64::from_le_bytes(arr(bytes))),
        }
    }

    fn int_bounds(&self) -> (i64, i64) {
        match self {
            ElementType::I8 => (i8::MIN as i64, i8::MAX as i64),
            ElementType::I16 => (i16::MIN as i64, i16::MAX as i64),
            ElementType::I32 => (i32::MIN as i64, i32::MAX as i64),
            _ => (i64::MIN, i64::MAX),
        }
    }

    fn uint_max(&self) -> u64 {
        match self {
            ElementType::U8 => u8::MAX as u64,
            ElementType::U16 => u16::MAX as u64,
            ElementType::U32 => u32::MAX as u64,
            _ => u64::MAX,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ElementType::ALL
            .into_iter()
            .find(|dtype| dtype.as_str() == s)
            .ok_or_else(|| format!("unsupported dtype {s:?}"))
    }
}

impl TryFrom<String> for ElementType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ElementType> for String {
    fn from(value: ElementType) -> Self {
        value.as_str().to_string()
    }
}

/// One array element. Non-finite floats serialize as `"NaN"`, `"Infinity"` and `"-Infinity"`,
/// matching the zarr v2 `fill_value` encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(v) => Some(*v),
            Scalar::Int(v) => Some(*v as f64),
            Scalar::UInt(v) => Some(*v as f64),
            Scalar::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            Scalar::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Equality that treats two NaNs as equal.
    pub fn same_as(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::Float(a), Scalar::Float(b)) if a.is_nan() && b.is_nan() => true,
            _ => self == other,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::UInt(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(value as i64)
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Scalar::UInt(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl Serialize for Scalar {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Bool(v) => serializer.serialize_bool(*v),
            Scalar::Int(v) => serializer.serialize_i64(*v),
            Scalar::UInt(v) => serializer.serialize_u64(*v),
            Scalar::Float(v) if v.is_nan() => serializer.serialize_str("NaN"),
            Scalar::Float(v) if v.is_infinite() && *v > 0.0 => {
                serializer.serialize_str("Infinity")
            }
            Scalar::Float(v) if v.is_infinite() => serializer.serialize_str("-Infinity"),
            Scalar::Float(v) => serializer.serialize_f64(*v),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarRepr {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Special(String),
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match ScalarRepr::deserialize(deserializer)? {
            ScalarRepr::Bool(v) => Scalar::Bool(v),
            ScalarRepr::UInt(v) => Scalar::UInt(v),
            ScalarRepr::Int(v) => Scalar::Int(v),
            ScalarRepr::Float(v) => Scalar::Float(v),
            ScalarRepr::Special(s) => match s.as_str() {
                "NaN" => Scalar::Float(f64::NAN),
                "Infinity" => Scalar::Float(f64::INFINITY),
                "-Infinity" => Scalar::Float(f64::NEG_INFINITY),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "invalid scalar {other:?}"
                    )))
                }
            },
        })
    }
}
