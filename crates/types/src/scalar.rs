use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::dtype::Dtype;

/// A calendar date packed into 32 bits as `year << 9 | month << 5 | day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Date(u32);

impl Date {
    pub fn new(year: u16, month: u8, day: u8) -> Self {
        Date((year as u32) << 9 | (month as u32) << 5 | day as u32)
    }

    pub fn from_raw(raw: u32) -> Self {
        Date(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn year(self) -> u16 {
        (self.0 >> 9) as u16
    }

    pub fn month(self) -> u8 {
        ((self.0 >> 5) & 0xf) as u8
    }

    pub fn day(self) -> u8 {
        (self.0 & 0x1f) as u8
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year(), self.month(), self.day())
    }
}

/// A timestamp as milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(i64);

impl Time {
    pub fn from_millis(ms: i64) -> Self {
        Time(ms)
    }

    pub fn millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A single typed cell value.
///
/// `Null` stands for an invalid slot; columns track validity separately and
/// surface invalid cells as `Scalar::Null`. Equality, ordering and hashing are
/// total — floats compare and hash through their bit patterns — so a `Scalar`
/// can serve directly as a primary-key map key.
#[derive(Debug, Clone)]
pub enum Scalar {
    Null,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Date(Date),
    Time(Time),
    Str(Box<str>),
}

impl Scalar {
    pub fn dtype(&self) -> Option<Dtype> {
        Some(match self {
            Scalar::Null => return None,
            Scalar::I8(_) => Dtype::I8,
            Scalar::I16(_) => Dtype::I16,
            Scalar::I32(_) => Dtype::I32,
            Scalar::I64(_) => Dtype::I64,
            Scalar::U8(_) => Dtype::U8,
            Scalar::U16(_) => Dtype::U16,
            Scalar::U32(_) => Dtype::U32,
            Scalar::U64(_) => Dtype::U64,
            Scalar::F32(_) => Dtype::F32,
            Scalar::F64(_) => Dtype::F64,
            Scalar::Bool(_) => Dtype::Bool,
            Scalar::Date(_) => Dtype::Date,
            Scalar::Time(_) => Dtype::Time,
            Scalar::Str(_) => Dtype::Str,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn from_str_value(s: &str) -> Self {
        Scalar::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value, used by the computed-column evaluator.
    pub fn as_f64(&self) -> Option<f64> {
        Some(match self {
            Scalar::I8(v) => *v as f64,
            Scalar::I16(v) => *v as f64,
            Scalar::I32(v) => *v as f64,
            Scalar::I64(v) => *v as f64,
            Scalar::U8(v) => *v as f64,
            Scalar::U16(v) => *v as f64,
            Scalar::U32(v) => *v as f64,
            Scalar::U64(v) => *v as f64,
            Scalar::F32(v) => *v as f64,
            Scalar::F64(v) => *v,
            Scalar::Bool(v) => *v as u8 as f64,
            _ => return None,
        })
    }

    fn as_i128(&self) -> Option<i128> {
        Some(match self {
            Scalar::I8(v) => *v as i128,
            Scalar::I16(v) => *v as i128,
            Scalar::I32(v) => *v as i128,
            Scalar::I64(v) => *v as i128,
            Scalar::U8(v) => *v as i128,
            Scalar::U16(v) => *v as i128,
            Scalar::U32(v) => *v as i128,
            Scalar::U64(v) => *v as i128,
            _ => return None,
        })
    }

    /// Reinterpret the value as `new` according to the promotion lattice.
    ///
    /// Returns `None` when the pair is not in the lattice; a same-dtype
    /// promotion returns the value unchanged. `Null` promotes to `Null`.
    pub fn promote(&self, new: Dtype) -> Option<Scalar> {
        let from = match self.dtype() {
            Some(from) => from,
            None => return Some(Scalar::Null),
        };
        if !from.can_promote_to(new) {
            return None;
        }
        if from == new {
            return Some(self.clone());
        }
        if new == Dtype::Str {
            return Some(Scalar::Str(self.to_string().into()));
        }
        if let Some(i) = self.as_i128() {
            // Integer widening is lossless for every pair in the lattice.
            return Some(match new {
                Dtype::I16 => Scalar::I16(i as i16),
                Dtype::I32 => Scalar::I32(i as i32),
                Dtype::I64 => Scalar::I64(i as i64),
                Dtype::U16 => Scalar::U16(i as u16),
                Dtype::U32 => Scalar::U32(i as u32),
                Dtype::U64 => Scalar::U64(i as u64),
                Dtype::F32 => Scalar::F32(i as f32),
                Dtype::F64 => Scalar::F64(i as f64),
                _ => return None,
            });
        }
        match (self, new) {
            (Scalar::F32(v), Dtype::F64) => Some(Scalar::F64(*v as f64)),
            _ => None,
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            Scalar::Null => 0,
            Scalar::I8(_) => 1,
            Scalar::I16(_) => 2,
            Scalar::I32(_) => 3,
            Scalar::I64(_) => 4,
            Scalar::U8(_) => 5,
            Scalar::U16(_) => 6,
            Scalar::U32(_) => 7,
            Scalar::U64(_) => 8,
            Scalar::F32(_) => 9,
            Scalar::F64(_) => 10,
            Scalar::Bool(_) => 11,
            Scalar::Date(_) => 12,
            Scalar::Time(_) => 13,
            Scalar::Str(_) => 14,
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => true,
            (Scalar::I8(a), Scalar::I8(b)) => a == b,
            (Scalar::I16(a), Scalar::I16(b)) => a == b,
            (Scalar::I32(a), Scalar::I32(b)) => a == b,
            (Scalar::I64(a), Scalar::I64(b)) => a == b,
            (Scalar::U8(a), Scalar::U8(b)) => a == b,
            (Scalar::U16(a), Scalar::U16(b)) => a == b,
            (Scalar::U32(a), Scalar::U32(b)) => a == b,
            (Scalar::U64(a), Scalar::U64(b)) => a == b,
            (Scalar::F32(a), Scalar::F32(b)) => a.to_bits() == b.to_bits(),
            (Scalar::F64(a), Scalar::F64(b)) => a.to_bits() == b.to_bits(),
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Date(a), Scalar::Date(b)) => a == b,
            (Scalar::Time(a), Scalar::Time(b)) => a == b,
            (Scalar::Str(a), Scalar::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.variant_rank());
        match self {
            Scalar::Null => {}
            Scalar::I8(v) => v.hash(state),
            Scalar::I16(v) => v.hash(state),
            Scalar::I32(v) => v.hash(state),
            Scalar::I64(v) => v.hash(state),
            Scalar::U8(v) => v.hash(state),
            Scalar::U16(v) => v.hash(state),
            Scalar::U32(v) => v.hash(state),
            Scalar::U64(v) => v.hash(state),
            Scalar::F32(v) => v.to_bits().hash(state),
            Scalar::F64(v) => v.to_bits().hash(state),
            Scalar::Bool(v) => v.hash(state),
            Scalar::Date(v) => v.hash(state),
            Scalar::Time(v) => v.hash(state),
            Scalar::Str(v) => v.hash(state),
        }
    }
}

impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Scalar::I8(a), Scalar::I8(b)) => a.cmp(b),
            (Scalar::I16(a), Scalar::I16(b)) => a.cmp(b),
            (Scalar::I32(a), Scalar::I32(b)) => a.cmp(b),
            (Scalar::I64(a), Scalar::I64(b)) => a.cmp(b),
            (Scalar::U8(a), Scalar::U8(b)) => a.cmp(b),
            (Scalar::U16(a), Scalar::U16(b)) => a.cmp(b),
            (Scalar::U32(a), Scalar::U32(b)) => a.cmp(b),
            (Scalar::U64(a), Scalar::U64(b)) => a.cmp(b),
            (Scalar::F32(a), Scalar::F32(b)) => a.total_cmp(b),
            (Scalar::F64(a), Scalar::F64(b)) => a.total_cmp(b),
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::Date(a), Scalar::Date(b)) => a.cmp(b),
            (Scalar::Time(a), Scalar::Time(b)) => a.cmp(b),
            (Scalar::Str(a), Scalar::Str(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::I8(v) => write!(f, "{v}"),
            Scalar::I16(v) => write!(f, "{v}"),
            Scalar::I32(v) => write!(f, "{v}"),
            Scalar::I64(v) => write!(f, "{v}"),
            Scalar::U8(v) => write!(f, "{v}"),
            Scalar::U16(v) => write!(f, "{v}"),
            Scalar::U32(v) => write!(f, "{v}"),
            Scalar::U64(v) => write!(f, "{v}"),
            Scalar::F32(v) => write!(f, "{v}"),
            Scalar::F64(v) => write!(f, "{v}"),
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Date(v) => write!(f, "{v}"),
            Scalar::Time(v) => write!(f, "{v}"),
            Scalar::Str(v) => f.write_str(v),
        }
    }
}
