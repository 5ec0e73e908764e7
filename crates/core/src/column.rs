use std::sync::Arc;

use fixedbitset::FixedBitSet;
use prism_types::{Date, Dtype, Scalar, Time};

use crate::mask::Mask;
use crate::vocab::Vocab;

/// Physical storage for one column, one vector variant per dtype.
///
/// `Bool` is byte-backed, `Date` sits on `u32` and `Time` on `i64`, so the
/// typed processing paths can treat all three as fixed-width integers. String
/// columns store dictionary ids against a shared [`Vocab`].
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<u8>),
    Date(Vec<u32>),
    Time(Vec<i64>),
    Str { ids: Vec<u32>, vocab: Arc<Vocab> },
}

impl ColumnData {
    fn new(dtype: Dtype) -> Self {
        match dtype {
            Dtype::I8 => ColumnData::I8(Vec::new()),
            Dtype::I16 => ColumnData::I16(Vec::new()),
            Dtype::I32 => ColumnData::I32(Vec::new()),
            Dtype::I64 => ColumnData::I64(Vec::new()),
            Dtype::U8 => ColumnData::U8(Vec::new()),
            Dtype::U16 => ColumnData::U16(Vec::new()),
            Dtype::U32 => ColumnData::U32(Vec::new()),
            Dtype::U64 => ColumnData::U64(Vec::new()),
            Dtype::F32 => ColumnData::F32(Vec::new()),
            Dtype::F64 => ColumnData::F64(Vec::new()),
            Dtype::Bool => ColumnData::Bool(Vec::new()),
            Dtype::Date => ColumnData::Date(Vec::new()),
            Dtype::Time => ColumnData::Time(Vec::new()),
            Dtype::Str => ColumnData::Str {
                ids: Vec::new(),
                vocab: Arc::new(Vocab::new()),
            },
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnData::I8(v) => v.len(),
            ColumnData::I16(v) => v.len(),
            ColumnData::I32(v) => v.len(),
            ColumnData::I64(v) => v.len(),
            ColumnData::U8(v) => v.len(),
            ColumnData::U16(v) => v.len(),
            ColumnData::U32(v) => v.len(),
            ColumnData::U64(v) => v.len(),
            ColumnData::F32(v) => v.len(),
            ColumnData::F64(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::Date(v) => v.len(),
            ColumnData::Time(v) => v.len(),
            ColumnData::Str { ids, .. } => ids.len(),
        }
    }
}

/// Typed view into [`ColumnData`] for the dtype-generic processing paths.
///
/// `i64` views both `I64` and `Time` storage, `u32` views `U32` and `Date`,
/// `u8` views `U8` and `Bool`; this is how date, time and boolean columns ride
/// the integer code paths.
pub(crate) trait Native: Copy + PartialEq + Default + Send + Sync + 'static {
    fn values(data: &ColumnData) -> Option<&[Self]>;
    fn values_mut(data: &mut ColumnData) -> Option<&mut Vec<Self>>;
    fn wrapping_sub(self, rhs: Self) -> Self;
    fn wrapping_neg(self) -> Self;
}

macro_rules! impl_native_int {
    ($($t:ty => [$($variant:ident),+]),* $(,)?) => {$(
        impl Native for $t {
            fn values(data: &ColumnData) -> Option<&[Self]> {
                match data {
                    $(ColumnData::$variant(v) => Some(v),)+
                    _ => None,
                }
            }
            fn values_mut(data: &mut ColumnData) -> Option<&mut Vec<Self>> {
                match data {
                    $(ColumnData::$variant(v) => Some(v),)+
                    _ => None,
                }
            }
            fn wrapping_sub(self, rhs: Self) -> Self {
                <$t as num_traits::WrappingSub>::wrapping_sub(&self, &rhs)
            }
            fn wrapping_neg(self) -> Self {
                <$t as num_traits::WrappingNeg>::wrapping_neg(&self)
            }
        }
    )*};
}

impl_native_int! {
    i8 => [I8],
    i16 => [I16],
    i32 => [I32],
    i64 => [I64, Time],
    u8 => [U8, Bool],
    u16 => [U16],
    u32 => [U32, Date],
    u64 => [U64],
}

macro_rules! impl_native_float {
    ($($t:ty => $variant:ident),* $(,)?) => {$(
        impl Native for $t {
            fn values(data: &ColumnData) -> Option<&[Self]> {
                match data {
                    ColumnData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn values_mut(data: &mut ColumnData) -> Option<&mut Vec<Self>> {
                match data {
                    ColumnData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn wrapping_sub(self, rhs: Self) -> Self {
                self - rhs
            }
            fn wrapping_neg(self) -> Self {
                -self
            }
        }
    )*};
}

impl_native_float! {
    f32 => F32,
    f64 => F64,
}

fn masked<T: Copy>(values: &[T], mask: &Mask) -> Vec<T> {
    mask.ones().map(|idx| values[idx]).collect()
}

fn reordered<T: Copy>(values: &[T], order: &[usize]) -> Vec<T> {
    order.iter().map(|&idx| values[idx]).collect()
}

/// A typed, dense, random-access column with a bit-per-slot validity vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    dtype: Dtype,
    data: ColumnData,
    valid: FixedBitSet,
}

impl Column {
    pub fn new(dtype: Dtype) -> Self {
        Column {
            dtype,
            data: ColumnData::new(dtype),
            valid: FixedBitSet::default(),
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reserve(&mut self, additional: usize) {
        match &mut self.data {
            ColumnData::I8(v) => v.reserve(additional),
            ColumnData::I16(v) => v.reserve(additional),
            ColumnData::I32(v) => v.reserve(additional),
            ColumnData::I64(v) => v.reserve(additional),
            ColumnData::U8(v) => v.reserve(additional),
            ColumnData::U16(v) => v.reserve(additional),
            ColumnData::U32(v) => v.reserve(additional),
            ColumnData::U64(v) => v.reserve(additional),
            ColumnData::F32(v) => v.reserve(additional),
            ColumnData::F64(v) => v.reserve(additional),
            ColumnData::Bool(v) => v.reserve(additional),
            ColumnData::Date(v) => v.reserve(additional),
            ColumnData::Time(v) => v.reserve(additional),
            ColumnData::Str { ids, .. } => ids.reserve(additional),
        }
    }

    /// Resize to exactly `len` slots. New slots hold the type zero and are
    /// invalid; slots truncated away also drop their validity bits so a later
    /// regrowth cannot resurrect them.
    pub fn set_len(&mut self, len: usize) {
        let old = self.len();
        match &mut self.data {
            ColumnData::I8(v) => v.resize(len, 0),
            ColumnData::I16(v) => v.resize(len, 0),
            ColumnData::I32(v) => v.resize(len, 0),
            ColumnData::I64(v) => v.resize(len, 0),
            ColumnData::U8(v) => v.resize(len, 0),
            ColumnData::U16(v) => v.resize(len, 0),
            ColumnData::U32(v) => v.resize(len, 0),
            ColumnData::U64(v) => v.resize(len, 0),
            ColumnData::F32(v) => v.resize(len, 0.0),
            ColumnData::F64(v) => v.resize(len, 0.0),
            ColumnData::Bool(v) => v.resize(len, 0),
            ColumnData::Date(v) => v.resize(len, 0),
            ColumnData::Time(v) => v.resize(len, 0),
            ColumnData::Str { ids, .. } => ids.resize(len, 0),
        }
        self.valid.grow(len.max(old));
        if len < old {
            self.valid.set_range(len..old, false);
        }
    }

    pub fn clear(&mut self) {
        self.set_len(0);
        self.valid.clear();
    }

    pub fn is_valid(&self, idx: usize) -> bool {
        self.valid.contains(idx)
    }

    pub fn set_valid(&mut self, idx: usize, valid: bool) {
        if idx >= self.valid.len() {
            self.valid.grow(idx + 1);
        }
        self.valid.set(idx, valid);
    }

    pub(crate) fn value<T: Native>(&self, idx: usize) -> T {
        T::values(&self.data).expect("column dtype mismatch")[idx]
    }

    pub(crate) fn set_value<T: Native>(&mut self, idx: usize, value: T) {
        T::values_mut(&mut self.data).expect("column dtype mismatch")[idx] = value;
    }

    /// The value at `idx`, or `Scalar::Null` when the slot is invalid.
    pub fn get_scalar(&self, idx: usize) -> Scalar {
        if !self.is_valid(idx) {
            return Scalar::Null;
        }
        match &self.data {
            ColumnData::I8(v) => Scalar::I8(v[idx]),
            ColumnData::I16(v) => Scalar::I16(v[idx]),
            ColumnData::I32(v) => Scalar::I32(v[idx]),
            ColumnData::I64(v) => Scalar::I64(v[idx]),
            ColumnData::U8(v) => Scalar::U8(v[idx]),
            ColumnData::U16(v) => Scalar::U16(v[idx]),
            ColumnData::U32(v) => Scalar::U32(v[idx]),
            ColumnData::U64(v) => Scalar::U64(v[idx]),
            ColumnData::F32(v) => Scalar::F32(v[idx]),
            ColumnData::F64(v) => Scalar::F64(v[idx]),
            ColumnData::Bool(v) => Scalar::Bool(v[idx] != 0),
            ColumnData::Date(v) => Scalar::Date(Date::from_raw(v[idx])),
            ColumnData::Time(v) => Scalar::Time(Time::from_millis(v[idx])),
            ColumnData::Str { ids, vocab } => Scalar::Str(vocab.resolve(ids[idx]).into()),
        }
    }

    /// Write `scalar` at `idx`, updating validity. `Null` invalidates the slot
    /// and leaves the stored value untouched.
    ///
    /// Panics when the scalar's dtype does not match the column; callers are
    /// expected to have checked schemas.
    pub fn set_scalar(&mut self, idx: usize, scalar: &Scalar) {
        if scalar.is_null() {
            self.set_valid(idx, false);
            return;
        }
        match (&mut self.data, scalar) {
            (ColumnData::I8(v), Scalar::I8(s)) => v[idx] = *s,
            (ColumnData::I16(v), Scalar::I16(s)) => v[idx] = *s,
            (ColumnData::I32(v), Scalar::I32(s)) => v[idx] = *s,
            (ColumnData::I64(v), Scalar::I64(s)) => v[idx] = *s,
            (ColumnData::U8(v), Scalar::U8(s)) => v[idx] = *s,
            (ColumnData::U16(v), Scalar::U16(s)) => v[idx] = *s,
            (ColumnData::U32(v), Scalar::U32(s)) => v[idx] = *s,
            (ColumnData::U64(v), Scalar::U64(s)) => v[idx] = *s,
            (ColumnData::F32(v), Scalar::F32(s)) => v[idx] = *s,
            (ColumnData::F64(v), Scalar::F64(s)) => v[idx] = *s,
            (ColumnData::Bool(v), Scalar::Bool(s)) => v[idx] = *s as u8,
            (ColumnData::Date(v), Scalar::Date(s)) => v[idx] = s.raw(),
            (ColumnData::Time(v), Scalar::Time(s)) => v[idx] = s.millis(),
            (ColumnData::Str { ids, vocab }, Scalar::Str(s)) => {
                ids[idx] = Arc::make_mut(vocab).intern(s);
            }
            (_, s) => panic!(
                "scalar {:?} does not match column dtype {}",
                s.dtype(),
                self.dtype
            ),
        }
        self.set_valid(idx, true);
    }

    pub fn push_scalar(&mut self, scalar: &Scalar) {
        let idx = self.len();
        self.set_len(idx + 1);
        self.set_scalar(idx, scalar);
    }

    /// Append every slot of `other`, which must have the same dtype.
    /// String ids are rebased into this column's vocabulary unless both
    /// columns already share one.
    pub fn append_from(&mut self, other: &Column) {
        debug_assert_eq!(self.dtype, other.dtype);
        let old = self.len();
        let added = other.len();
        match (&mut self.data, &other.data) {
            (ColumnData::I8(a), ColumnData::I8(b)) => a.extend_from_slice(b),
            (ColumnData::I16(a), ColumnData::I16(b)) => a.extend_from_slice(b),
            (ColumnData::I32(a), ColumnData::I32(b)) => a.extend_from_slice(b),
            (ColumnData::I64(a), ColumnData::I64(b)) => a.extend_from_slice(b),
            (ColumnData::U8(a), ColumnData::U8(b)) => a.extend_from_slice(b),
            (ColumnData::U16(a), ColumnData::U16(b)) => a.extend_from_slice(b),
            (ColumnData::U32(a), ColumnData::U32(b)) => a.extend_from_slice(b),
            (ColumnData::U64(a), ColumnData::U64(b)) => a.extend_from_slice(b),
            (ColumnData::F32(a), ColumnData::F32(b)) => a.extend_from_slice(b),
            (ColumnData::F64(a), ColumnData::F64(b)) => a.extend_from_slice(b),
            (ColumnData::Bool(a), ColumnData::Bool(b)) => a.extend_from_slice(b),
            (ColumnData::Date(a), ColumnData::Date(b)) => a.extend_from_slice(b),
            (ColumnData::Time(a), ColumnData::Time(b)) => a.extend_from_slice(b),
            (
                ColumnData::Str { ids, vocab },
                ColumnData::Str {
                    ids: other_ids,
                    vocab: other_vocab,
                },
            ) => {
                if Arc::ptr_eq(vocab, other_vocab) {
                    ids.extend_from_slice(other_ids);
                } else {
                    let vocab = Arc::make_mut(vocab);
                    ids.extend(other_ids.iter().map(|&id| vocab.intern(other_vocab.resolve(id))));
                }
            }
            _ => panic!("appending column of dtype {} to {}", other.dtype, self.dtype),
        }
        self.valid.grow(old + added);
        for idx in 0..added {
            if other.is_valid(idx) {
                self.valid.insert(old + idx);
            }
        }
    }

    /// Copy of the column keeping only the rows set in `mask`.
    pub fn clone_masked(&self, mask: &Mask) -> Column {
        let data = match &self.data {
            ColumnData::I8(v) => ColumnData::I8(masked(v, mask)),
            ColumnData::I16(v) => ColumnData::I16(masked(v, mask)),
            ColumnData::I32(v) => ColumnData::I32(masked(v, mask)),
            ColumnData::I64(v) => ColumnData::I64(masked(v, mask)),
            ColumnData::U8(v) => ColumnData::U8(masked(v, mask)),
            ColumnData::U16(v) => ColumnData::U16(masked(v, mask)),
            ColumnData::U32(v) => ColumnData::U32(masked(v, mask)),
            ColumnData::U64(v) => ColumnData::U64(masked(v, mask)),
            ColumnData::F32(v) => ColumnData::F32(masked(v, mask)),
            ColumnData::F64(v) => ColumnData::F64(masked(v, mask)),
            ColumnData::Bool(v) => ColumnData::Bool(masked(v, mask)),
            ColumnData::Date(v) => ColumnData::Date(masked(v, mask)),
            ColumnData::Time(v) => ColumnData::Time(masked(v, mask)),
            ColumnData::Str { ids, vocab } => ColumnData::Str {
                ids: masked(ids, mask),
                vocab: Arc::clone(vocab),
            },
        };
        let mut valid = FixedBitSet::with_capacity(mask.count());
        for (out, idx) in mask.ones().enumerate() {
            if self.is_valid(idx) {
                valid.insert(out);
            }
        }
        Column {
            dtype: self.dtype,
            data,
            valid,
        }
    }

    /// Copy of the column with rows gathered in `order`.
    pub fn clone_reordered(&self, order: &[usize]) -> Column {
        let data = match &self.data {
            ColumnData::I8(v) => ColumnData::I8(reordered(v, order)),
            ColumnData::I16(v) => ColumnData::I16(reordered(v, order)),
            ColumnData::I32(v) => ColumnData::I32(reordered(v, order)),
            ColumnData::I64(v) => ColumnData::I64(reordered(v, order)),
            ColumnData::U8(v) => ColumnData::U8(reordered(v, order)),
            ColumnData::U16(v) => ColumnData::U16(reordered(v, order)),
            ColumnData::U32(v) => ColumnData::U32(reordered(v, order)),
            ColumnData::U64(v) => ColumnData::U64(reordered(v, order)),
            ColumnData::F32(v) => ColumnData::F32(reordered(v, order)),
            ColumnData::F64(v) => ColumnData::F64(reordered(v, order)),
            ColumnData::Bool(v) => ColumnData::Bool(reordered(v, order)),
            ColumnData::Date(v) => ColumnData::Date(reordered(v, order)),
            ColumnData::Time(v) => ColumnData::Time(reordered(v, order)),
            ColumnData::Str { ids, vocab } => ColumnData::Str {
                ids: reordered(ids, order),
                vocab: Arc::clone(vocab),
            },
        };
        let mut valid = FixedBitSet::with_capacity(order.len());
        for (out, &idx) in order.iter().enumerate() {
            if self.is_valid(idx) {
                valid.insert(out);
            }
        }
        Column {
            dtype: self.dtype,
            data,
            valid,
        }
    }

    /// Retype the column to `new`, converting every cell along the promotion
    /// lattice. The caller has already checked `can_promote_to`.
    pub fn promote(&self, new: Dtype) -> Column {
        let mut out = Column::new(new);
        out.reserve(self.len());
        for idx in 0..self.len() {
            match self.get_scalar(idx).promote(new) {
                Some(scalar) => out.push_scalar(&scalar),
                None => out.push_scalar(&Scalar::Null),
            }
        }
        out
    }

    // String accessors. All of these expect a `Str` column.

    pub fn str_at(&self, idx: usize) -> &str {
        match &self.data {
            ColumnData::Str { ids, vocab } => vocab.resolve(ids[idx]),
            _ => panic!("str_at on column of dtype {}", self.dtype),
        }
    }

    pub(crate) fn str_id(&self, idx: usize) -> u32 {
        match &self.data {
            ColumnData::Str { ids, .. } => ids[idx],
            _ => panic!("str_id on column of dtype {}", self.dtype),
        }
    }

    pub fn set_str(&mut self, idx: usize, value: &str) {
        match &mut self.data {
            ColumnData::Str { ids, vocab } => {
                ids[idx] = Arc::make_mut(vocab).intern(value);
            }
            _ => panic!("set_str on column of dtype {}", self.dtype),
        }
    }

    /// Write a raw dictionary id; only meaningful when this column shares a
    /// vocabulary with the id's source.
    pub(crate) fn set_str_id(&mut self, idx: usize, id: u32) {
        match &mut self.data {
            ColumnData::Str { ids, .. } => ids[idx] = id,
            _ => panic!("set_str_id on column of dtype {}", self.dtype),
        }
    }

    /// Adopt `other`'s vocabulary for the duration of a batch, so ids written
    /// from `other` resolve without re-interning. Existing ids in this column
    /// must all be 0 (the empty string), which both vocabularies share.
    pub fn borrow_vocabulary(&mut self, other: &Column) {
        match (&mut self.data, &other.data) {
            (
                ColumnData::Str { vocab, .. },
                ColumnData::Str {
                    vocab: other_vocab, ..
                },
            ) => {
                *vocab = Arc::clone(other_vocab);
            }
            _ => panic!("borrow_vocabulary between non-string columns"),
        }
    }

    /// Byte equality of two string cells, reduced to id equality when the
    /// columns share a vocabulary. Empty strings always compare equal.
    pub fn strings_equal(&self, idx: usize, other: &Column, other_idx: usize) -> bool {
        match (&self.data, &other.data) {
            (
                ColumnData::Str { ids, vocab },
                ColumnData::Str {
                    ids: other_ids,
                    vocab: other_vocab,
                },
            ) => {
                if Arc::ptr_eq(vocab, other_vocab) {
                    ids[idx] == other_ids[other_idx]
                } else {
                    vocab.resolve(ids[idx]) == other_vocab.resolve(other_ids[other_idx])
                }
            }
            _ => panic!("strings_equal between non-string columns"),
        }
    }
}
