use std::ops::RangeInclusive;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::datatype::physical::{BitsEq, BitsOrd};
use crate::datatype::{Datatype, Error as DatatypeError};

/// The tightest axis-aligned box enclosing the coordinates of a tile,
/// one range per dimension.
pub type MinimumBoundingRectangle = Vec<SingleValueRange>;

#[derive(Clone, Debug, Error)]
pub enum RangeError {
    #[error("Range type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Datatype error: {0}")]
    Datatype(#[from] DatatypeError),
}

macro_rules! check_datatype_inner {
    ($ty:ty, $dtype:expr) => {{
        let datatype = $dtype;
        if !datatype.is_compatible_type::<$ty>() {
            return Err(DatatypeError::physical_type_incompatible::<$ty>(
                datatype,
            ));
        }
    }};
}

macro_rules! check_datatype {
    ($self:expr, $datatype:expr) => {
        match $self {
            Self::UInt8(_, _) => check_datatype_inner!(u8, $datatype),
            Self::UInt16(_, _) => check_datatype_inner!(u16, $datatype),
            Self::UInt32(_, _) => check_datatype_inner!(u32, $datatype),
            Self::UInt64(_, _) => check_datatype_inner!(u64, $datatype),
            Self::Int8(_, _) => check_datatype_inner!(i8, $datatype),
            Self::Int16(_, _) => check_datatype_inner!(i16, $datatype),
            Self::Int32(_, _) => check_datatype_inner!(i32, $datatype),
            Self::Int64(_, _) => check_datatype_inner!(i64, $datatype),
            Self::Float32(_, _) => check_datatype_inner!(f32, $datatype),
            Self::Float64(_, _) => check_datatype_inner!(f64, $datatype),
        }
    };
}

fn intersection<'a, B>(
    left_lower: &'a B,
    left_upper: &'a B,
    right_lower: &'a B,
    right_upper: &'a B,
) -> Option<(&'a B, &'a B)>
where
    B: BitsOrd + ?Sized,
{
    if left_upper.bits_lt(right_lower) || right_upper.bits_lt(left_lower) {
        return None;
    }

    let lower = if left_lower.bits_lt(right_lower) {
        right_lower
    } else {
        left_lower
    };

    let upper = if left_upper.bits_gt(right_upper) {
        right_upper
    } else {
        left_upper
    };

    Some((lower, upper))
}

/// An inclusive closed interval `[lower, upper]` over a single
/// physical datatype.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum SingleValueRange {
    UInt8(u8, u8),
    UInt16(u16, u16),
    UInt32(u32, u32),
    UInt64(u64, u64),
    Int8(i8, i8),
    Int16(i16, i16),
    Int32(i32, i32),
    Int64(i64, i64),
    Float32(f32, f32),
    Float64(f64, f64),
}

#[macro_export]
macro_rules! single_value_range_go {
    ($expr:expr, $DT:ident, $start:pat, $end:pat, $then:expr) => {{
        use $crate::range::SingleValueRange;
        match $expr {
            SingleValueRange::UInt8($start, $end) => {
                type $DT = u8;
                $then
            }
            SingleValueRange::UInt16($start, $end) => {
                type $DT = u16;
                $then
            }
            SingleValueRange::UInt32($start, $end) => {
                type $DT = u32;
                $then
            }
            SingleValueRange::UInt64($start, $end) => {
                type $DT = u64;
                $then
            }
            SingleValueRange::Int8($start, $end) => {
                type $DT = i8;
                $then
            }
            SingleValueRange::Int16($start, $end) => {
                type $DT = i16;
                $then
            }
            SingleValueRange::Int32($start, $end) => {
                type $DT = i32;
                $then
            }
            SingleValueRange::Int64($start, $end) => {
                type $DT = i64;
                $then
            }
            SingleValueRange::Float32($start, $end) => {
                type $DT = f32;
                $then
            }
            SingleValueRange::Float64($start, $end) => {
                type $DT = f64;
                $then
            }
        }
    }};
}

/// Applies an expression to the typed bounds of two ranges of the
/// same physical datatype, or an alternative when the variants differ.
#[macro_export]
macro_rules! single_value_range_cmp {
    ($lexpr:expr, $rexpr:expr, $DT:ident, $lstart:pat, $lend:pat, $rstart:pat, $rend:pat, $same:expr, $else:expr) => {{
        use $crate::range::SingleValueRange;
        match ($lexpr, $rexpr) {
            (
                SingleValueRange::UInt8($lstart, $lend),
                SingleValueRange::UInt8($rstart, $rend),
            ) => {
                type $DT = u8;
                $same
            }
            (
                SingleValueRange::UInt16($lstart, $lend),
                SingleValueRange::UInt16($rstart, $rend),
            ) => {
                type $DT = u16;
                $same
            }
            (
                SingleValueRange::UInt32($lstart, $lend),
                SingleValueRange::UInt32($rstart, $rend),
            ) => {
                type $DT = u32;
                $same
            }
            (
                SingleValueRange::UInt64($lstart, $lend),
                SingleValueRange::UInt64($rstart, $rend),
            ) => {
                type $DT = u64;
                $same
            }
            (
                SingleValueRange::Int8($lstart, $lend),
                SingleValueRange::Int8($rstart, $rend),
            ) => {
                type $DT = i8;
                $same
            }
            (
                SingleValueRange::Int16($lstart, $lend),
                SingleValueRange::Int16($rstart, $rend),
            ) => {
                type $DT = i16;
                $same
            }
            (
                SingleValueRange::Int32($lstart, $lend),
                SingleValueRange::Int32($rstart, $rend),
            ) => {
                type $DT = i32;
                $same
            }
            (
                SingleValueRange::Int64($lstart, $lend),
                SingleValueRange::Int64($rstart, $rend),
            ) => {
                type $DT = i64;
                $same
            }
            (
                SingleValueRange::Float32($lstart, $lend),
                SingleValueRange::Float32($rstart, $rend),
            ) => {
                type $DT = f32;
                $same
            }
            (
                SingleValueRange::Float64($lstart, $lend),
                SingleValueRange::Float64($rstart, $rend),
            ) => {
                type $DT = f64;
                $same
            }
            _ => $else,
        }
    }};
}

impl SingleValueRange {
    /// Returns the number of cells spanned by this range if it is a
    /// range over a discrete domain.
    /// ```
    /// use tiledb_common::range::SingleValueRange;
    /// assert_eq!(Some(100), SingleValueRange::Int64(1, 100).num_cells());
    /// assert_eq!(None, SingleValueRange::Float64(1.0, 100.0).num_cells());
    /// ```
    pub fn num_cells(&self) -> Option<u128> {
        let (low, high) = match *self {
            Self::UInt8(lo, hi) => (i128::from(lo), i128::from(hi)),
            Self::UInt16(lo, hi) => (i128::from(lo), i128::from(hi)),
            Self::UInt32(lo, hi) => (i128::from(lo), i128::from(hi)),
            Self::UInt64(lo, hi) => (i128::from(lo), i128::from(hi)),
            Self::Int8(lo, hi) => (i128::from(lo), i128::from(hi)),
            Self::Int16(lo, hi) => (i128::from(lo), i128::from(hi)),
            Self::Int32(lo, hi) => (i128::from(lo), i128::from(hi)),
            Self::Int64(lo, hi) => (i128::from(lo), i128::from(hi)),
            Self::Float32(..) | Self::Float64(..) => return None,
        };
        Some(1 + (high - low) as u128)
    }

    pub fn is_integral(&self) -> bool {
        !matches!(self, Self::Float32(..) | Self::Float64(..))
    }

    pub fn check_datatype(
        &self,
        datatype: Datatype,
    ) -> Result<(), DatatypeError> {
        check_datatype!(self, datatype);
        Ok(())
    }

    /// Returns the range covered by the union of `self` and `other`.
    ///
    /// # Panics
    ///
    /// Panics if `self` and `other` do not have the same physical datatype.
    pub fn union(&self, other: &Self) -> Self {
        crate::single_value_range_cmp!(
            self,
            other,
            DT,
            lstart,
            lend,
            rstart,
            rend,
            {
                let cmp = |l: &DT, r: &DT| l.bits_cmp(r);
                let min = std::cmp::min_by(*lstart, *rstart, cmp);
                let max = std::cmp::max_by(*lend, *rend, cmp);
                SingleValueRange::from(&[min, max])
            },
            {
                panic!(
                    "`SingleValueRange::union` on non-matching datatypes: `self` = {:?}, `other` = {:?}",
                    self, other
                )
            }
        )
    }

    /// Returns the range covered by the intersection of `self` and `other`,
    /// or `None` if `self` and `other` do not overlap.
    ///
    /// # Panics
    ///
    /// Panics if `self` and `other` do not have the same physical datatype.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        crate::single_value_range_cmp!(
            self,
            other,
            DT,
            lstart,
            lend,
            rstart,
            rend,
            {
                let (lower, upper) =
                    intersection::<DT>(lstart, lend, rstart, rend)?;
                Some(SingleValueRange::from(&[*lower, *upper]))
            },
            {
                panic!(
                    "`SingleValueRange::intersection` on non-matching datatypes: `self` = {:?}, `other` = {:?}",
                    self, other
                )
            }
        )
    }

    /// Returns whether `other` lies entirely within `self`.
    ///
    /// # Panics
    ///
    /// Panics if `self` and `other` do not have the same physical datatype.
    pub fn contains_range(&self, other: &Self) -> bool {
        crate::single_value_range_cmp!(
            self,
            other,
            _DT,
            lstart,
            lend,
            rstart,
            rend,
            lstart.bits_le(rstart) && rend.bits_le(lend),
            {
                panic!(
                    "`SingleValueRange::contains_range` on non-matching datatypes: `self` = {:?}, `other` = {:?}",
                    self, other
                )
            }
        )
    }
}

impl PartialEq for SingleValueRange {
    fn eq(&self, other: &Self) -> bool {
        crate::single_value_range_cmp!(
            self,
            other,
            _DT,
            lstart,
            lend,
            rstart,
            rend,
            lstart.bits_eq(rstart) && lend.bits_eq(rend),
            false
        )
    }
}

/// The [PartialEq] implementation of [SingleValueRange] compares the
/// floating-point variants using [BitsEq],
/// and as such is an equivalence relation.
impl Eq for SingleValueRange {}

macro_rules! single_value_range_from {
    ($($V:ident : $U:ty),+) => {
        $(
            impl From<&[$U; 2]> for SingleValueRange {
                fn from(value: &[$U; 2]) -> SingleValueRange {
                    SingleValueRange::$V(value[0], value[1])
                }
            }

            impl From<RangeInclusive<$U>> for SingleValueRange {
                fn from(value: RangeInclusive<$U>) -> SingleValueRange {
                    SingleValueRange::$V(*value.start(), *value.end())
                }
            }

            impl TryFrom<&SingleValueRange> for ($U, $U) {
                type Error = RangeError;

                fn try_from(value: &SingleValueRange) -> Result<Self, Self::Error> {
                    if let SingleValueRange::$V(start, end) = value {
                        Ok((*start, *end))
                    } else {
                        crate::single_value_range_go!(value, DT, _, _,
                            Err(RangeError::TypeMismatch {
                                expected: std::any::type_name::<$U>(),
                                found: std::any::type_name::<DT>(),
                            })
                        )
                    }
                }
            }
        )+
    }
}

single_value_range_from!(UInt8: u8, UInt16: u16, UInt32: u32, UInt64: u64);
single_value_range_from!(Int8: i8, Int16: i16, Int32: i32, Int64: i64);
single_value_range_from!(Float32: f32, Float64: f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_cells() {
        assert_eq!(Some(4), SingleValueRange::UInt32(1, 4).num_cells());
        assert_eq!(Some(1), SingleValueRange::Int8(-3, -3).num_cells());
        assert_eq!(None, SingleValueRange::Float32(0.0, 1.0).num_cells());
    }

    #[test]
    fn intersection() {
        let left = SingleValueRange::Int32(1, 10);
        let right = SingleValueRange::Int32(5, 20);
        assert_eq!(
            Some(SingleValueRange::Int32(5, 10)),
            left.intersection(&right)
        );
        assert_eq!(
            left.intersection(&right),
            right.intersection(&left)
        );

        let disjoint = SingleValueRange::Int32(11, 20);
        assert_eq!(None, left.intersection(&disjoint));
    }

    #[test]
    fn union() {
        let left = SingleValueRange::UInt64(1, 4);
        let right = SingleValueRange::UInt64(9, 16);
        assert_eq!(SingleValueRange::UInt64(1, 16), left.union(&right));
    }

    #[test]
    fn contains_range() {
        let outer = SingleValueRange::Int64(0, 100);
        assert!(outer.contains_range(&SingleValueRange::Int64(0, 100)));
        assert!(outer.contains_range(&SingleValueRange::Int64(40, 60)));
        assert!(!outer.contains_range(&SingleValueRange::Int64(40, 101)));
    }

    #[test]
    fn typed_bounds() {
        let range = SingleValueRange::UInt32(3, 7);
        let (lo, hi) = <(u32, u32)>::try_from(&range).unwrap();
        assert_eq!((3, 7), (lo, hi));
        assert!(<(i32, i32)>::try_from(&range).is_err());
    }
}
