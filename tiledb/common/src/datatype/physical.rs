use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use crate::datatype::Error;
use crate::private::sealed;

/// Trait for comparisons based on value bits.
/// This exists to work around float `NaN` which is not equal to itself,
/// preventing float types from being `Eq` for generic operations.
pub trait BitsEq {
    /// Test if two values have the same bits.
    ///
    /// This is often the same as `PartialEq::eq`, but is not in the case
    /// of floats where `NaN != NaN`.
    fn bits_eq(&self, other: &Self) -> bool;

    fn bits_ne(&self, other: &Self) -> bool {
        !self.bits_eq(other)
    }
}

impl<T> BitsEq for &T
where
    T: BitsEq,
{
    fn bits_eq(&self, other: &Self) -> bool {
        (**self).bits_eq(*other)
    }
}

impl<T> BitsEq for [T]
where
    T: BitsEq,
{
    fn bits_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().zip(other.iter()).all(|(l, r)| l.bits_eq(r))
    }
}

impl<T> BitsEq for Vec<T>
where
    T: BitsEq,
{
    fn bits_eq(&self, other: &Self) -> bool {
        self.as_slice().bits_eq(other.as_slice())
    }
}

/// Trait for ordering based on value bits.
/// This exists to work around float `NaN` which prevents float from being
/// a total order for use with generic operations.
pub trait BitsOrd {
    /// Return the ordering between `self` and `other`.
    /// This function defines a total order for all values of `Self`.
    fn bits_cmp(&self, other: &Self) -> Ordering;

    /// Returns `true` if `self` is less than `other` by `self.bits_cmp`.
    fn bits_lt(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Less)
    }

    /// Returns `true` if `self` is less than or equal to `other` by `self.bits_cmp`.
    fn bits_le(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Less | Ordering::Equal)
    }

    /// Returns `true` if `self` is greater than or equal to `other` by `self.bits_cmp`.
    fn bits_ge(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Equal | Ordering::Greater)
    }

    /// Returns `true` if `self` is greater than `other` by `self.bits_cmp`.
    fn bits_gt(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Greater)
    }
}

impl<T> BitsOrd for &T
where
    T: BitsOrd,
{
    fn bits_cmp(&self, other: &Self) -> Ordering {
        (**self).bits_cmp(*other)
    }
}

/// Implements lexicographic comparison of slices using the `BitsOrd` trait of the element.
impl<T> BitsOrd for [T]
where
    T: BitsOrd,
{
    fn bits_cmp(&self, other: &Self) -> Ordering {
        for (l, r) in self.iter().zip(other.iter()) {
            match l.bits_cmp(r) {
                Ordering::Less => return Ordering::Less,
                Ordering::Greater => return Ordering::Greater,
                Ordering::Equal => continue,
            }
        }

        self.len().cmp(&other.len())
    }
}

/// Implements lexicographic comparison of vectors using the `BitsOrd` trait of the element.
impl<T> BitsOrd for Vec<T>
where
    T: BitsOrd,
{
    fn bits_cmp(&self, other: &Self) -> Ordering {
        self.as_slice().bits_cmp(other.as_slice())
    }
}

/// Trait for generic operations on primitive data types.
///
/// Types which implement this trait are the in-memory representation of
/// array cell values and coordinates, and also know their own little-endian
/// byte encoding used by every on-disk structure of the engine.
pub trait PhysicalType:
    BitsEq
    + BitsOrd
    + Copy
    + Debug
    + Default
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + crate::private::Sealed
    + 'static
{
    const BYTES: usize;

    /// Write the little-endian encoding of `self` into `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out.len() != Self::BYTES`.
    fn write_le(&self, out: &mut [u8]);

    /// Read a value back from its little-endian encoding.
    ///
    /// # Panics
    ///
    /// Panics if `raw.len() != Self::BYTES`.
    fn read_le(raw: &[u8]) -> Self;

    /// Widen to `f64`, the representation of dimension domains
    /// and tile extents in the array schema.
    fn to_f64(&self) -> f64;

    /// Truncating conversion from the `f64` domain representation.
    fn from_f64(value: f64) -> Self;
}

macro_rules! integral_type_impls {
    ($($T:ty),+) => {
        sealed!($($T),+);

        $(
            impl BitsEq for $T {
                fn bits_eq(&self, other: &Self) -> bool {
                    <Self as PartialEq>::eq(self, other)
                }
            }

            impl BitsOrd for $T {
                fn bits_cmp(&self, other: &Self) -> Ordering {
                    <Self as Ord>::cmp(self, other)
                }
            }

            impl PhysicalType for $T {
                const BYTES: usize = std::mem::size_of::<$T>();

                fn write_le(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes())
                }

                fn read_le(raw: &[u8]) -> Self {
                    <$T>::from_le_bytes(raw.try_into().unwrap())
                }

                fn to_f64(&self) -> f64 {
                    *self as f64
                }

                fn from_f64(value: f64) -> Self {
                    value as $T
                }
            }
        )+
    }
}

integral_type_impls!(u8, u16, u32, u64);
integral_type_impls!(i8, i16, i32, i64);

macro_rules! float_type_impls {
    ($($T:ty),+) => {
        sealed!($($T),+);

        $(
            /// Defines an equivalence relation over the float type.
            ///
            /// The difference from `PartialEq` is that of reflexivity:
            /// two `NaN` values with the same bits are equal in this relation.
            /// Zero and negative zero are also considered equal.
            impl BitsEq for $T {
                fn bits_eq(&self, other: &Self) -> bool {
                    self.to_bits() == other.to_bits() ||
                        // catch negative zero
                        (*self == 0.0 && *other == 0.0)
                }
            }

            /// Defines a total order over the float type.
            ///
            /// This is `total_cmp` except that zero and negative zero
            /// compare equal. `NaN` values sort after all numbers.
            impl BitsOrd for $T {
                fn bits_cmp(&self, other: &Self) -> Ordering {
                    if *self == 0.0 && *other == 0.0 {
                        Ordering::Equal
                    } else {
                        self.total_cmp(other)
                    }
                }
            }

            impl PhysicalType for $T {
                const BYTES: usize = std::mem::size_of::<$T>();

                fn write_le(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes())
                }

                fn read_le(raw: &[u8]) -> Self {
                    <$T>::from_le_bytes(raw.try_into().unwrap())
                }

                fn to_f64(&self) -> f64 {
                    *self as f64
                }

                fn from_f64(value: f64) -> Self {
                    value as $T
                }
            }
        )+
    }
}

float_type_impls!(f32, f64);

/// Adapts a generic type to use as a key in `std` collections via
/// the `BitsEq` and `BitsOrd` traits.
#[derive(Clone, Copy)]
pub struct BitsKeyAdapter<T>(pub T);

impl<T> Debug for BitsKeyAdapter<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        self.0.fmt(f)
    }
}

impl<T> PartialEq for BitsKeyAdapter<T>
where
    T: BitsEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.0.bits_eq(&other.0)
    }
}

impl<T> Eq for BitsKeyAdapter<T> where T: BitsEq {}

impl<T> PartialOrd for BitsKeyAdapter<T>
where
    T: BitsEq + BitsOrd,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Ord::cmp(self, other))
    }
}

impl<T> Ord for BitsKeyAdapter<T>
where
    T: BitsEq + BitsOrd,
{
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.bits_cmp(&other.0)
    }
}

/// Represents a dynamically typed single physical value.
///
/// For a given datatype, [PhysicalValue] will always be constructed with the
/// primitive numerical type of the same bit width, signed-ness, and precision.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PhysicalValue {
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
}

#[macro_export]
macro_rules! physical_value_go {
    ($physical_value:expr, $DT:ident, $value:pat, $then:expr) => {{
        use $crate::datatype::physical::PhysicalValue;
        match $physical_value {
            PhysicalValue::UInt8($value) => {
                type $DT = u8;
                $then
            }
            PhysicalValue::UInt16($value) => {
                type $DT = u16;
                $then
            }
            PhysicalValue::UInt32($value) => {
                type $DT = u32;
                $then
            }
            PhysicalValue::UInt64($value) => {
                type $DT = u64;
                $then
            }
            PhysicalValue::Int8($value) => {
                type $DT = i8;
                $then
            }
            PhysicalValue::Int16($value) => {
                type $DT = i16;
                $then
            }
            PhysicalValue::Int32($value) => {
                type $DT = i32;
                $then
            }
            PhysicalValue::Int64($value) => {
                type $DT = i64;
                $then
            }
            PhysicalValue::Float32($value) => {
                type $DT = f32;
                $then
            }
            PhysicalValue::Float64($value) => {
                type $DT = f64;
                $then
            }
        }
    }};
}

macro_rules! physical_value_traits {
    ($($ty:ty : $variant:ident),+) => {
        $(
            impl From<$ty> for PhysicalValue {
                fn from(val: $ty) -> Self {
                    PhysicalValue::$variant(val)
                }
            }

            impl TryFrom<PhysicalValue> for $ty {
                type Error = Error;

                fn try_from(value: PhysicalValue) -> Result<Self, Self::Error> {
                    if let PhysicalValue::$variant(val) = value {
                        Ok(val)
                    } else {
                        physical_value_go!(
                            value,
                            DT,
                            _,
                            Err(Error::physical_type_mismatch::<$ty, DT>())
                        )
                    }
                }
            }
        )+
    };
}

physical_value_traits!(u8: UInt8, u16: UInt16, u32: UInt32, u64: UInt64);
physical_value_traits!(i8: Int8, i16: Int16, i32: Int32, i64: Int64);
physical_value_traits!(f32: Float32, f64: Float64);

impl Display for PhysicalValue {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        physical_value_go!(self, _DT, value, Display::fmt(value, f))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Returns a strategy which produces truly any possible f64 bits.
    ///
    /// This is in contrast with [Arbitrary] which does not produce `NaN` or infinities.
    fn any_f64() -> impl Strategy<Value = f64> {
        any::<[u8; 8]>().prop_map(f64::from_le_bytes)
    }

    proptest! {
        #[test]
        fn bits_eq_f64_reflexive(f in any_f64()) {
            assert!(f.bits_eq(&f));
        }

        #[test]
        fn bits_cmp_f64_total_order(f1 in any_f64(), f2 in any_f64()) {
            let lt = matches!(f1.bits_cmp(&f2), Ordering::Less);
            let eq = matches!(f1.bits_cmp(&f2), Ordering::Equal);
            let gt = matches!(f1.bits_cmp(&f2), Ordering::Greater);

            // exactly one of `<`, `==`, and `>` must be true for a total order
            if lt {
                assert!(!eq);
                assert!(!gt);
            } else if eq {
                assert!(!gt);
            } else {
                assert!(gt);
            }
        }

        #[test]
        fn bits_cmp_f64_transitive(f1 in any_f64(), f2 in any_f64(), f3 in any_f64()) {
            let f1 = BitsKeyAdapter(f1);
            let f2 = BitsKeyAdapter(f2);
            let f3 = BitsKeyAdapter(f3);

            if f1 <= f2 {
                if f2 <= f3 {
                    assert!(f1 <= f3);
                }
            } else if f1 <= f3 {
                assert!(f2 <= f3);
            }
        }

        #[test]
        fn le_bytes_roundtrip_i64(value in any::<i64>()) {
            let mut raw = vec![0u8; <i64 as PhysicalType>::BYTES];
            value.write_le(&mut raw);
            assert_eq!(value, <i64 as PhysicalType>::read_le(&raw));
        }

        #[test]
        fn le_bytes_roundtrip_f64(value in any_f64()) {
            let mut raw = vec![0u8; <f64 as PhysicalType>::BYTES];
            value.write_le(&mut raw);
            assert!(value.bits_eq(&<f64 as PhysicalType>::read_le(&raw)));
        }
    }

    #[test]
    fn bits_cmp_f64() {
        assert!(matches!(0f64.bits_cmp(&(-0f64)), Ordering::Equal));
        assert!(matches!((-0f64).bits_cmp(&0f64), Ordering::Equal));
    }

    #[test]
    fn physical_value_conversions() {
        let value = PhysicalValue::from(42u32);
        assert_eq!(Ok(42u32), u32::try_from(value));
        assert!(i32::try_from(value).is_err());
        assert_eq!("42", value.to_string());
    }
}
