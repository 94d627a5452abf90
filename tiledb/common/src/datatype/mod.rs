pub mod logical;
pub mod physical;

pub use logical::*;
pub use physical::{PhysicalType, PhysicalValue};

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Physical type mismatch: expected {actual_type}, found {requested_type}")]
    PhysicalTypeMismatch {
        requested_type: &'static str,
        actual_type: &'static str,
    },
    #[error("Physical type '{physical_type}' is not compatible with datatype '{datatype}'")]
    PhysicalTypeIncompatible {
        physical_type: &'static str,
        datatype: Datatype,
    },
    #[error("Invalid on-disk code for {}: {0}", std::any::type_name::<Datatype>())]
    InvalidDiscriminant(u64),
}

impl Error {
    pub fn physical_type_mismatch<T, U>() -> Self {
        Self::PhysicalTypeMismatch {
            requested_type: std::any::type_name::<T>(),
            actual_type: std::any::type_name::<U>(),
        }
    }

    pub fn physical_type_incompatible<T>(datatype: Datatype) -> Self {
        Self::PhysicalTypeIncompatible {
            physical_type: std::any::type_name::<T>(),
            datatype,
        }
    }
}

/// The value type of an attribute or of the coordinates.
///
/// The discriminants are the one-byte codes used by the on-disk
/// array schema format.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u8)]
pub enum Datatype {
    /// An 8-bit character value
    Char = 1,
    /// A 32-bit signed integer
    Int32 = 2,
    /// A 64-bit signed integer
    Int64 = 3,
    /// A 32-bit floating point value
    Float32 = 4,
    /// A 64-bit floating point value
    Float64 = 5,
    /// An 8-bit unsigned integer
    UInt8 = 6,
    /// A 16-bit unsigned integer
    UInt16 = 7,
    /// A 32-bit unsigned integer
    UInt32 = 8,
    /// A 64-bit unsigned integer
    UInt64 = 9,
    /// An 8-bit signed integer
    Int8 = 10,
    /// A 16-bit signed integer
    Int16 = 11,
    /// A variable-length UTF-8 string
    StringUtf8 = 12,
}

const DATATYPES: [Datatype; 12] = [
    Datatype::Char,
    Datatype::Int32,
    Datatype::Int64,
    Datatype::Float32,
    Datatype::Float64,
    Datatype::UInt8,
    Datatype::UInt16,
    Datatype::UInt32,
    Datatype::UInt64,
    Datatype::Int8,
    Datatype::Int16,
    Datatype::StringUtf8,
];

impl Datatype {
    /// Returns the size in bytes of a single value of this type.
    pub fn size(&self) -> usize {
        crate::physical_type_go!(self, DT, std::mem::size_of::<DT>())
    }

    pub fn is_compatible_type<T: 'static>(&self) -> bool {
        use std::any::TypeId;

        let tid = TypeId::of::<T>();
        if tid == TypeId::of::<f32>() {
            matches!(*self, Datatype::Float32)
        } else if tid == TypeId::of::<f64>() {
            matches!(*self, Datatype::Float64)
        } else if tid == TypeId::of::<i8>() {
            matches!(*self, Datatype::Char | Datatype::Int8)
        } else if tid == TypeId::of::<u8>() {
            matches!(*self, Datatype::UInt8 | Datatype::StringUtf8)
        } else if tid == TypeId::of::<i16>() {
            matches!(*self, Datatype::Int16)
        } else if tid == TypeId::of::<u16>() {
            matches!(*self, Datatype::UInt16)
        } else if tid == TypeId::of::<i32>() {
            matches!(*self, Datatype::Int32)
        } else if tid == TypeId::of::<u32>() {
            matches!(*self, Datatype::UInt32)
        } else if tid == TypeId::of::<i64>() {
            matches!(*self, Datatype::Int64)
        } else if tid == TypeId::of::<u64>() {
            matches!(*self, Datatype::UInt64)
        } else {
            false
        }
    }

    /// Returns whether this type is an integral type (i.e. integer)
    pub fn is_integral_type(&self) -> bool {
        matches!(
            *self,
            Datatype::Int8
                | Datatype::Int16
                | Datatype::Int32
                | Datatype::Int64
                | Datatype::UInt8
                | Datatype::UInt16
                | Datatype::UInt32
                | Datatype::UInt64
        )
    }

    /// Returns whether this type is a real number (i.e. floating point)
    pub fn is_real_type(&self) -> bool {
        matches!(*self, Datatype::Float32 | Datatype::Float64)
    }

    /// Returns whether this type is a variable-length string type
    pub fn is_string_type(&self) -> bool {
        matches!(*self, Datatype::StringUtf8)
    }

    /// Returns whether this type can be used as the coordinate type of an array.
    ///
    /// String dimensions are not representable in the array schema file,
    /// which stores all dimension domains as `f64` pairs.
    pub fn is_allowed_dimension_type(&self) -> bool {
        self.is_integral_type() || self.is_real_type()
    }

    pub fn same_physical_type(&self, other: &Datatype) -> bool {
        crate::physical_type_go!(self, MyPhysicalType, {
            crate::physical_type_go!(other, TheirPhysicalType, {
                std::any::TypeId::of::<MyPhysicalType>()
                    == std::any::TypeId::of::<TheirPhysicalType>()
            })
        })
    }

    /// Returns an `Iterator` which yields each variant of `Datatype`
    /// exactly once in an unspecified order.
    pub fn iter() -> impl Iterator<Item = Datatype> {
        DATATYPES.iter().copied()
    }
}

impl Display for Datatype {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Debug::fmt(self, f)
    }
}

impl FromStr for Datatype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase();
        match s.as_ref() {
            "char" => Ok(Datatype::Char),
            "int8" => Ok(Datatype::Int8),
            "int16" => Ok(Datatype::Int16),
            "int32" => Ok(Datatype::Int32),
            "int64" => Ok(Datatype::Int64),
            "uint8" => Ok(Datatype::UInt8),
            "uint16" => Ok(Datatype::UInt16),
            "uint32" => Ok(Datatype::UInt32),
            "uint64" => Ok(Datatype::UInt64),
            "float32" => Ok(Datatype::Float32),
            "float64" => Ok(Datatype::Float64),
            "stringutf8" => Ok(Datatype::StringUtf8),
            _ => Err(s),
        }
    }
}

impl From<Datatype> for u8 {
    fn from(value: Datatype) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Datatype {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Datatype::Char,
            2 => Datatype::Int32,
            3 => Datatype::Int64,
            4 => Datatype::Float32,
            5 => Datatype::Float64,
            6 => Datatype::UInt8,
            7 => Datatype::UInt16,
            8 => Datatype::UInt32,
            9 => Datatype::UInt64,
            10 => Datatype::Int8,
            11 => Datatype::Int16,
            12 => Datatype::StringUtf8,
            _ => return Err(Error::InvalidDiscriminant(value as u64)),
        })
    }
}

/// Apply a generic expression `$then` with a static type binding in the identifier `$typename`
/// for a logical type corresponding to the dynamic `$datatype`.
///
/// This is similar to `physical_type_go!` but binds the logical type
/// instead of the physical type.
#[macro_export]
macro_rules! logical_type_go {
    ($datatype:expr, $typename:ident, $then:expr) => {{
        type Datatype = $crate::datatype::Datatype;
        match $datatype {
            Datatype::Char => {
                type $typename = $crate::datatype::logical::CharType;
                $then
            }
            Datatype::Int8 => {
                type $typename = $crate::datatype::logical::Int8Type;
                $then
            }
            Datatype::Int16 => {
                type $typename = $crate::datatype::logical::Int16Type;
                $then
            }
            Datatype::Int32 => {
                type $typename = $crate::datatype::logical::Int32Type;
                $then
            }
            Datatype::Int64 => {
                type $typename = $crate::datatype::logical::Int64Type;
                $then
            }
            Datatype::UInt8 => {
                type $typename = $crate::datatype::logical::UInt8Type;
                $then
            }
            Datatype::UInt16 => {
                type $typename = $crate::datatype::logical::UInt16Type;
                $then
            }
            Datatype::UInt32 => {
                type $typename = $crate::datatype::logical::UInt32Type;
                $then
            }
            Datatype::UInt64 => {
                type $typename = $crate::datatype::logical::UInt64Type;
                $then
            }
            Datatype::Float32 => {
                type $typename = $crate::datatype::logical::Float32Type;
                $then
            }
            Datatype::Float64 => {
                type $typename = $crate::datatype::logical::Float64Type;
                $then
            }
            Datatype::StringUtf8 => {
                type $typename = $crate::datatype::logical::StringUtf8Type;
                $then
            }
        }
    }};
}

/// Apply a generic expression `$then` with a static type binding in the identifier `$typename`
/// for a physical type corresponding to the dynamic `$datatype`.
///
/// This is similar to `logical_type_go!` but binds the physical type instead of logical
/// type which is useful for calling generic functions and methods with a `PhysicalType`
/// trait bound.
///
/// # Examples
///
/// ```
/// use tiledb_common::physical_type_go;
/// use tiledb_common::datatype::Datatype;
///
/// fn physical_type_to_str(datatype: Datatype) -> String {
///     physical_type_go!(datatype, DT, std::any::type_name::<DT>().to_owned())
/// }
///
/// assert_eq!("u8", physical_type_to_str(Datatype::UInt8));
/// assert_eq!("u8", physical_type_to_str(Datatype::StringUtf8));
/// assert_eq!("i64", physical_type_to_str(Datatype::Int64));
/// ```
#[macro_export]
macro_rules! physical_type_go {
    ($datatype:expr, $typename:ident, $then:expr) => {{
        $crate::logical_type_go!($datatype, PhysicalTypeGoLogicalType, {
            type $typename = <PhysicalTypeGoLogicalType as $crate::datatype::LogicalType>::PhysicalType;
            $then
        })
    }};
}

#[cfg(any(test, feature = "proptest-strategies"))]
pub mod strategy;

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn disk_code_roundtrips() {
        for i in 0..=u8::MAX {
            let maybe_dt = Datatype::try_from(i);
            if let Ok(dt) = maybe_dt {
                assert_eq!(i, u8::from(dt));
            }
        }
    }

    #[test]
    fn iter() {
        let mut yielded = HashSet::<Datatype>::new();
        for dt in Datatype::iter() {
            let prev = yielded.insert(dt);
            assert!(prev);
        }
    }

    #[test]
    fn exactly_one_compatible_physical_type() {
        for dt in Datatype::iter() {
            let mut count = 0;
            if dt.is_compatible_type::<f32>() {
                count += 1;
            }
            if dt.is_compatible_type::<f64>() {
                count += 1;
            }
            if dt.is_compatible_type::<i8>() {
                count += 1;
            }
            if dt.is_compatible_type::<u8>() {
                count += 1;
            }
            if dt.is_compatible_type::<i16>() {
                count += 1;
            }
            if dt.is_compatible_type::<u16>() {
                count += 1;
            }
            if dt.is_compatible_type::<i32>() {
                count += 1;
            }
            if dt.is_compatible_type::<u32>() {
                count += 1;
            }
            if dt.is_compatible_type::<i64>() {
                count += 1;
            }
            if dt.is_compatible_type::<u64>() {
                count += 1;
            }
            assert_eq!(1, count, "{dt}");
        }
    }

    proptest! {
        #[test]
        fn logical_type(dt in any::<Datatype>()) {
            logical_type_go!(dt, LT, {
                let lt_constant = <LT as LogicalType>::DATA_TYPE;
                assert_eq!(dt, lt_constant);

                assert!(dt.is_compatible_type::<<LT as LogicalType>::PhysicalType>());
            })
        }
    }

    #[test]
    fn from_str() {
        for datatype in Datatype::iter() {
            let s_in = datatype.to_string();
            let s_out = Datatype::from_str(&s_in);

            assert_eq!(Ok(datatype), s_out);
        }
    }
}
