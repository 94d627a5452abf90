use crate::datatype::physical::PhysicalType;
use crate::datatype::Datatype;

/// Trait which provides statically-typed attributes for a `Datatype`
/// for use with generics.
pub trait LogicalType: crate::private::Sealed {
    const DATA_TYPE: Datatype;

    type PhysicalType: PhysicalType;
}

macro_rules! logical_type {
    ($($LT:ident : $variant:ident => $PT:ty),+) => {
        $(
            pub struct $LT {}

            impl crate::private::Sealed for $LT {}

            impl LogicalType for $LT {
                const DATA_TYPE: Datatype = Datatype::$variant;

                type PhysicalType = $PT;
            }
        )+
    }
}

logical_type!(
    CharType: Char => i8,
    Int8Type: Int8 => i8,
    Int16Type: Int16 => i16,
    Int32Type: Int32 => i32,
    Int64Type: Int64 => i64,
    UInt8Type: UInt8 => u8,
    UInt16Type: UInt16 => u16,
    UInt32Type: UInt32 => u32,
    UInt64Type: UInt64 => u64,
    Float32Type: Float32 => f32,
    Float64Type: Float64 => f64,
    StringUtf8Type: StringUtf8 => u8
);
