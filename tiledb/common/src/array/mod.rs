use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::num::NonZeroU32;
use std::str::FromStr;

use thiserror::Error;

#[cfg(feature = "proptest-strategies")]
use proptest::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The mode in which an array or fragment is opened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Read,
    Create,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum ArrayType {
    #[default]
    Dense,
    Sparse,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ArrayTypeError {
    #[error("Invalid discriminant for {}: {0}", std::any::type_name::<ArrayType>())]
    InvalidDiscriminant(u64),
}

#[cfg(feature = "proptest-strategies")]
impl Arbitrary for ArrayType {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![Just(ArrayType::Dense), Just(ArrayType::Sparse)].boxed()
    }
}

/// The order in which the tiles of a regular-tiled array are laid out.
///
/// The discriminants are the one-byte codes used by the on-disk
/// array schema format. `None` is the code for irregular tiles,
/// which have no tile grid to order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u8)]
pub enum TileOrder {
    #[default]
    None = 0,
    RowMajor = 1,
    ColumnMajor = 2,
    Hilbert = 3,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TileOrderError {
    #[error("Invalid discriminant for {}: {0}", std::any::type_name::<TileOrder>())]
    InvalidDiscriminant(u64),
}

impl From<TileOrder> for u8 {
    fn from(value: TileOrder) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for TileOrder {
    type Error = TileOrderError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TileOrder::None),
            1 => Ok(TileOrder::RowMajor),
            2 => Ok(TileOrder::ColumnMajor),
            3 => Ok(TileOrder::Hilbert),
            _ => Err(TileOrderError::InvalidDiscriminant(value as u64)),
        }
    }
}

impl FromStr for TileOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "none" => Ok(TileOrder::None),
            "row-major" => Ok(TileOrder::RowMajor),
            "column-major" => Ok(TileOrder::ColumnMajor),
            "hilbert" => Ok(TileOrder::Hilbert),
            other => Err(other.to_owned()),
        }
    }
}

#[cfg(feature = "proptest-strategies")]
impl Arbitrary for TileOrder {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            Just(TileOrder::RowMajor),
            Just(TileOrder::ColumnMajor),
            Just(TileOrder::Hilbert)
        ]
        .boxed()
    }
}

/// The total order of cells within the array, used both for the on-disk
/// layout and for read output.
///
/// The discriminants are the one-byte codes used by the on-disk
/// array schema format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u8)]
pub enum CellOrder {
    #[default]
    RowMajor = 1,
    ColumnMajor = 2,
    Hilbert = 3,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum CellOrderError {
    #[error("Invalid discriminant for {}: {0}", std::any::type_name::<CellOrder>())]
    InvalidDiscriminant(u64),
}

impl From<CellOrder> for u8 {
    fn from(value: CellOrder) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for CellOrder {
    type Error = CellOrderError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CellOrder::RowMajor),
            2 => Ok(CellOrder::ColumnMajor),
            3 => Ok(CellOrder::Hilbert),
            _ => Err(CellOrderError::InvalidDiscriminant(value as u64)),
        }
    }
}

impl FromStr for CellOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "row-major" => Ok(CellOrder::RowMajor),
            "column-major" => Ok(CellOrder::ColumnMajor),
            "hilbert" => Ok(CellOrder::Hilbert),
            other => Err(other.to_owned()),
        }
    }
}

#[cfg(feature = "proptest-strategies")]
impl Arbitrary for CellOrder {
    type Strategy = BoxedStrategy<CellOrder>;
    type Parameters = Option<ArrayType>;

    fn arbitrary_with(args: Self::Parameters) -> Self::Strategy {
        match args {
            None | Some(ArrayType::Sparse) => prop_oneof![
                Just(CellOrder::RowMajor),
                Just(CellOrder::ColumnMajor),
                Just(CellOrder::Hilbert),
            ]
            .boxed(),
            // Hilbert cell order requires the scatter-free sparse read path
            Some(ArrayType::Dense) => prop_oneof![
                Just(CellOrder::RowMajor),
                Just(CellOrder::ColumnMajor),
            ]
            .boxed(),
        }
    }
}

/// Represents the number of values carried within a single cell of an attribute.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum CellValNum {
    /// The number of values per cell is a specific fixed number.
    Fixed(NonZeroU32),
    /// The number of values per cell varies.
    /// When this option is used for an attribute, each cell carries a
    /// length prefix and the attribute data is logically an
    /// `(offset table, value bytes)` pair.
    Var,
}

impl CellValNum {
    pub fn single() -> Self {
        CellValNum::Fixed(NonZeroU32::new(1).unwrap())
    }

    pub fn is_var_sized(&self) -> bool {
        matches!(self, CellValNum::Var)
    }

    pub fn is_single_valued(&self) -> bool {
        matches!(self, CellValNum::Fixed(nz) if nz.get() == 1)
    }

    /// Return the fixed number of values per cell, if not variable.
    pub fn fixed(&self) -> Option<NonZeroU32> {
        if let CellValNum::Fixed(nz) = self {
            Some(*nz)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum CellValNumError {
    #[error("{} cannot be zero", std::any::type_name::<CellValNum>())]
    CannotBeZero,
}

impl Default for CellValNum {
    fn default() -> Self {
        Self::single()
    }
}

impl Display for CellValNum {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Debug::fmt(self, f)
    }
}

impl TryFrom<u32> for CellValNum {
    type Error = CellValNumError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Err(CellValNumError::CannotBeZero),
            u32::MAX => Ok(CellValNum::Var),
            v => Ok(CellValNum::Fixed(NonZeroU32::new(v).unwrap())),
        }
    }
}

impl From<CellValNum> for u32 {
    fn from(value: CellValNum) -> Self {
        match value {
            CellValNum::Fixed(nz) => nz.get(),
            CellValNum::Var => u32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_order_codes() {
        for t in [
            TileOrder::None,
            TileOrder::RowMajor,
            TileOrder::ColumnMajor,
            TileOrder::Hilbert,
        ] {
            assert_eq!(t, TileOrder::try_from(u8::from(t)).unwrap());
        }
    }

    #[test]
    fn cell_order_codes() {
        for c in [
            CellOrder::RowMajor,
            CellOrder::ColumnMajor,
            CellOrder::Hilbert,
        ] {
            assert_eq!(c, CellOrder::try_from(u8::from(c)).unwrap());
        }
    }

    #[test]
    fn cell_order_zero_is_unset() {
        assert!(CellOrder::try_from(0u8).is_err());
    }

    #[test]
    fn cell_val_num() {
        assert!(CellValNum::try_from(0).is_err());
        assert_eq!(CellValNum::single(), CellValNum::try_from(1).unwrap());
        assert_eq!(CellValNum::Var, CellValNum::try_from(u32::MAX).unwrap());
        assert!(CellValNum::Var.is_var_sized());
        assert!(!CellValNum::Var.is_single_valued());
    }
}
