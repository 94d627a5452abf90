//! Binary cell format shared by write buffers, sort-run files, and the
//! caller-facing buffer export: coordinates first, then attribute values
//! in schema order. A nullable attribute carries one validity byte before
//! its value; a var-sized attribute carries a `u32` value count before
//! its bytes.

use crate::error::{Error, Result};
use crate::schema::{ArraySchema, CellSize};

/// Precomputed per-attribute layout of the cell format.
#[derive(Clone, Debug)]
pub struct CellLayout {
    coords_size: usize,
    attrs: Vec<AttrLayout>,
}

#[derive(Clone, Debug)]
struct AttrLayout {
    nullable: bool,
    cell_size: CellSize,
    elem_size: usize,
}

/// One attribute value inside a cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttrValue<'a> {
    /// `None` for non-nullable attributes.
    pub validity: Option<bool>,
    /// The value bytes, without the count prefix for var-sized attributes.
    pub value: &'a [u8],
}

/// A parsed view over one cell's bytes.
#[derive(Clone, Debug)]
pub struct CellRef<'a> {
    pub coords: &'a [u8],
    pub attrs: Vec<AttrValue<'a>>,
    /// Total encoded size of the cell.
    pub size: usize,
}

impl CellLayout {
    pub fn from_schema(schema: &ArraySchema) -> Self {
        let attrs = schema
            .attributes()
            .iter()
            .enumerate()
            .map(|(i, a)| AttrLayout {
                nullable: a.is_nullable(),
                cell_size: schema.compute_cell_size(i),
                elem_size: a.datatype.size(),
            })
            .collect();
        CellLayout {
            coords_size: schema.coords_size(),
            attrs,
        }
    }

    pub fn coords_size(&self) -> usize {
        self.coords_size
    }

    /// Encoded size of the cell starting at `bytes`, which may extend
    /// beyond one cell.
    pub fn cell_size(&self, bytes: &[u8]) -> Result<usize> {
        Ok(self.parse(bytes)?.size)
    }

    /// Splits one encoded cell into coordinates and attribute values.
    pub fn parse<'a>(&self, bytes: &'a [u8]) -> Result<CellRef<'a>> {
        let truncated =
            || Error::Corrupted("truncated cell record".to_owned());

        if bytes.len() < self.coords_size {
            return Err(truncated());
        }
        let coords = &bytes[..self.coords_size];
        let mut offset = self.coords_size;
        let mut attrs = Vec::with_capacity(self.attrs.len());

        for layout in self.attrs.iter() {
            let validity = if layout.nullable {
                let v = *bytes.get(offset).ok_or_else(truncated)?;
                offset += 1;
                Some(v != 0)
            } else {
                None
            };
            let value_size = match layout.cell_size {
                CellSize::Fixed(size) => size,
                CellSize::Var => {
                    let raw = bytes
                        .get(offset..offset + 4)
                        .ok_or_else(truncated)?;
                    offset += 4;
                    let count =
                        u32::from_le_bytes(raw.try_into().unwrap()) as usize;
                    count * layout.elem_size
                }
            };
            let value = bytes
                .get(offset..offset + value_size)
                .ok_or_else(truncated)?;
            offset += value_size;
            attrs.push(AttrValue { validity, value });
        }

        Ok(CellRef {
            coords,
            attrs,
            size: offset,
        })
    }

    /// Encodes a cell from its parts, appending to `out`.
    ///
    /// `values` must supply one entry per attribute in schema order.
    pub fn encode(
        &self,
        coords: &[u8],
        values: &[AttrValue],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if coords.len() != self.coords_size {
            return Err(Error::SchemaInvalid(format!(
                "expected {} coordinate bytes, got {}",
                self.coords_size,
                coords.len()
            )));
        }
        if values.len() != self.attrs.len() {
            return Err(Error::SchemaInvalid(format!(
                "expected {} attribute values, got {}",
                self.attrs.len(),
                values.len()
            )));
        }

        out.extend_from_slice(coords);
        for (layout, v) in self.attrs.iter().zip(values.iter()) {
            if layout.nullable {
                out.push(v.validity.unwrap_or(true) as u8);
            }
            match layout.cell_size {
                CellSize::Fixed(size) => {
                    if v.value.len() != size {
                        return Err(Error::SchemaInvalid(format!(
                            "expected {size} value bytes, got {}",
                            v.value.len()
                        )));
                    }
                }
                CellSize::Var => {
                    if v.value.len() % layout.elem_size != 0 {
                        return Err(Error::SchemaInvalid(format!(
                            "var value of {} bytes is not a multiple of \
                             the element size {}",
                            v.value.len(),
                            layout.elem_size
                        )));
                    }
                    let count = (v.value.len() / layout.elem_size) as u32;
                    out.extend_from_slice(&count.to_le_bytes());
                }
            }
            out.extend_from_slice(v.value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tiledb_common::array::{ArrayType, CellOrder, TileOrder};
    use tiledb_common::datatype::Datatype;
    use tiledb_pod::array::{
        AttributeData, DimensionData, DomainData, SchemaData,
    };

    use super::*;
    use crate::schema::ArraySchema;

    fn schema_with_var_attr() -> ArraySchema {
        ArraySchema::new(SchemaData {
            array_name: "cells".to_owned(),
            array_type: ArrayType::Sparse,
            domain: DomainData {
                datatype: Datatype::UInt32,
                dimension: vec![DimensionData {
                    name: "x".to_owned(),
                    domain: [0.0, 99.0],
                    extent: None,
                }],
            },
            capacity: Some(2),
            cell_order: Some(CellOrder::RowMajor),
            tile_order: Some(TileOrder::None),
            consolidation_step: None,
            attributes: vec![
                AttributeData {
                    name: "a".to_owned(),
                    datatype: Datatype::Int32,
                    cell_val_num: None,
                    nullability: Some(true),
                    filters: vec![],
                },
                AttributeData {
                    name: "s".to_owned(),
                    datatype: Datatype::StringUtf8,
                    cell_val_num: None,
                    nullability: None,
                    filters: vec![],
                },
            ],
        })
        .unwrap()
    }

    #[test]
    fn encode_parse_roundtrip() {
        let schema = schema_with_var_attr();
        let layout = CellLayout::from_schema(&schema);

        let coords = 7u32.to_le_bytes();
        let a = 42i32.to_le_bytes();
        let values = [
            AttrValue {
                validity: Some(true),
                value: &a,
            },
            AttrValue {
                validity: None,
                value: b"hello",
            },
        ];

        let mut bytes = Vec::new();
        layout.encode(&coords, &values, &mut bytes).unwrap();
        // coords(4) + validity(1) + i32(4) + count(4) + "hello"(5)
        assert_eq!(18, bytes.len());

        let cell = layout.parse(&bytes).unwrap();
        assert_eq!(&coords, cell.coords);
        assert_eq!(Some(true), cell.attrs[0].validity);
        assert_eq!(&a, cell.attrs[0].value);
        assert_eq!(b"hello".as_slice(), cell.attrs[1].value);
        assert_eq!(bytes.len(), cell.size);
    }

    #[test]
    fn parse_rejects_truncation() {
        let schema = schema_with_var_attr();
        let layout = CellLayout::from_schema(&schema);

        let coords = 7u32.to_le_bytes();
        let a = 42i32.to_le_bytes();
        let values = [
            AttrValue {
                validity: Some(false),
                value: &a,
            },
            AttrValue {
                validity: None,
                value: b"xyz",
            },
        ];
        let mut bytes = Vec::new();
        layout.encode(&coords, &values, &mut bytes).unwrap();

        for cut in 0..bytes.len() {
            assert!(
                layout.parse(&bytes[..cut]).is_err(),
                "cut at {cut} parsed"
            );
        }
    }

    #[test]
    fn empty_var_value() {
        let schema = schema_with_var_attr();
        let layout = CellLayout::from_schema(&schema);

        let coords = 0u32.to_le_bytes();
        let a = 1i32.to_le_bytes();
        let values = [
            AttrValue {
                validity: Some(true),
                value: &a,
            },
            AttrValue {
                validity: None,
                value: b"",
            },
        ];
        let mut bytes = Vec::new();
        layout.encode(&coords, &values, &mut bytes).unwrap();
        let cell = layout.parse(&bytes).unwrap();
        assert!(cell.attrs[1].value.is_empty());
    }
}
