pub mod array;

pub use array::{
    AttributeData, DimensionData, DomainData, SchemaData,
};
