use proptest::prelude::*;

use super::*;

fn prop_datatype() -> impl Strategy<Value = Datatype> {
    proptest::strategy::Union::new(
        Datatype::iter().map(Just).collect::<Vec<_>>(),
    )
}

fn prop_datatype_for_dimension() -> impl Strategy<Value = Datatype> {
    /* see `Datatype::is_allowed_dimension_type` */
    proptest::strategy::Union::new(
        Datatype::iter()
            .filter(|dt| dt.is_allowed_dimension_type())
            .map(Just)
            .collect::<Vec<_>>(),
    )
}

fn prop_datatype_for_dense_dimension() -> impl Strategy<Value = Datatype> {
    /* dense arrays address a rectilinear integer grid */
    proptest::strategy::Union::new(
        Datatype::iter()
            .filter(|dt| dt.is_integral_type())
            .map(Just)
            .collect::<Vec<_>>(),
    )
}

#[derive(Clone, Debug, Default)]
pub enum DatatypeContext {
    #[default]
    Any,
    Dimension,
    DenseDimension,
}

impl Arbitrary for Datatype {
    type Parameters = DatatypeContext;
    type Strategy = BoxedStrategy<Datatype>;

    fn arbitrary_with(p: Self::Parameters) -> Self::Strategy {
        match p {
            DatatypeContext::Any => prop_datatype().boxed(),
            DatatypeContext::Dimension => {
                prop_datatype_for_dimension().boxed()
            }
            DatatypeContext::DenseDimension => {
                prop_datatype_for_dense_dimension().boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn dimension_datatypes(dt in any_with::<Datatype>(DatatypeContext::Dimension)) {
            assert!(dt.is_allowed_dimension_type());
        }
    }
}
