//! Bidirectional logical/physical type mapping
//!
//! A mapper answers for the types it knows and rejects the rest with
//! [`MappingError::Unsupported`]. [`CompositeMapper`] chains mappers and
//! keeps the first success; [`DeferredMapper`] lets a child call back into
//! the composite that contains it.

use std::fmt;
use std::sync::Arc;

use super::types::LogicalType;
use crate::error::MappingError;

pub trait TypeMapper<P>: Send + Sync {
    fn logical_to_physical(&self, logical: &LogicalType) -> Result<P, MappingError>;

    fn physical_to_logical(&self, physical: &P) -> Result<LogicalType, MappingError>;
}

/// Ordered chain of mappers; order decides which shape wins
pub struct CompositeMapper<P> {
    name: String,
    mappers: Vec<Arc<dyn TypeMapper<P>>>,
}

impl<P> CompositeMapper<P> {
    pub fn new(name: impl Into<String>, mappers: Vec<Arc<dyn TypeMapper<P>>>) -> Self {
        Self {
            name: name.into(),
            mappers,
        }
    }
}

impl<P: fmt::Display> TypeMapper<P> for CompositeMapper<P> {
    fn logical_to_physical(&self, logical: &LogicalType) -> Result<P, MappingError> {
        self.mappers
            .iter()
            .find_map(|m| m.logical_to_physical(logical).ok())
            .ok_or_else(|| MappingError::unsupported_logical(&self.name, logical.data_type.to_string()))
    }

    fn physical_to_logical(&self, physical: &P) -> Result<LogicalType, MappingError> {
        self.mappers
            .iter()
            .find_map(|m| m.physical_to_logical(physical).ok())
            .ok_or_else(|| MappingError::unsupported_physical(&self.name, physical.to_string()))
    }
}

type MapperFactory<P> = dyn Fn() -> Option<Arc<dyn TypeMapper<P>>> + Send + Sync;

/// Resolves its target through a factory on every call
///
/// Built with a factory that upgrades a `Weak` handle to the enclosing
/// composite, so the mapper graph holds no strong cycle.
pub struct DeferredMapper<P> {
    factory: Box<MapperFactory<P>>,
}

impl<P> DeferredMapper<P> {
    pub fn new(factory: impl Fn() -> Option<Arc<dyn TypeMapper<P>>> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
        }
    }

    fn target(&self) -> Result<Arc<dyn TypeMapper<P>>, MappingError> {
        (self.factory)().ok_or(MappingError::Unresolved)
    }
}

impl<P> TypeMapper<P> for DeferredMapper<P> {
    fn logical_to_physical(&self, logical: &LogicalType) -> Result<P, MappingError> {
        self.target()?.logical_to_physical(logical)
    }

    fn physical_to_logical(&self, physical: &P) -> Result<LogicalType, MappingError> {
        self.target()?.physical_to_logical(physical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::types::DataType;
    use std::sync::Weak;

    /// Maps one data type to a fixed name
    struct Named(DataType, &'static str);

    impl TypeMapper<String> for Named {
        fn logical_to_physical(&self, logical: &LogicalType) -> Result<String, MappingError> {
            if logical.data_type == self.0 {
                Ok(self.1.to_string())
            } else {
                Err(MappingError::unsupported_logical("named", logical.data_type.to_string()))
            }
        }

        fn physical_to_logical(&self, physical: &String) -> Result<LogicalType, MappingError> {
            if physical == self.1 {
                Ok(LogicalType::new(self.0.clone()))
            } else {
                Err(MappingError::unsupported_physical("named", physical.clone()))
            }
        }
    }

    /// Wraps list element names by calling back into the composite
    struct ListOf(Arc<dyn TypeMapper<String>>);

    impl TypeMapper<String> for ListOf {
        fn logical_to_physical(&self, logical: &LogicalType) -> Result<String, MappingError> {
            match &logical.data_type {
                DataType::List(element) => Ok(format!(
                    "List[{}]",
                    self.0.logical_to_physical(&LogicalType::new((**element).clone()))?
                )),
                other => Err(MappingError::unsupported_logical("list", other.to_string())),
            }
        }

        fn physical_to_logical(&self, physical: &String) -> Result<LogicalType, MappingError> {
            Err(MappingError::unsupported_physical("list", physical.clone()))
        }
    }

    #[test]
    fn test_composite_first_success_wins() {
        let composite = CompositeMapper::new(
            "test",
            vec![
                Arc::new(Named(DataType::Int32, "first")) as Arc<dyn TypeMapper<String>>,
                Arc::new(Named(DataType::Int32, "second")),
            ],
        );

        let physical = composite.logical_to_physical(&LogicalType::new(DataType::Int32)).unwrap();
        assert_eq!(physical, "first");
        assert!(matches!(
            composite.logical_to_physical(&LogicalType::new(DataType::String)),
            Err(MappingError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_deferred_mapper_recurses_into_composite() {
        let composite: Arc<CompositeMapper<String>> = Arc::new_cyclic(|weak: &Weak<CompositeMapper<String>>| {
            let weak = weak.clone();
            let deferred: Arc<dyn TypeMapper<String>> = Arc::new(DeferredMapper::new(move || {
                weak.upgrade().map(|m| m as Arc<dyn TypeMapper<String>>)
            }));
            CompositeMapper::new(
                "test",
                vec![
                    Arc::new(ListOf(deferred)) as Arc<dyn TypeMapper<String>>,
                    Arc::new(Named(DataType::Int64, "I64")),
                ],
            )
        });

        let nested = LogicalType::new(DataType::list_of(DataType::list_of(DataType::Int64)));
        assert_eq!(composite.logical_to_physical(&nested).unwrap(), "List[List[I64]]");
    }

    #[test]
    fn test_deferred_mapper_without_target() {
        let deferred: DeferredMapper<String> = DeferredMapper::new(|| None);
        assert_eq!(
            deferred.logical_to_physical(&LogicalType::new(DataType::Int32)),
            Err(MappingError::Unresolved)
        );
    }
}
