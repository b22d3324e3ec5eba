//! Standard stage library
//!
//! The operator factories behind every stage type a graph may use, grouped
//! the way the editor groups them: creation, transform/filter, error
//! handling and join/creation.

mod creation;
mod error_handling;
mod expression;
mod join;
mod properties;
mod transform;

pub use creation::CreationFactory;
pub use error_handling::ErrorHandlingFactory;
pub use expression::{Expression, ExpressionLimits, PipelineRef};
pub use join::JoinFactory;
pub use transform::TransformFactory;

use marbleruntime::FactoryRegistry;
use std::sync::Arc;

/// Register every standard stage with default expression limits.
pub fn register_all(registry: &mut FactoryRegistry) {
    register_with_limits(registry, ExpressionLimits::default());
}

/// Register every standard stage, compiling expressions under `limits`.
pub fn register_with_limits(registry: &mut FactoryRegistry, limits: ExpressionLimits) {
    registry.register(Arc::new(CreationFactory::new(limits.clone())));
    registry.register(Arc::new(TransformFactory::new(limits)));
    registry.register(Arc::new(ErrorHandlingFactory));
    registry.register(Arc::new(JoinFactory));
}

/// A registry holding every standard stage.
pub fn standard_registry() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    register_all(&mut registry);
    registry
}
