//! The entity model: typed resources, references, and transitions.

pub mod resource;
pub mod transition;
pub mod types;

pub use resource::{Resource, ResourceId, ResourceRef};
pub use transition::Transition;
pub use types::{
    ExpandResource, PerformTransition, ReadAll, ResourceType, ResourceTypeBuilder, TransitionType,
    TransitionTypeBuilder,
};
