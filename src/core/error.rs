//! Error handling for the converge engine.
//!
//! The error system follows two principles:
//! 1. **Strongly-typed errors** so callers can match on precise failure modes
//! 2. **Self-describing messages** carrying the identities involved, so a
//!    planning failure can be diagnosed without re-running with extra logging
//!
//! # Error Categories
//!
//! - **Schema validation**: [`EngineError::ValidationFailure`],
//!   [`EngineError::MissingAttribute`], [`EngineError::UnknownAttribute`]
//! - **Registry**: [`EngineError::UnknownType`], [`EngineError::AlreadyRegistered`],
//!   [`EngineError::Registration`]
//! - **Graph structure**: [`EngineError::IdentityConflict`],
//!   [`EngineError::NotInGraph`], [`EngineError::Cycle`]
//! - **Planning lifecycle**: [`EngineError::StateViolation`],
//!   [`EngineError::UncollectedResource`], [`EngineError::AggregateProducedResource`]
//! - **Execution**: [`EngineError::AlreadyRealized`], [`EngineError::TransitionFailed`],
//!   [`EngineError::StateRead`]
//!
//! Planning errors are always fatal: no partial plan is executed. During
//! execution the first [`EngineError::TransitionFailed`] halts the loop and
//! already-realized transitions stay realized.
//!
//! Side-effecting plugin code (transition performers, attribute readers)
//! reports failures through [`anyhow::Error`] so implementations can attach
//! context freely; the engine wraps those into the typed variants here.

use thiserror::Error;

/// Crate-wide result alias over [`EngineError`].
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// The error type for all engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An attribute value is outside its schema.
    ///
    /// Raised by native-type constraints, enumerated value sets, validator
    /// predicates, and reference target-type checks.
    #[error("invalid value for attribute '{attr}': {reason}")]
    ValidationFailure {
        /// Name of the offending attribute
        attr: String,
        /// Which constraint was violated and how
        reason: String,
    },

    /// A required attribute with no default was not provided.
    #[error("attribute '{attr}' is required and has no default")]
    MissingAttribute {
        /// Name of the missing attribute
        attr: String,
    },

    /// A value-dict contains a name the type does not declare.
    #[error("unknown attribute '{attr}'")]
    UnknownAttribute {
        /// The undeclared name
        attr: String,
    },

    /// A registry lookup missed.
    #[error("unknown {kind} type '{name}'")]
    UnknownType {
        /// Which table was consulted ("resource", "transition", "collector")
        kind: &'static str,
        /// The name that was looked up
        name: String,
    },

    /// A name was registered twice in the same registry table.
    #[error("{kind} '{name}' is already registered")]
    AlreadyRegistered {
        /// Which table rejected the registration
        kind: &'static str,
        /// The conflicting name
        name: String,
    },

    /// A plugin's registration entry point failed.
    #[error("plugin registration failed: {message}")]
    Registration {
        /// Description of the underlying registration failure
        message: String,
    },

    /// Two distinct resources share an identity within the same graph.
    ///
    /// Adding a resource whose identity already exists returns the existing
    /// instance when the declarations are structurally equal; this error is
    /// raised when the wanted states differ.
    #[error("conflicting declarations for resource {identity}")]
    IdentityConflict {
        /// Rendered identity of the conflicting resource
        identity: String,
    },

    /// A dependency or reference names a node that is not in the graph.
    #[error("{what} is not in the graph")]
    NotInGraph {
        /// Rendered description of the missing element
        what: String,
    },

    /// A would-be edge creates a cycle.
    ///
    /// Carries the pre-existing reverse path for diagnostics. Simple edge
    /// additions leave the graph unchanged; a cycle detected after a splice
    /// or a collection is fatal to the plan.
    #[error("dependency would create a cycle: {}", path.join(" -> "))]
    Cycle {
        /// The reverse path that already connects the two nodes
        path: Vec<String>,
    },

    /// A graph edit was attempted outside the state that permits it.
    #[error("cannot {operation} in state {state}")]
    StateViolation {
        /// The rejected operation
        operation: String,
        /// The state the engine was in
        state: String,
    },

    /// A collectible resource was claimed by no registered collector.
    #[error("resource {resource} is collectible but no collector claimed it")]
    UncollectedResource {
        /// Rendered identity of the orphaned resource
        resource: String,
    },

    /// An aggregate's expansion emitted a resource.
    ///
    /// Aggregates must expand into transitions only; anything else would
    /// reopen planning after the collect phase has completed.
    #[error("aggregate {aggregate} expanded into resource {resource}")]
    AggregateProducedResource {
        /// Rendered identity of the offending aggregate
        aggregate: String,
        /// Rendered identity of the emitted resource
        resource: String,
    },

    /// A transition's `realize` was called twice.
    #[error("transition {transition} has already been realized")]
    AlreadyRealized {
        /// Rendered description of the transition
        transition: String,
    },

    /// The side effect behind a transition failed.
    #[error("transition {transition} failed")]
    TransitionFailed {
        /// Rendered description of the transition
        transition: String,
        /// The underlying failure from the performer
        #[source]
        source: anyhow::Error,
    },

    /// Reading live state for a resource failed.
    #[error("could not read current state of {resource}")]
    StateRead {
        /// Rendered identity of the resource being read
        resource: String,
        /// The underlying failure from the reader
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    /// Shorthand for a [`EngineError::ValidationFailure`].
    pub fn invalid(attr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailure {
            attr: attr.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_renders_path() {
        let err = EngineError::Cycle {
            path: vec!["before User(name=git)".into(), "transition Command#3".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("before User(name=git) -> transition Command#3"));
    }

    #[test]
    fn transition_failure_preserves_source() {
        let err = EngineError::TransitionFailed {
            transition: "Command#1".into(),
            source: anyhow::anyhow!("exit status 2"),
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("exit status 2"));
    }
}
