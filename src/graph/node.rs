//! Graph node variants.
//!
//! The tag set is closed: everything that can sit in a [`super::ResourceGraph`]
//! is one of these. Resources and aggregates are represented by a
//! `Before`/`After` sentinel pair bracketing whatever their expansion
//! produces; the entity itself lives in the graph's side table, keyed by
//! identity.

use std::sync::Arc;

use crate::model::resource::ResourceId;
use crate::model::transition::Transition;

#[derive(Clone)]
pub(crate) enum Node {
    /// Entry sentinel; every graph has exactly one.
    First,
    /// Exit sentinel; every graph has exactly one.
    Last,
    /// User-insertable ordering barrier.
    Checkpoint(u64),
    /// Opens the bracket around an expandable's sub-graph.
    Before(ResourceId),
    /// Closes the bracket around an expandable's sub-graph.
    After(ResourceId),
    /// An executable operation.
    Transition(Arc<Transition>),
    /// Proxy for a resource declared elsewhere, keyed by reference serial.
    Reference(u64),
}
