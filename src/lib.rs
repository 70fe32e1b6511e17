//! converge - a declarative host configuration engine
//!
//! The operator describes a desired end state of a host as a collection of
//! typed resources (packages, users, files, service directories) linked by
//! dependency relations; the engine drives the host toward that state by
//! computing and executing an ordered sequence of idempotent transitions.
//!
//! # Architecture
//!
//! Planning turns a user-authored declarative graph into a flat,
//! totally-ordered transition plan:
//!
//! 1. Resources **expand** into sub-graphs of transitions and further
//!    resources, spliced in place, until a fixed point.
//! 2. Registered collectors **collect** compatible peer resources into
//!    aggregates (one package-manager call for many declared packages),
//!    splitting wherever dependencies forbid merging.
//! 3. Aggregates expand, into transitions only.
//!
//! A topological sort of the result is the execution order; `realize` runs
//! it. Dependency edges are checked for cycles on every insertion, so the
//! graph is a DAG at all times.
//!
//! # Core Modules
//!
//! - [`schema`] - Typed, validated attribute bags and their schemas
//! - [`model`] - Resources, references, transitions, and their types
//! - [`graph`] - The mixed dependency graph and its splicing operations
//! - [`realizer`] - The expand/collect/execute state machine
//! - [`collector`] - Pluggable aggregation of compatible resources
//! - [`registry`] - Process-wide name to type lookup
//! - [`factory`] - Registry-indexed construction of instances
//! - [`serialize`] - Loss-less YAML form of resources and transitions
//! - [`plugins`] - Bundled resource and transition implementations
//! - [`core`] - Error types
//!
//! # Example
//!
//! ```no_run
//! use converge::{Realizer, factory, plugins};
//! use converge::schema::{Value, valmap};
//!
//! # fn main() -> converge::Result<()> {
//! plugins::register_all()?;
//!
//! let mut realizer = Realizer::empty();
//! let pkg = realizer.add_resource(
//!     &factory::resource("AptPackage", valmap([("name", Value::from("gitosis"))]))?,
//!     &[],
//! )?;
//! realizer.add_resource(
//!     &factory::resource(
//!         "User",
//!         valmap([("name", Value::from("git")), ("home", Value::from("/var/git"))]),
//!     )?,
//!     &[(&pkg).into()],
//! )?;
//! realizer.realize()?;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod core;
pub mod factory;
pub mod graph;
pub mod model;
pub mod plugins;
pub mod realizer;
pub mod registry;
pub mod schema;
pub mod serialize;

// Fixture types and logging helpers, shared by unit and integration tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crate::core::{EngineError, Result};
pub use crate::graph::{Checkpoint, Dep, ResourceGraph};
pub use crate::model::{Resource, ResourceId, ResourceRef, Transition};
pub use crate::realizer::{Realizer, State};
pub use crate::registry::Registry;
