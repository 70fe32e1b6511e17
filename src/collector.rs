//! Aggregation of compatible peer resources.
//!
//! A collector replaces sets of compatible resources with single aggregate
//! resources, so that many declared operations can be realized by one
//! transition (the canonical case: many package installs, one package
//! manager invocation). The engine guarantees a collector is never asked to
//! merge resources that span its own partition boundaries or that are
//! dependency-connected in the graph.

use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::core::Result;
use crate::graph::ResourceGraph;
use crate::model::resource::{Resource, ResourceId};
use crate::schema::{AttrType, Attrs, SimpleType, Value, ValueKind, valmap};

/// Pluggable aggregation strategy, registered by name.
///
/// `partition` is the coarse, user-controlled split: each returned part
/// contains resources the collector is willing to merge in principle. The
/// engine refines each part further so that no aggregate contains
/// dependency-connected members, then calls `collect` on every refined
/// sub-part, singletons included.
pub trait Collector: Send + Sync {
    /// Unique registered name.
    fn name(&self) -> &str;

    /// Whether the resource is eligible for this collector.
    fn filter(&self, resource: &Resource) -> bool;

    /// Coarse pre-partition. The default puts everything in one part.
    fn partition(&self, resources: Vec<Arc<Resource>>) -> Vec<Vec<Arc<Resource>>> {
        vec![resources]
    }

    /// Fuse one refined sub-part into a single aggregate.
    fn collect(&self, part: &[Arc<Resource>]) -> Result<Arc<Aggregate>>;
}

static AGGREGATE_ID_TYPE: LazyLock<Arc<SimpleType>> = LazyLock::new(|| {
    SimpleType::new_unchecked([("members", AttrType::of(ValueKind::List))])
});

/// Expansion behavior of an aggregate.
///
/// Aggregates must expand into transitions only; emitting a resource fails
/// the plan after the expand-aggregates phase.
pub trait ExpandAggregate: Send + Sync {
    fn expand_into(&self, aggregate: &Aggregate, graph: &mut ResourceGraph) -> Result<()>;
}

/// A resource-like node produced by a [`Collector`], standing in for the
/// members it replaced.
///
/// The member handles are retained for diagnostics and for the expansion
/// itself; the members' graph nodes are gone once collection has run.
pub struct Aggregate {
    kind: String,
    members: Vec<Arc<Resource>>,
    identity: ResourceId,
    expand: Arc<dyn ExpandAggregate>,
}

impl Aggregate {
    /// Build an aggregate of `kind` over `members`.
    ///
    /// The identity is synthesized from the kind and the sorted member
    /// identities, so collecting the same members twice collides in the
    /// graph, which is intended: collection happens once.
    pub fn new(
        kind: impl Into<String>,
        members: Vec<Arc<Resource>>,
        expand: impl ExpandAggregate + 'static,
    ) -> Result<Arc<Self>> {
        let kind = kind.into();
        let mut rendered: Vec<String> =
            members.iter().map(|m| m.identity().to_string()).collect();
        rendered.sort();
        let attrs: Attrs =
            AGGREGATE_ID_TYPE.prepare(valmap([("members", Value::from(rendered))]))?;
        let identity = ResourceId::synthesized(kind.clone(), attrs);
        Ok(Arc::new(Self {
            kind,
            members,
            identity,
            expand: Arc::new(expand),
        }))
    }

    /// The collector-chosen kind string.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The resources this aggregate replaced.
    pub fn members(&self) -> &[Arc<Resource>] {
        &self.members
    }

    /// The synthesized identity.
    pub fn identity(&self) -> ResourceId {
        self.identity.clone()
    }

    /// Populate `graph` with the transitions realizing every member.
    pub fn expand_into(&self, graph: &mut ResourceGraph) -> Result<()> {
        let expand = Arc::clone(&self.expand);
        expand.expand_into(self, graph)
    }
}

impl fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("kind", &self.kind)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{ExpandResource, ResourceType};
    use crate::schema::valmap;

    struct Inert;

    impl ExpandResource for Inert {
        fn expand_into(&self, _resource: &Resource, _graph: &mut ResourceGraph) -> Result<()> {
            Ok(())
        }
    }

    struct NoOp;

    impl ExpandAggregate for NoOp {
        fn expand_into(&self, _aggregate: &Aggregate, _graph: &mut ResourceGraph) -> Result<()> {
            Ok(())
        }
    }

    fn item(name: &str) -> Arc<Resource> {
        let rtype = ResourceType::builder("Item")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .expand(Inert)
            .build()
            .unwrap();
        rtype.instance(valmap([("name", Value::from(name))])).unwrap()
    }

    #[test]
    fn identity_is_member_order_independent() {
        let a = Aggregate::new("Batch", vec![item("a"), item("b")], NoOp).unwrap();
        let b = Aggregate::new("Batch", vec![item("b"), item("a")], NoOp).unwrap();
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn identity_distinguishes_kinds_and_members() {
        let a = Aggregate::new("Batch", vec![item("a")], NoOp).unwrap();
        let b = Aggregate::new("Batch", vec![item("b")], NoOp).unwrap();
        let c = Aggregate::new("Other", vec![item("a")], NoOp).unwrap();
        assert_ne!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }
}
