//! Planning and execution over a [`ResourceGraph`].
//!
//! The realizer drives the user's authored graph to a fully expanded, fully
//! collected plan, then executes it:
//!
//! 1. **Expand**: every non-collectible resource is replaced by the
//!    sub-graph that realizes it, to a fixed point (expansion may introduce
//!    further resources).
//! 2. **Collect**: each registered collector, in registration order, merges
//!    compatible peer resources into aggregates. Within a collector's own
//!    partition, sub-parts are merged only while no dependency path
//!    connects them.
//! 3. **Expand aggregates**: aggregates expand into transitions only.
//!
//! After freezing, a topological sort of the surviving transitions is the
//! execution order. Three states gate the lifecycle: graph edits are only
//! permitted in `Init`, planning moves the realizer to `Frozen`, and a
//! successful run ends in `Realized`.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::collector::Collector;
use crate::core::{EngineError, Result};
use crate::graph::{Checkpoint, Dep, ResourceGraph};
use crate::model::resource::{Resource, ResourceRef};
use crate::model::transition::Transition;
use crate::registry::Registry;

/// Lifecycle states, advancing monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Graph construction; every edit is permitted.
    Init,
    /// Planning is complete; the graph is immutable.
    Frozen,
    /// The plan has executed successfully.
    Realized,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Init => "init",
            State::Frozen => "frozen",
            State::Realized => "realized",
        };
        f.write_str(name)
    }
}

/// Owns a root [`ResourceGraph`] and drives it to realization.
pub struct Realizer {
    graph: ResourceGraph,
    state: State,
}

impl Realizer {
    /// Take ownership of an authored graph.
    pub fn new(graph: ResourceGraph) -> Self {
        Self {
            graph,
            state: State::Init,
        }
    }

    /// An empty realizer; resources are added through the proxy methods.
    pub fn empty() -> Self {
        Self::new(ResourceGraph::new())
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Read access to the owned graph.
    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    fn editable(&mut self, operation: &str) -> Result<&mut ResourceGraph> {
        if self.state != State::Init {
            return Err(EngineError::StateViolation {
                operation: operation.to_string(),
                state: self.state.to_string(),
            });
        }
        Ok(&mut self.graph)
    }

    /// Add a resource to be realized. Rejected once frozen.
    pub fn add_resource(
        &mut self,
        resource: &Arc<Resource>,
        depends: &[Dep],
    ) -> Result<Arc<Resource>> {
        self.editable("add resource")?.add_resource(resource, depends)
    }

    /// Add a transition. Rejected once frozen.
    pub fn add_transition(
        &mut self,
        transition: Arc<Transition>,
        depends: &[Dep],
    ) -> Result<Arc<Transition>> {
        self.editable("add transition")?.add_transition(transition, depends)
    }

    /// Add an ordering barrier. Rejected once frozen.
    pub fn add_checkpoint(&mut self, depends: &[Dep]) -> Result<Checkpoint> {
        self.editable("add checkpoint")?.add_checkpoint(depends)
    }

    /// Add the dependency edge `a -> b`. Rejected once frozen.
    pub fn add_dependency(&mut self, a: &Dep, b: &Dep) -> Result<()> {
        self.editable("add dependency")?.add_dependency(a, b)
    }

    /// Create a reference to an added resource. Rejected once frozen.
    pub fn make_ref(&mut self, resource: &Arc<Resource>, depends: &[Dep]) -> Result<ResourceRef> {
        self.editable("make reference")?.make_ref(resource, depends)
    }

    /// Run planning to completion and freeze the graph.
    ///
    /// Idempotent once frozen. Any planning failure is fatal: no partial
    /// plan will execute.
    pub fn ensure_frozen(&mut self) -> Result<()> {
        match self.state {
            State::Frozen => return Ok(()),
            State::Realized => {
                return Err(EngineError::StateViolation {
                    operation: "freeze".to_string(),
                    state: self.state.to_string(),
                });
            }
            State::Init => {}
        }

        self.expand_phase()?;
        self.collect_phase()?;
        self.expand_aggregates_phase()?;
        self.require_references_resolved()?;

        self.state = State::Frozen;
        info!("plan frozen");
        Ok(())
    }

    /// Freeze, then execute every transition in topological order.
    ///
    /// The first failure halts the loop; already-realized transitions are
    /// not rolled back. Transitions decide for themselves whether their
    /// operation is idempotent on a re-run.
    pub fn realize(&mut self) -> Result<()> {
        self.ensure_frozen()?;
        let plan = self.graph.sorted_transitions()?;
        info!(transitions = plan.len(), "realizing plan");
        for transition in plan {
            transition.realize()?;
        }
        self.state = State::Realized;
        Ok(())
    }

    /// The execution order. Only meaningful once frozen.
    pub fn sorted_transitions(&self) -> Result<Vec<Arc<Transition>>> {
        self.graph.sorted_transitions()
    }

    /// Expansion may introduce new resources that themselves need
    /// expansion, so each round works on a snapshot and the loop runs until
    /// a round finds nothing left.
    fn expand_phase(&mut self) -> Result<()> {
        loop {
            let fresh = self.graph.iter_unexpanded_resources();
            if fresh.is_empty() {
                break;
            }
            debug!(count = fresh.len(), "expansion round");
            for resource in fresh {
                self.graph.expand_resource(&resource.identity())?;
            }
        }
        Ok(())
    }

    /// Each collector runs once, in registration order.
    fn collect_phase(&mut self) -> Result<()> {
        let collectors = Registry::read().collectors();
        for collector in collectors {
            self.run_collector(collector.as_ref())?;
        }
        let orphaned = self.graph.iter_uncollected_resources();
        if let Some(resource) = orphaned.first() {
            return Err(EngineError::UncollectedResource {
                resource: resource.identity().to_string(),
            });
        }
        Ok(())
    }

    fn run_collector(&mut self, collector: &dyn Collector) -> Result<()> {
        let eligible: Vec<Arc<Resource>> = self
            .graph
            .iter_uncollected_resources()
            .into_iter()
            .filter(|r| collector.filter(r))
            .collect();
        if eligible.is_empty() {
            return Ok(());
        }
        debug!(collector = collector.name(), eligible = eligible.len(), "collecting");

        for part in collector.partition(eligible) {
            for sub_part in self.refine_partition(part) {
                if sub_part.is_empty() {
                    continue;
                }
                // Singletons aggregate too; collection is uniform.
                let aggregate = collector.collect(&sub_part)?;
                self.graph.collect_resources(&sub_part, aggregate)?;
            }
        }
        Ok(())
    }

    /// Dependency-compatible refinement of one collector part.
    ///
    /// Starts from singletons and merges any two sub-parts with no
    /// dependency path between their members, in either direction, until no
    /// merge applies. Quadratic per step over small parts; any valid
    /// partition among the alternatives is acceptable.
    fn refine_partition(&self, part: Vec<Arc<Resource>>) -> Vec<Vec<Arc<Resource>>> {
        let mut parts: Vec<Vec<Arc<Resource>>> =
            part.into_iter().map(|resource| vec![resource]).collect();
        loop {
            let mut merged = None;
            'search: for i in 0..parts.len() {
                for j in (i + 1)..parts.len() {
                    if self.parts_mergeable(&parts[i], &parts[j]) {
                        merged = Some((i, j));
                        break 'search;
                    }
                }
            }
            let Some((i, j)) = merged else {
                break;
            };
            let absorbed = parts.swap_remove(j);
            parts[i].extend(absorbed);
        }
        parts
    }

    fn parts_mergeable(&self, a: &[Arc<Resource>], b: &[Arc<Resource>]) -> bool {
        for left in a {
            for right in b {
                if self.graph.resources_connected(&left.identity(), &right.identity()) {
                    return false;
                }
            }
        }
        true
    }

    /// Aggregates expand into transitions only; anything still unprocessed
    /// afterwards means an aggregate tried to reopen planning.
    fn expand_aggregates_phase(&mut self) -> Result<()> {
        let aggregates = self.graph.iter_unexpanded_aggregates();
        for aggregate in &aggregates {
            self.graph.expand_resource(&aggregate.identity())?;
        }
        if self.graph.has_unprocessed() {
            let resource = self
                .graph
                .unprocessed_identities()
                .first()
                .map(ToString::to_string)
                .unwrap_or_default();
            let aggregate = aggregates
                .first()
                .map(|a| a.identity().to_string())
                .unwrap_or_default();
            return Err(EngineError::AggregateProducedResource {
                aggregate,
                resource,
            });
        }
        Ok(())
    }

    fn require_references_resolved(&self) -> Result<()> {
        let unresolved = self.graph.unresolved_references();
        if let Some(target) = unresolved.first() {
            return Err(EngineError::NotInGraph {
                what: format!("reference target {target}"),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Realizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realizer")
            .field("state", &self.state)
            .field("graph", &self.graph)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{ExpandResource, ResourceType};
    use crate::schema::{AttrType, Value, ValueKind, valmap};

    struct Inert;

    impl ExpandResource for Inert {
        fn expand_into(
            &self,
            _resource: &Resource,
            _graph: &mut ResourceGraph,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn widget() -> Arc<Resource> {
        ResourceType::builder("InertWidget")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .expand(Inert)
            .build()
            .unwrap()
            .instance(valmap([("name", Value::from("w"))]))
            .unwrap()
    }

    #[test]
    fn edits_rejected_once_frozen() {
        let mut realizer = Realizer::empty();
        realizer.add_resource(&widget(), &[]).unwrap();
        realizer.ensure_frozen().unwrap();
        assert_eq!(realizer.state(), State::Frozen);

        let err = realizer.add_resource(&widget(), &[]).unwrap_err();
        assert!(matches!(err, EngineError::StateViolation { .. }));
    }

    #[test]
    fn freeze_is_idempotent() {
        let mut realizer = Realizer::empty();
        realizer.add_resource(&widget(), &[]).unwrap();
        realizer.ensure_frozen().unwrap();
        realizer.ensure_frozen().unwrap();
        assert_eq!(realizer.state(), State::Frozen);
    }

    #[test]
    fn realize_advances_to_realized() {
        let mut realizer = Realizer::empty();
        realizer.add_resource(&widget(), &[]).unwrap();
        realizer.realize().unwrap();
        assert_eq!(realizer.state(), State::Realized);

        // A realized plan cannot be re-frozen or re-run.
        let err = realizer.realize().unwrap_err();
        assert!(matches!(err, EngineError::StateViolation { .. }));
    }

    #[test]
    fn dangling_reference_fails_freeze() {
        let rtype = ResourceType::builder("Ghostly")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .expand(Inert)
            .build()
            .unwrap();
        let rref = rtype.reference(valmap([("name", Value::from("ghost"))])).unwrap();

        let mut graph = ResourceGraph::new();
        graph.make_ref_to(&rref, &[]).unwrap();
        let mut realizer = Realizer::new(graph);
        let err = realizer.ensure_frozen().unwrap_err();
        assert!(matches!(err, EngineError::NotInGraph { .. }));
    }
}
