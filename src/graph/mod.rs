//! The mixed graph of resources, transitions, sentinels, and references.
//!
//! A `ResourceGraph` holds the user's declarative statement of intent and
//! every intermediate planning state, and maintains one invariant across all
//! of it: the graph is a DAG. Resources and aggregates appear as
//! `Before`/`After` sentinel pairs; expansion splices a sub-graph between a
//! pair, collection re-parents several pairs onto an aggregate's pair. Every
//! non-sentinel node lies on a path from the entry sentinel to the exit
//! sentinel.
//!
//! Identity is structural: a resource is keyed by its type name plus
//! identity attrs, and the same declared resource unifies no matter how many
//! call sites declare it. Transitions have no identity and never unify.
//!
//! Edge additions are checked with a reachability query and reverted on
//! failure. Splices and collections re-check acyclicity afterwards; a
//! violation there is fatal to the plan, not recoverable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use petgraph::Direction;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use tracing::{debug, trace};

use crate::collector::Aggregate;
use crate::core::{EngineError, Result};
use crate::model::resource::{Resource, ResourceId, ResourceRef};
use crate::model::transition::Transition;

mod node;

use node::Node;

static NEXT_REF_SERIAL: AtomicU64 = AtomicU64::new(1);
static NEXT_CHECKPOINT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Handle to a checkpoint node, usable as a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checkpoint {
    serial: u64,
}

/// Something a graph element can depend on.
#[derive(Clone)]
pub enum Dep {
    /// An added resource; dependents are ordered after its whole expansion.
    Resource(Arc<Resource>),
    /// A reference to a resource declared in this or an enclosing graph.
    Reference(ResourceRef),
    /// An added transition.
    Transition(Arc<Transition>),
    /// A checkpoint barrier.
    Checkpoint(Checkpoint),
}

impl Dep {
    fn describe(&self) -> String {
        match self {
            Dep::Resource(r) => format!("resource {}", r.identity()),
            Dep::Reference(r) => format!("reference to {}", r.target_identity()),
            Dep::Transition(t) => format!("transition {}", t.describe()),
            Dep::Checkpoint(c) => format!("checkpoint#{}", c.serial),
        }
    }
}

impl From<Arc<Resource>> for Dep {
    fn from(r: Arc<Resource>) -> Self {
        Dep::Resource(r)
    }
}

impl From<&Arc<Resource>> for Dep {
    fn from(r: &Arc<Resource>) -> Self {
        Dep::Resource(Arc::clone(r))
    }
}

impl From<ResourceRef> for Dep {
    fn from(r: ResourceRef) -> Self {
        Dep::Reference(r)
    }
}

impl From<&ResourceRef> for Dep {
    fn from(r: &ResourceRef) -> Self {
        Dep::Reference(r.clone())
    }
}

impl From<Arc<Transition>> for Dep {
    fn from(t: Arc<Transition>) -> Self {
        Dep::Transition(t)
    }
}

impl From<&Arc<Transition>> for Dep {
    fn from(t: &Arc<Transition>) -> Self {
        Dep::Transition(Arc::clone(t))
    }
}

impl From<Checkpoint> for Dep {
    fn from(c: Checkpoint) -> Self {
        Dep::Checkpoint(c)
    }
}

/// A node that goes through expansion: a plain resource or an aggregate.
#[derive(Clone)]
pub enum Expandable {
    Resource(Arc<Resource>),
    Aggregate(Arc<Aggregate>),
}

impl Expandable {
    /// The identity keying this expandable in the graph.
    pub fn identity(&self) -> ResourceId {
        match self {
            Expandable::Resource(r) => r.identity(),
            Expandable::Aggregate(a) => a.identity(),
        }
    }

    /// Whether this is an aggregate produced by a collector.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expandable::Aggregate(_))
    }

    fn expand_into(&self, graph: &mut ResourceGraph) -> Result<()> {
        match self {
            Expandable::Resource(r) => r.expand_into(graph),
            Expandable::Aggregate(a) => a.expand_into(graph),
        }
    }
}

struct Entry {
    item: Expandable,
    before: NodeIndex,
    after: NodeIndex,
    processed: bool,
    prebound: Option<Box<ResourceGraph>>,
}

struct RefEntry {
    target: ResourceId,
    node: NodeIndex,
    bound: bool,
}

/// A graph of resources and transitions linked by dependencies.
pub struct ResourceGraph {
    graph: StableDiGraph<Node, ()>,
    first: NodeIndex,
    last: NodeIndex,
    entries: IndexMap<ResourceId, Entry>,
    transition_nodes: HashMap<u64, NodeIndex>,
    refs: IndexMap<u64, RefEntry>,
    ref_by_target: HashMap<ResourceId, u64>,
    checkpoint_nodes: HashMap<u64, NodeIndex>,
    deferred_top: Vec<Arc<Resource>>,
    nested: bool,
}

impl ResourceGraph {
    /// An empty top-level graph.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// An empty sub-graph, as handed to expansion code. Resources queued
    /// with [`ResourceGraph::add_to_top`] are promoted when the sub-graph is
    /// spliced into its parent.
    pub(crate) fn new_nested() -> Self {
        Self::build(true)
    }

    fn build(nested: bool) -> Self {
        let mut graph = StableDiGraph::new();
        let first = graph.add_node(Node::First);
        let last = graph.add_node(Node::Last);
        graph.add_edge(first, last, ());
        Self {
            graph,
            first,
            last,
            entries: IndexMap::new(),
            transition_nodes: HashMap::new(),
            refs: IndexMap::new(),
            ref_by_target: HashMap::new(),
            checkpoint_nodes: HashMap::new(),
            deferred_top: Vec::new(),
            nested,
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Insert a transition with edges from each dependency.
    ///
    /// Fails with [`EngineError::NotInGraph`] if a dependency is foreign and
    /// [`EngineError::Cycle`] if a dependency edge would close a cycle.
    pub fn add_transition(
        &mut self,
        transition: Arc<Transition>,
        depends: &[Dep],
    ) -> Result<Arc<Transition>> {
        let node = match self.transition_nodes.get(&transition.serial()) {
            Some(&node) => node,
            None => {
                let node = self.add_node_raw(Node::Transition(Arc::clone(&transition)));
                self.transition_nodes.insert(transition.serial(), node);
                node
            }
        };
        for dep in depends {
            let source = self.nodeify_source(dep)?;
            self.add_edge_checked(source, node)?;
        }
        Ok(transition)
    }

    /// Insert a resource, deduplicated by identity.
    ///
    /// If an equal resource is already present it is returned; an unequal
    /// resource with the same identity fails with
    /// [`EngineError::IdentityConflict`].
    pub fn add_resource(
        &mut self,
        resource: &Arc<Resource>,
        depends: &[Dep],
    ) -> Result<Arc<Resource>> {
        let id = resource.identity();
        if let Some(entry) = self.entries.get(&id) {
            let existing = match &entry.item {
                Expandable::Resource(existing) if **existing == **resource => Arc::clone(existing),
                _ => {
                    return Err(EngineError::IdentityConflict {
                        identity: id.to_string(),
                    });
                }
            };
            let before = entry.before;
            trace!(resource = %id, "deduplicated resource declaration");
            for dep in depends {
                let source = self.nodeify_source(dep)?;
                self.add_edge_checked(source, before)?;
            }
            return Ok(existing);
        }
        trace!(resource = %id, "adding resource");
        self.insert_expandable(Expandable::Resource(Arc::clone(resource)), depends)?;
        self.bind_available_refs()?;
        Ok(Arc::clone(resource))
    }

    /// Insert an ordering barrier: everything it depends on completes before
    /// anything that depends on it starts.
    pub fn add_checkpoint(&mut self, depends: &[Dep]) -> Result<Checkpoint> {
        let serial = NEXT_CHECKPOINT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let node = self.add_node_raw(Node::Checkpoint(serial));
        self.checkpoint_nodes.insert(serial, node);
        for dep in depends {
            let source = self.nodeify_source(dep)?;
            self.add_edge_checked(source, node)?;
        }
        Ok(Checkpoint { serial })
    }

    /// Add the edge `a -> b`.
    ///
    /// Fails with [`EngineError::Cycle`] when a reverse path already exists;
    /// the graph is left unchanged in that case.
    pub fn add_dependency(&mut self, a: &Dep, b: &Dep) -> Result<()> {
        let source = self.nodeify_source(a)?;
        let target = self.nodeify_target(b)?;
        self.add_edge_checked(source, target)
    }

    /// Create a reference node to an already-added resource. Anything
    /// depending on the reference transitively depends on the resource.
    pub fn make_ref(&mut self, resource: &Arc<Resource>, depends: &[Dep]) -> Result<ResourceRef> {
        let rref = resource.make_ref();
        self.make_ref_to(&rref, depends)?;
        Ok(rref)
    }

    /// Create a reference node by target identity. The target may live in an
    /// enclosing graph; it must exist somewhere by freeze time.
    pub fn make_ref_to(&mut self, rref: &ResourceRef, depends: &[Dep]) -> Result<()> {
        let serial = self.ensure_reference(rref.target_identity());
        let node = self.refs[&serial].node;
        for dep in depends {
            let source = self.nodeify_source(dep)?;
            self.add_edge_checked(source, node)?;
        }
        Ok(())
    }

    /// Schedule a resource in the top-level graph, independent of whatever
    /// constrains the current sub-graph, and insert a reference to it here.
    pub fn add_to_top(&mut self, resource: &Arc<Resource>) -> Result<ResourceRef> {
        let rref = resource.make_ref();
        if self.nested {
            self.deferred_top.push(Arc::clone(resource));
        } else {
            self.add_resource(resource, &[])?;
        }
        self.make_ref_to(&rref, &[])?;
        Ok(rref)
    }

    // ------------------------------------------------------------------
    // Planning operations
    // ------------------------------------------------------------------

    /// Replace a set of peer resources with one aggregate.
    ///
    /// The members must be pairwise dependency-unconnected, unprocessed, and
    /// distinct from the aggregate. Each member's edges are re-parented onto
    /// the aggregate's sentinel pair and its own pair is removed; the member
    /// entry stays behind, marked processed, for identity deduplication.
    pub fn collect_resources(
        &mut self,
        members: &[Arc<Resource>],
        aggregate: Arc<Aggregate>,
    ) -> Result<()> {
        let agg_id = aggregate.identity();
        if self.entries.contains_key(&agg_id) {
            return Err(EngineError::IdentityConflict {
                identity: agg_id.to_string(),
            });
        }
        for member in members {
            let id = member.identity();
            if id == agg_id {
                return Err(EngineError::IdentityConflict {
                    identity: id.to_string(),
                });
            }
            let entry = self.entries.get(&id).ok_or_else(|| EngineError::NotInGraph {
                what: format!("resource {id}"),
            })?;
            if entry.processed {
                return Err(EngineError::StateViolation {
                    operation: format!("collect resource {id}"),
                    state: "processed".to_string(),
                });
            }
        }

        debug!(aggregate = %agg_id, members = members.len(), "collecting resources");
        self.insert_expandable(Expandable::Aggregate(aggregate), &[])?;
        let agg_before = self.entries[&agg_id].before;
        let agg_after = self.entries[&agg_id].after;

        for member in members {
            let id = member.identity();
            let (before, after) = {
                let entry = &self.entries[&id];
                (entry.before, entry.after)
            };
            self.move_edges(before, agg_before);
            self.move_edges(after, agg_after);
            self.graph.remove_node(before);
            self.graph.remove_node(after);
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.processed = true;
                entry.before = agg_before;
                entry.after = agg_after;
            }
        }
        self.require_acyclic()
    }

    /// Expand a resource or aggregate in place.
    ///
    /// The entry's prebound sub-graph (carrying mirrored reference nodes for
    /// its reference attributes) is handed to the expansion hook, then
    /// spliced between the entry's sentinels. Resources in the sub-graph
    /// whose identity already exists in this graph are merged onto the
    /// existing nodes.
    pub fn expand_resource(&mut self, id: &ResourceId) -> Result<()> {
        let (item, mut sub) = {
            let entry = self.entries.get_mut(id).ok_or_else(|| EngineError::NotInGraph {
                what: format!("resource {id}"),
            })?;
            if entry.processed {
                return Err(EngineError::StateViolation {
                    operation: format!("expand {id}"),
                    state: "processed".to_string(),
                });
            }
            let sub = entry
                .prebound
                .take()
                .map(|boxed| *boxed)
                .unwrap_or_else(ResourceGraph::new_nested);
            (entry.item.clone(), sub)
        };
        debug!(resource = %id, "expanding");
        item.expand_into(&mut sub)?;
        self.splice(sub, id)?;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.processed = true;
        }
        self.require_acyclic()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Transitions in a topological order of the graph, sentinels and
    /// references excluded. The order of unconstrained siblings is
    /// unspecified but stable within a single call.
    pub fn sorted_transitions(&self) -> Result<Vec<Arc<Transition>>> {
        let order = toposort(&self.graph, None).map_err(|cycle| EngineError::Cycle {
            path: self.cycle_path_through(cycle.node_id()),
        })?;
        Ok(order
            .into_iter()
            .filter_map(|idx| match &self.graph[idx] {
                Node::Transition(t) => Some(Arc::clone(t)),
                _ => None,
            })
            .collect())
    }

    /// Unprocessed resources of non-collectible types: the expansion
    /// work-list.
    pub fn iter_unexpanded_resources(&self) -> Vec<Arc<Resource>> {
        self.unprocessed_resources(false)
    }

    /// Unprocessed resources of collectible types: the collect-phase
    /// work-list.
    pub fn iter_uncollected_resources(&self) -> Vec<Arc<Resource>> {
        self.unprocessed_resources(true)
    }

    /// Unprocessed aggregates.
    pub fn iter_unexpanded_aggregates(&self) -> Vec<Arc<Aggregate>> {
        self.entries
            .values()
            .filter(|e| !e.processed)
            .filter_map(|e| match &e.item {
                Expandable::Aggregate(a) => Some(Arc::clone(a)),
                _ => None,
            })
            .collect()
    }

    /// Whether any resource or aggregate is still unprocessed.
    pub fn has_unprocessed(&self) -> bool {
        self.entries.values().any(|e| !e.processed)
    }

    /// Identities of every unprocessed entry, for diagnostics.
    pub fn unprocessed_identities(&self) -> Vec<ResourceId> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.processed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Targets of references that are not yet bound to a resource node.
    pub fn unresolved_references(&self) -> Vec<ResourceId> {
        self.refs.values().filter(|r| !r.bound).map(|r| r.target.clone()).collect()
    }

    /// The resource stored under an identity, if any.
    pub fn resource(&self, id: &ResourceId) -> Option<Arc<Resource>> {
        match &self.entries.get(id)?.item {
            Expandable::Resource(r) => Some(Arc::clone(r)),
            Expandable::Aggregate(_) => None,
        }
    }

    /// Whether a path connects the two resources, in either direction.
    pub fn resources_connected(&self, a: &ResourceId, b: &ResourceId) -> bool {
        self.connected_directed(a, b) || self.connected_directed(b, a)
    }

    /// Node count, sentinels included.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Edge count.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn unprocessed_resources(&self, collectible: bool) -> Vec<Arc<Resource>> {
        self.entries
            .values()
            .filter(|e| !e.processed)
            .filter_map(|e| match &e.item {
                Expandable::Resource(r) if r.rtype().collectible() == collectible => {
                    Some(Arc::clone(r))
                }
                _ => None,
            })
            .collect()
    }

    fn connected_directed(&self, from: &ResourceId, to: &ResourceId) -> bool {
        let (Some(from), Some(to)) = (self.entries.get(from), self.entries.get(to)) else {
            return false;
        };
        has_path_connecting(&self.graph, from.after, to.before, None)
    }

    /// Add a node with the sentinel edges `first -> node -> last`.
    fn add_node_raw(&mut self, node: Node) -> NodeIndex {
        let idx = self.graph.add_node(node);
        self.graph.update_edge(self.first, idx, ());
        self.graph.update_edge(idx, self.last, ());
        idx
    }

    /// Checked edge addition. On a cycle the graph is left unchanged and the
    /// reverse path is reported.
    fn add_edge_checked(&mut self, a: NodeIndex, b: NodeIndex) -> Result<()> {
        if a == b {
            return Err(EngineError::Cycle {
                path: vec![self.describe_node(a)],
            });
        }
        if self.graph.find_edge(a, b).is_some() {
            return Ok(());
        }
        if has_path_connecting(&self.graph, b, a, None) {
            return Err(EngineError::Cycle {
                path: self.path_between(b, a),
            });
        }
        self.graph.add_edge(a, b, ());
        Ok(())
    }

    fn insert_expandable(&mut self, item: Expandable, depends: &[Dep]) -> Result<()> {
        let id = item.identity();
        let before = self.add_node_raw(Node::Before(id.clone()));
        let after = self.add_node_raw(Node::After(id.clone()));
        self.graph.update_edge(before, after, ());

        let prebound = if let Expandable::Resource(resource) = &item {
            let mut pre = ResourceGraph::new_nested();
            let reference_attrs: Vec<ResourceRef> = resource
                .id_attrs()
                .iter_refs()
                .chain(resource.wanted_attrs().iter_refs())
                .map(|(_, rref)| rref.clone())
                .collect();
            for rref in reference_attrs {
                let target = rref.target_identity();
                if pre.ref_by_target.contains_key(&target) {
                    continue;
                }
                let serial = self.fresh_reference(target.clone());
                pre.adopt_reference(serial, target);
            }
            Some(Box::new(pre))
        } else {
            None
        };

        self.entries.insert(
            id,
            Entry {
                item,
                before,
                after,
                processed: false,
                prebound,
            },
        );
        for dep in depends {
            let source = self.nodeify_source(dep)?;
            self.add_edge_checked(source, before)?;
        }
        Ok(())
    }

    /// The reference node user code addresses by target identity; reused
    /// across calls so `Dep::Reference` stays unambiguous.
    fn ensure_reference(&mut self, target: ResourceId) -> u64 {
        if let Some(&serial) = self.ref_by_target.get(&target) {
            return serial;
        }
        self.fresh_reference(target)
    }

    /// A brand-new reference node. Distinct call sites referencing the same
    /// target keep distinct nodes, so unrelated expansions are never welded
    /// together through a shared proxy.
    fn fresh_reference(&mut self, target: ResourceId) -> u64 {
        let serial = NEXT_REF_SERIAL.fetch_add(1, Ordering::Relaxed);
        let node = self.add_node_raw(Node::Reference(serial));
        // A fresh node has no dependents yet, so binding cannot cycle.
        let bound = match self.entries.get(&target) {
            Some(entry) => {
                self.graph.update_edge(entry.after, node, ());
                true
            }
            None => false,
        };
        self.refs.insert(
            serial,
            RefEntry {
                target: target.clone(),
                node,
                bound,
            },
        );
        self.ref_by_target.entry(target).or_insert(serial);
        serial
    }

    /// Mirror a reference created in an enclosing graph, preserving its
    /// serial so the nodes fuse when the sub-graph is spliced back.
    fn adopt_reference(&mut self, serial: u64, target: ResourceId) {
        if self.ref_by_target.contains_key(&target) {
            return;
        }
        let node = self.add_node_raw(Node::Reference(serial));
        self.refs.insert(
            serial,
            RefEntry {
                target: target.clone(),
                node,
                bound: false,
            },
        );
        self.ref_by_target.insert(target, serial);
    }

    /// Bind every unbound reference whose target resource is present, with
    /// the implicit edge `after(target) -> ref`.
    fn bind_available_refs(&mut self) -> Result<()> {
        let pending: Vec<(u64, NodeIndex, NodeIndex)> = self
            .refs
            .iter()
            .filter(|(_, r)| !r.bound)
            .filter_map(|(serial, r)| {
                self.entries.get(&r.target).map(|entry| (*serial, entry.after, r.node))
            })
            .collect();
        for (serial, after, node) in pending {
            self.add_edge_checked(after, node)?;
            if let Some(entry) = self.refs.get_mut(&serial) {
                entry.bound = true;
            }
        }
        Ok(())
    }

    fn nodeify_source(&self, dep: &Dep) -> Result<NodeIndex> {
        let node = match dep {
            Dep::Resource(r) => self.entries.get(&r.identity()).map(|e| e.after),
            Dep::Reference(r) => self
                .ref_by_target
                .get(&r.target_identity())
                .and_then(|serial| self.refs.get(serial))
                .map(|e| e.node),
            Dep::Transition(t) => self.transition_nodes.get(&t.serial()).copied(),
            Dep::Checkpoint(c) => self.checkpoint_nodes.get(&c.serial).copied(),
        };
        node.ok_or_else(|| EngineError::NotInGraph {
            what: dep.describe(),
        })
    }

    fn nodeify_target(&self, dep: &Dep) -> Result<NodeIndex> {
        let node = match dep {
            Dep::Resource(r) => self.entries.get(&r.identity()).map(|e| e.before),
            _ => return self.nodeify_source(dep),
        };
        node.ok_or_else(|| EngineError::NotInGraph {
            what: dep.describe(),
        })
    }

    /// Re-parent every edge of `from` onto `to`, dropping would-be
    /// self-loops (they stand for edges that become internal to the merge).
    fn move_edges(&mut self, from: NodeIndex, to: NodeIndex) {
        let preds: Vec<NodeIndex> =
            self.graph.neighbors_directed(from, Direction::Incoming).collect();
        for pred in preds {
            if let Some(edge) = self.graph.find_edge(pred, from) {
                self.graph.remove_edge(edge);
            }
            if pred != to {
                self.graph.update_edge(pred, to, ());
            }
        }
        let succs: Vec<NodeIndex> =
            self.graph.neighbors_directed(from, Direction::Outgoing).collect();
        for succ in succs {
            if let Some(edge) = self.graph.find_edge(from, succ) {
                self.graph.remove_edge(edge);
            }
            if succ != to {
                self.graph.update_edge(to, succ, ());
            }
        }
    }

    /// Inline `sub` between the host entry's sentinels.
    fn splice(&mut self, mut sub: ResourceGraph, host: &ResourceId) -> Result<()> {
        let (host_before, host_after) = {
            let entry = &self.entries[host];
            (entry.before, entry.after)
        };
        let mut map: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        map.insert(sub.first, host_before);
        map.insert(sub.last, host_after);

        // Expandables: merge onto existing entries or transplant.
        let sub_entries: Vec<(ResourceId, Entry)> = sub.entries.drain(..).collect();
        for (sub_id, sub_entry) in sub_entries {
            match self.entries.get(&sub_id) {
                Some(existing) => {
                    let merged = match (&existing.item, &sub_entry.item) {
                        (Expandable::Resource(a), Expandable::Resource(b)) => **a == **b,
                        _ => false,
                    };
                    if !merged {
                        return Err(EngineError::IdentityConflict {
                            identity: sub_id.to_string(),
                        });
                    }
                    trace!(resource = %sub_id, "merged sub-graph resource onto existing node");
                    map.insert(sub_entry.before, existing.before);
                    map.insert(sub_entry.after, existing.after);
                }
                None => {
                    let before = self.add_node_raw(Node::Before(sub_id.clone()));
                    let after = self.add_node_raw(Node::After(sub_id.clone()));
                    self.graph.update_edge(before, after, ());
                    map.insert(sub_entry.before, before);
                    map.insert(sub_entry.after, after);
                    self.entries.insert(
                        sub_id,
                        Entry {
                            item: sub_entry.item,
                            before,
                            after,
                            processed: sub_entry.processed,
                            prebound: sub_entry.prebound,
                        },
                    );
                }
            }
        }

        // References: a serial already known here is a prebound mirror and
        // fuses onto its original node; anything else transplants and binds
        // to its target once that target is present.
        let sub_refs: Vec<(u64, RefEntry)> = sub.refs.drain(..).collect();
        for (serial, sub_ref) in sub_refs {
            let parent_node = if let Some(existing) = self.refs.get(&serial) {
                existing.node
            } else {
                let node = self.add_node_raw(Node::Reference(serial));
                self.ref_by_target.entry(sub_ref.target.clone()).or_insert(serial);
                self.refs.insert(
                    serial,
                    RefEntry {
                        target: sub_ref.target,
                        node,
                        bound: false,
                    },
                );
                node
            };
            map.insert(sub_ref.node, parent_node);
        }

        // Transitions and checkpoints transplant as fresh nodes.
        let remaining: Vec<NodeIndex> = sub
            .graph
            .node_indices()
            .filter(|idx| !map.contains_key(idx))
            .collect();
        for idx in remaining {
            match sub.graph[idx].clone() {
                Node::Transition(t) => {
                    let node = self.add_node_raw(Node::Transition(Arc::clone(&t)));
                    self.transition_nodes.insert(t.serial(), node);
                    map.insert(idx, node);
                }
                Node::Checkpoint(serial) => {
                    let node = self.add_node_raw(Node::Checkpoint(serial));
                    self.checkpoint_nodes.insert(serial, node);
                    map.insert(idx, node);
                }
                // Covered by the passes above.
                Node::First | Node::Last | Node::Before(_) | Node::After(_)
                | Node::Reference(_) => {}
            }
        }

        // Edges, through the node map. Two sub nodes collapsing onto one
        // parent node means the host expanded into itself.
        for edge in sub.graph.edge_references() {
            let (Some(&a), Some(&b)) = (map.get(&edge.source()), map.get(&edge.target())) else {
                continue;
            };
            if a == b {
                return Err(EngineError::Cycle {
                    path: vec![self.describe_node(a)],
                });
            }
            self.graph.update_edge(a, b, ());
        }

        // Promote resources queued for the top level.
        let deferred: Vec<Arc<Resource>> = sub.deferred_top.drain(..).collect();
        for resource in deferred {
            if self.nested {
                self.deferred_top.push(resource);
            } else {
                self.add_resource(&resource, &[])?;
            }
        }

        self.bind_available_refs()
    }

    fn require_acyclic(&self) -> Result<()> {
        match toposort(&self.graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => Err(EngineError::Cycle {
                path: self.cycle_path_through(cycle.node_id()),
            }),
        }
    }

    /// Shortest path `from -> .. -> to`, rendered for diagnostics.
    fn path_between(&self, from: NodeIndex, to: NodeIndex) -> Vec<String> {
        let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = std::collections::VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                break;
            }
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if next != from && !parents.contains_key(&next) {
                    parents.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        let mut path = vec![to];
        let mut current = to;
        while let Some(&parent) = parents.get(&current) {
            path.push(parent);
            current = parent;
            if current == from {
                break;
            }
        }
        if current != from {
            path.push(from);
        }
        path.reverse();
        path.into_iter().map(|idx| self.describe_node(idx)).collect()
    }

    fn cycle_path_through(&self, node: NodeIndex) -> Vec<String> {
        for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
            if next == node || has_path_connecting(&self.graph, next, node, None) {
                let mut path = vec![self.describe_node(node)];
                path.extend(self.path_between(next, node));
                return path;
            }
        }
        vec![self.describe_node(node)]
    }

    fn describe_node(&self, idx: NodeIndex) -> String {
        match &self.graph[idx] {
            Node::First => "first".to_string(),
            Node::Last => "last".to_string(),
            Node::Checkpoint(serial) => format!("checkpoint#{serial}"),
            Node::Before(id) => format!("before {id}"),
            Node::After(id) => format!("after {id}"),
            Node::Transition(t) => format!("transition {}", t.describe()),
            Node::Reference(serial) => match self.refs.get(serial) {
                Some(entry) => format!("ref to {}", entry.target),
                None => format!("ref#{serial}"),
            },
        }
    }
}

impl Default for ResourceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGraph")
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{ExpandResource, PerformTransition, ResourceType, TransitionType};
    use crate::schema::{AttrType, Attrs, Value, ValueKind, ValueMap, valmap};

    struct Inert;

    impl ExpandResource for Inert {
        fn expand_into(&self, _resource: &Resource, _graph: &mut ResourceGraph) -> Result<()> {
            Ok(())
        }
    }

    struct NoOp;

    impl PerformTransition for NoOp {
        fn perform(&self, _instr: &Attrs) -> anyhow::Result<ValueMap> {
            Ok(ValueMap::new())
        }
    }

    fn widget_type() -> Arc<ResourceType> {
        ResourceType::builder("Widget")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .state_attr("present", AttrType::of(ValueKind::Bool).default(true))
            .expand(Inert)
            .build()
            .unwrap()
    }

    fn widget(rtype: &Arc<ResourceType>, name: &str) -> Arc<Resource> {
        rtype.instance(valmap([("name", Value::from(name))])).unwrap()
    }

    fn noop_type() -> Arc<TransitionType> {
        TransitionType::builder("NoOp")
            .instr_attr("tag", AttrType::of(ValueKind::Str))
            .perform(NoOp)
            .build()
            .unwrap()
    }

    fn noop(ttype: &Arc<TransitionType>, tag: &str) -> Arc<Transition> {
        ttype.instance(valmap([("tag", Value::from(tag))])).unwrap()
    }

    #[test]
    fn fresh_graph_has_sentinel_edge() {
        let graph = ResourceGraph::new();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.sorted_transitions().unwrap().is_empty());
    }

    #[test]
    fn transitions_order_by_dependencies() {
        let ttype = noop_type();
        let mut graph = ResourceGraph::new();
        let a = graph.add_transition(noop(&ttype, "a"), &[]).unwrap();
        let b = graph.add_transition(noop(&ttype, "b"), &[Dep::from(&a)]).unwrap();
        let c = graph.add_transition(noop(&ttype, "c"), &[Dep::from(&b)]).unwrap();

        let order = graph.sorted_transitions().unwrap();
        let tags: Vec<_> =
            order.iter().map(|t| t.instr_attrs().get_str("tag").unwrap().to_string()).collect();
        let pos = |tag: &str| tags.iter().position(|t| t == tag).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        drop(c);
    }

    #[test]
    fn foreign_dependency_is_rejected() {
        let ttype = noop_type();
        let mut graph = ResourceGraph::new();
        let stranger = noop(&ttype, "stranger");
        let err = graph.add_transition(noop(&ttype, "t"), &[Dep::from(&stranger)]).unwrap_err();
        assert!(matches!(err, EngineError::NotInGraph { .. }));
    }

    #[test]
    fn cycle_is_rejected_and_graph_unchanged() {
        let ttype = noop_type();
        let mut graph = ResourceGraph::new();
        let a = graph.add_transition(noop(&ttype, "a"), &[]).unwrap();
        let b = graph.add_transition(noop(&ttype, "b"), &[]).unwrap();
        graph.add_dependency(&Dep::from(&a), &Dep::from(&b)).unwrap();

        let edges_before = graph.edge_count();
        let err = graph.add_dependency(&Dep::from(&b), &Dep::from(&a)).unwrap_err();
        assert!(matches!(err, EngineError::Cycle { .. }));
        assert_eq!(graph.edge_count(), edges_before);
        // The surviving order still honors a -> b.
        assert!(graph.sorted_transitions().is_ok());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let ttype = noop_type();
        let mut graph = ResourceGraph::new();
        let a = graph.add_transition(noop(&ttype, "a"), &[]).unwrap();
        let err = graph.add_dependency(&Dep::from(&a), &Dep::from(&a)).unwrap_err();
        assert!(matches!(err, EngineError::Cycle { .. }));
    }

    #[test]
    fn resources_deduplicate_by_identity() {
        let rtype = widget_type();
        let mut graph = ResourceGraph::new();
        let first = graph.add_resource(&widget(&rtype, "w"), &[]).unwrap();
        let second = graph.add_resource(&widget(&rtype, "w"), &[]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn conflicting_wanted_state_is_rejected() {
        let rtype = widget_type();
        let mut graph = ResourceGraph::new();
        graph.add_resource(&widget(&rtype, "w"), &[]).unwrap();
        let other = rtype
            .instance(valmap([("name", Value::from("w")), ("present", Value::from(false))]))
            .unwrap();
        let err = graph.add_resource(&other, &[]).unwrap_err();
        assert!(matches!(err, EngineError::IdentityConflict { .. }));
    }

    #[test]
    fn checkpoint_orders_both_sides() {
        let ttype = noop_type();
        let mut graph = ResourceGraph::new();
        let a = graph.add_transition(noop(&ttype, "a"), &[]).unwrap();
        let cp = graph.add_checkpoint(&[Dep::from(&a)]).unwrap();
        let b = graph.add_transition(noop(&ttype, "b"), &[Dep::from(cp)]).unwrap();

        let order = graph.sorted_transitions().unwrap();
        let pos = |t: &Arc<Transition>| order.iter().position(|o| o.serial() == t.serial()).unwrap();
        assert!(pos(&a) < pos(&b));
    }

    #[test]
    fn reference_carries_target_ordering() {
        let rtype = widget_type();
        let ttype = noop_type();
        let mut graph = ResourceGraph::new();
        let res = graph.add_resource(&widget(&rtype, "w"), &[]).unwrap();
        let rref = graph.make_ref(&res, &[]).unwrap();
        graph.add_transition(noop(&ttype, "t"), &[Dep::from(&rref)]).unwrap();

        // after(w) -> ref -> t exists, so expanding w first keeps t last.
        assert!(graph.unresolved_references().is_empty());
        graph.expand_resource(&res.identity()).unwrap();
        assert!(graph.sorted_transitions().is_ok());
    }

    #[test]
    fn make_ref_to_absent_target_stays_unresolved() {
        let rtype = widget_type();
        let mut graph = ResourceGraph::new();
        let rref = rtype.reference(valmap([("name", Value::from("ghost"))])).unwrap();
        graph.make_ref_to(&rref, &[]).unwrap();
        assert_eq!(graph.unresolved_references().len(), 1);

        // Adding the target later binds the reference.
        graph.add_resource(&widget(&rtype, "ghost"), &[]).unwrap();
        assert!(graph.unresolved_references().is_empty());
    }

    #[test]
    fn expansion_splices_between_sentinels() {
        struct EmitTwo(Arc<TransitionType>);

        impl ExpandResource for EmitTwo {
            fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
                let name = resource.id_attrs().get_str("name").unwrap_or_default();
                let a = graph
                    .add_transition(noop(&self.0, &format!("{name}:a")), &[])?;
                graph.add_transition(noop(&self.0, &format!("{name}:b")), &[Dep::from(&a)])?;
                Ok(())
            }
        }

        let ttype = noop_type();
        let rtype = ResourceType::builder("Pair")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .expand(EmitTwo(Arc::clone(&ttype)))
            .build()
            .unwrap();

        let mut graph = ResourceGraph::new();
        let r1 = graph
            .add_resource(&rtype.instance(valmap([("name", Value::from("one"))])).unwrap(), &[])
            .unwrap();
        let r2 = graph
            .add_resource(
                &rtype.instance(valmap([("name", Value::from("two"))])).unwrap(),
                &[Dep::from(&r1)],
            )
            .unwrap();

        graph.expand_resource(&r1.identity()).unwrap();
        graph.expand_resource(&r2.identity()).unwrap();
        assert!(!graph.has_unprocessed());

        let order = graph.sorted_transitions().unwrap();
        let tags: Vec<_> =
            order.iter().map(|t| t.instr_attrs().get_str("tag").unwrap().to_string()).collect();
        let pos = |tag: &str| tags.iter().position(|t| t == tag).unwrap();
        // Everything from r1 precedes everything from r2.
        assert!(pos("one:a") < pos("one:b"));
        assert!(pos("one:b") < pos("two:a"));
        assert!(pos("two:a") < pos("two:b"));
    }

    #[test]
    fn nested_duplicate_resource_merges_onto_parent() {
        struct EmitShared(Arc<ResourceType>);

        impl ExpandResource for EmitShared {
            fn expand_into(&self, _resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
                graph.add_resource(&widget(&self.0, "shared"), &[])?;
                Ok(())
            }
        }

        let shared_type = widget_type();
        let outer_type = ResourceType::builder("Outer")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .expand(EmitShared(Arc::clone(&shared_type)))
            .build()
            .unwrap();

        let mut graph = ResourceGraph::new();
        let shared = graph.add_resource(&widget(&shared_type, "shared"), &[]).unwrap();
        let outer = graph
            .add_resource(&outer_type.instance(valmap([("name", Value::from("o"))])).unwrap(), &[])
            .unwrap();

        graph.expand_resource(&outer.identity()).unwrap();
        // Still one entry for the shared widget, and it is the parent's.
        assert!(graph.resource(&shared.identity()).is_some());
        assert_eq!(graph.iter_unexpanded_resources().len(), 1);
        graph.expand_resource(&shared.identity()).unwrap();
        assert!(!graph.has_unprocessed());
    }
}
