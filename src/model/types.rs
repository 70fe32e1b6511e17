//! Resource and transition type definitions.
//!
//! A type pairs two disjoint schemas with the behavior that realizes it.
//! The node-tag set of the graph is closed; the set of concrete resource and
//! transition implementations is open through the [`ExpandResource`] and
//! [`PerformTransition`] traits, registered by name at plugin load.

use std::fmt;
use std::sync::Arc;

use crate::core::{EngineError, Result};
use crate::graph::ResourceGraph;
use crate::model::resource::{Resource, ResourceRef};
use crate::model::transition::Transition;
use crate::schema::{AttrType, Attrs, SimpleType, ValueMap};

/// Populates a sub-graph with the transitions (and possibly further
/// resources) that drive a resource from its read state to its wanted state.
pub trait ExpandResource: Send + Sync {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()>;
}

/// Applies a transition's side effect to the host.
///
/// Called with the validated instruction attrs; returns a value-dict
/// satisfying the transition type's results schema. Implementations decide
/// whether their operation is idempotent on replay.
pub trait PerformTransition: Send + Sync {
    fn perform(&self, instr: &Attrs) -> anyhow::Result<ValueMap>;
}

/// Reads the whole live state of a resource at once, overriding any
/// per-attribute readers.
pub type ReadAll = fn(&Attrs) -> anyhow::Result<ValueMap>;

/// A named resource type: identity schema, wanted-state schema, expansion
/// behavior.
#[derive(Clone)]
pub struct ResourceType {
    name: String,
    id_type: Arc<SimpleType>,
    state_type: Arc<SimpleType>,
    collectible: bool,
    expand: Arc<dyn ExpandResource>,
    read_all: Option<ReadAll>,
}

impl ResourceType {
    /// Start building a resource type with the given registered name.
    pub fn builder(name: impl Into<String>) -> ResourceTypeBuilder {
        ResourceTypeBuilder {
            name: name.into(),
            id_attrs: Vec::new(),
            state_attrs: Vec::new(),
            collectible: false,
            expand: None,
            read_all: None,
        }
    }

    /// The registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identity schema.
    pub fn id_type(&self) -> &Arc<SimpleType> {
        &self.id_type
    }

    /// The wanted-state schema.
    pub fn state_type(&self) -> &Arc<SimpleType> {
        &self.state_type
    }

    /// Whether instances are realized through a collector instead of
    /// direct expansion.
    pub fn collectible(&self) -> bool {
        self.collectible
    }

    pub(crate) fn expander(&self) -> &Arc<dyn ExpandResource> {
        &self.expand
    }

    pub(crate) fn whole_state_reader(&self) -> Option<ReadAll> {
        self.read_all
    }

    /// Construct a resource from a combined value-dict, separating identity
    /// attributes from state attributes.
    pub fn instance(&self, valdict: ValueMap) -> Result<Arc<Resource>> {
        let mut id_valdict = ValueMap::new();
        let mut state_valdict = ValueMap::new();
        for (name, value) in valdict {
            if self.id_type.declares(&name) {
                id_valdict.insert(name, value);
            } else if self.state_type.declares(&name) {
                state_valdict.insert(name, value);
            } else {
                return Err(EngineError::UnknownAttribute { attr: name });
            }
        }
        let id_attrs = self.id_type.prepare(id_valdict)?;
        let wanted_attrs = self.state_type.prepare(state_valdict)?;
        Ok(Arc::new(Resource::new(Arc::new(self.clone()), id_attrs, wanted_attrs)))
    }

    /// Construct a reference naming an instance of this type by identity.
    pub fn reference(&self, id_valdict: ValueMap) -> Result<ResourceRef> {
        let id_attrs = self.id_type.prepare(id_valdict)?;
        Ok(ResourceRef::new(Arc::new(self.clone()), id_attrs))
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType")
            .field("name", &self.name)
            .field("collectible", &self.collectible)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ResourceType`].
pub struct ResourceTypeBuilder {
    name: String,
    id_attrs: Vec<(String, AttrType)>,
    state_attrs: Vec<(String, AttrType)>,
    collectible: bool,
    expand: Option<Arc<dyn ExpandResource>>,
    read_all: Option<ReadAll>,
}

impl ResourceTypeBuilder {
    /// Declare an identity attribute.
    pub fn id_attr(mut self, name: impl Into<String>, atype: AttrType) -> Self {
        self.id_attrs.push((name.into(), atype));
        self
    }

    /// Declare a wanted-state attribute.
    pub fn state_attr(mut self, name: impl Into<String>, atype: AttrType) -> Self {
        self.state_attrs.push((name.into(), atype));
        self
    }

    /// Mark the type as realized through a collector. Collectible types do
    /// not expand directly; the collect phase replaces their instances with
    /// aggregates.
    pub fn collectible(mut self) -> Self {
        self.collectible = true;
        self
    }

    /// Attach the expansion behavior.
    pub fn expand(mut self, expand: impl ExpandResource + 'static) -> Self {
        self.expand = Some(Arc::new(expand));
        self
    }

    /// Attach a whole-state reader.
    pub fn read_all(mut self, read_all: ReadAll) -> Self {
        self.read_all = Some(read_all);
        self
    }

    /// Validate the schemas and produce the type.
    pub fn build(self) -> Result<Arc<ResourceType>> {
        let id_type = SimpleType::new(self.id_attrs)?;
        let state_type = SimpleType::new(self.state_attrs)?;
        id_type.require_disjoint(&state_type)?;
        let expand = match self.expand {
            Some(expand) => expand,
            None if self.collectible => Arc::new(CollectOnly),
            None => {
                return Err(EngineError::Registration {
                    message: format!("resource type '{}' has no expansion behavior", self.name),
                });
            }
        };
        Ok(Arc::new(ResourceType {
            name: self.name,
            id_type,
            state_type,
            collectible: self.collectible,
            expand,
            read_all: self.read_all,
        }))
    }
}

/// Placeholder expansion for collectible types. The planner never invokes
/// it; reaching it means a collectible resource escaped the collect phase.
struct CollectOnly;

impl ExpandResource for CollectOnly {
    fn expand_into(&self, resource: &Resource, _graph: &mut ResourceGraph) -> Result<()> {
        Err(EngineError::UncollectedResource {
            resource: resource.identity().to_string(),
        })
    }
}

/// A named transition type: instruction schema, results schema, side-effect
/// behavior.
#[derive(Clone)]
pub struct TransitionType {
    name: String,
    instr_type: Arc<SimpleType>,
    results_type: Arc<SimpleType>,
    perform: Arc<dyn PerformTransition>,
}

impl TransitionType {
    /// Start building a transition type with the given registered name.
    pub fn builder(name: impl Into<String>) -> TransitionTypeBuilder {
        TransitionTypeBuilder {
            name: name.into(),
            instr_attrs: Vec::new(),
            results_attrs: Vec::new(),
            perform: None,
        }
    }

    /// The registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instruction schema.
    pub fn instr_type(&self) -> &Arc<SimpleType> {
        &self.instr_type
    }

    /// The results schema.
    pub fn results_type(&self) -> &Arc<SimpleType> {
        &self.results_type
    }

    pub(crate) fn performer(&self) -> &Arc<dyn PerformTransition> {
        &self.perform
    }

    /// Construct a transition from an instruction value-dict.
    pub fn instance(&self, instr_valdict: ValueMap) -> Result<Arc<Transition>> {
        let instr_attrs = self.instr_type.prepare(instr_valdict)?;
        Ok(Arc::new(Transition::new(Arc::new(self.clone()), instr_attrs)))
    }
}

impl fmt::Debug for TransitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionType").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Builder for [`TransitionType`].
pub struct TransitionTypeBuilder {
    name: String,
    instr_attrs: Vec<(String, AttrType)>,
    results_attrs: Vec<(String, AttrType)>,
    perform: Option<Arc<dyn PerformTransition>>,
}

impl TransitionTypeBuilder {
    /// Declare an instruction attribute.
    pub fn instr_attr(mut self, name: impl Into<String>, atype: AttrType) -> Self {
        self.instr_attrs.push((name.into(), atype));
        self
    }

    /// Declare a results attribute.
    pub fn results_attr(mut self, name: impl Into<String>, atype: AttrType) -> Self {
        self.results_attrs.push((name.into(), atype));
        self
    }

    /// Attach the side-effect behavior.
    pub fn perform(mut self, perform: impl PerformTransition + 'static) -> Self {
        self.perform = Some(Arc::new(perform));
        self
    }

    /// Validate the schemas and produce the type.
    pub fn build(self) -> Result<Arc<TransitionType>> {
        let instr_type = SimpleType::new(self.instr_attrs)?;
        let results_type = SimpleType::new(self.results_attrs)?;
        instr_type.require_disjoint(&results_type)?;
        let perform = self.perform.ok_or_else(|| EngineError::Registration {
            message: format!("transition type '{}' has no performer", self.name),
        })?;
        Ok(Arc::new(TransitionType {
            name: self.name,
            instr_type,
            results_type,
            perform,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Value, ValueKind, valmap};

    struct Inert;

    impl ExpandResource for Inert {
        fn expand_into(&self, _resource: &Resource, _graph: &mut ResourceGraph) -> Result<()> {
            Ok(())
        }
    }

    fn sample_type() -> Arc<ResourceType> {
        ResourceType::builder("Widget")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .state_attr("present", AttrType::of(ValueKind::Bool).default(true))
            .expand(Inert)
            .build()
            .unwrap()
    }

    #[test]
    fn instance_splits_identity_from_state() {
        let rtype = sample_type();
        let res = rtype
            .instance(valmap([("name", Value::from("a")), ("present", Value::from(false))]))
            .unwrap();
        assert_eq!(res.id_attrs().get_str("name"), Some("a"));
        assert_eq!(res.wanted_attrs().get_bool("present"), Some(false));
    }

    #[test]
    fn instance_rejects_undeclared_names() {
        let rtype = sample_type();
        let err = rtype
            .instance(valmap([("name", Value::from("a")), ("color", Value::from("red"))]))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownAttribute { attr } if attr == "color"));
    }

    #[test]
    fn overlapping_schemas_are_rejected() {
        let err = ResourceType::builder("Widget")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .state_attr("name", AttrType::of(ValueKind::Str))
            .expand(Inert)
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailure { .. }));
    }

    #[test]
    fn non_collectible_types_need_an_expander() {
        let err = ResourceType::builder("Widget")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Registration { .. }));
    }
}
