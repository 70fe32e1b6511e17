//! Resources, identities, and references.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::trace;

use crate::core::{EngineError, Result};
use crate::graph::ResourceGraph;
use crate::model::types::ResourceType;
use crate::schema::{Attrs, ValueMap};

/// A declarative statement of a desired sub-state of the host.
///
/// A resource is a typed, validated value: its identity attrs say which
/// piece of the host it talks about, its wanted attrs say what that piece
/// should look like. Two resources with equal identity describe the same
/// piece and must agree; the graph deduplicates them on insertion.
pub struct Resource {
    rtype: Arc<ResourceType>,
    id_attrs: Attrs,
    wanted_attrs: Attrs,
}

impl Resource {
    pub(crate) fn new(rtype: Arc<ResourceType>, id_attrs: Attrs, wanted_attrs: Attrs) -> Self {
        Self {
            rtype,
            id_attrs,
            wanted_attrs,
        }
    }

    /// The resource's type.
    pub fn rtype(&self) -> &Arc<ResourceType> {
        &self.rtype
    }

    /// The identity attributes.
    pub fn id_attrs(&self) -> &Attrs {
        &self.id_attrs
    }

    /// The wanted-state attributes.
    pub fn wanted_attrs(&self) -> &Attrs {
        &self.wanted_attrs
    }

    /// The identity: type name plus identity attrs.
    pub fn identity(&self) -> ResourceId {
        ResourceId {
            type_name: self.rtype.name().to_string(),
            attrs: self.id_attrs.clone(),
        }
    }

    /// Derive a reference naming this resource.
    pub fn make_ref(&self) -> ResourceRef {
        ResourceRef::new(Arc::clone(&self.rtype), self.id_attrs.clone())
    }

    /// Read the live state of this resource from the host.
    ///
    /// Uses the type's whole-state reader when present, otherwise the
    /// per-attribute readers; attributes without a reader are omitted. The
    /// result is validated against the state schema. This is a method and
    /// not a cached property: the host may change between calls.
    pub fn read_attrs(&self) -> Result<Attrs> {
        trace!(resource = %self.identity(), "reading live state");
        if let Some(read_all) = self.rtype.whole_state_reader() {
            let valdict = read_all(&self.id_attrs).map_err(|source| EngineError::StateRead {
                resource: self.identity().to_string(),
                source,
            })?;
            return self.rtype.state_type().prepare(valdict);
        }

        let mut valdict = ValueMap::new();
        for (name, atype) in self.rtype.state_type().iter() {
            if let Some(read) = atype.read(name, &self.id_attrs) {
                valdict.insert(name.to_string(), read?);
            }
        }
        self.rtype.state_type().prepare_partial(valdict)
    }

    /// Populate `graph` with the transitions and resources that drive the
    /// host toward this resource's wanted state.
    pub fn expand_into(&self, graph: &mut ResourceGraph) -> Result<()> {
        let expander = Arc::clone(self.rtype.expander());
        expander.expand_into(self, graph)
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.rtype.name() == other.rtype.name()
            && self.id_attrs == other.id_attrs
            && self.wanted_attrs == other.wanted_attrs
    }
}

impl Eq for Resource {}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource({}", self.rtype.name())?;
        let id = self.id_attrs.to_string();
        if !id.is_empty() {
            write!(f, ", {id}")?;
        }
        let wanted = self.wanted_attrs.to_string();
        if !wanted.is_empty() {
            write!(f, ", {wanted}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity())
    }
}

/// The identity of a resource: its type name and identity attrs.
///
/// Identities key every graph lookup. They are deep-comparable and
/// deep-hashable, so the same declared resource unifies across call sites
/// regardless of which instance was constructed first.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    type_name: String,
    attrs: Attrs,
}

impl ResourceId {
    pub(crate) fn synthesized(type_name: impl Into<String>, attrs: Attrs) -> Self {
        Self {
            type_name: type_name.into(),
            attrs,
        }
    }

    /// The type name half of the identity.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The attribute half of the identity.
    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name, self.attrs)
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A proxy naming a resource by target identity.
///
/// References let the same resource participate in multiple enclosing
/// contexts: expansion code depends on a reference without knowing whether
/// the target lives in a parent or sibling scope. The graph binds each
/// reference to the resource node carrying the target identity; a target
/// that never appears fails the plan at freeze time.
#[derive(Clone)]
pub struct ResourceRef {
    rtype: Arc<ResourceType>,
    id_attrs: Attrs,
}

impl ResourceRef {
    pub(crate) fn new(rtype: Arc<ResourceType>, id_attrs: Attrs) -> Self {
        Self { rtype, id_attrs }
    }

    /// The referenced type's name.
    pub fn type_name(&self) -> &str {
        self.rtype.name()
    }

    /// The referenced type.
    pub fn rtype(&self) -> &Arc<ResourceType> {
        &self.rtype
    }

    /// The identity attributes naming the target.
    pub fn id_attrs(&self) -> &Attrs {
        &self.id_attrs
    }

    /// The identity of the target. Distinct references may share a target,
    /// which is why this is not called an identity of the reference itself.
    pub fn target_identity(&self) -> ResourceId {
        ResourceId {
            type_name: self.rtype.name().to_string(),
            attrs: self.id_attrs.clone(),
        }
    }
}

impl PartialEq for ResourceRef {
    fn eq(&self, other: &Self) -> bool {
        self.rtype.name() == other.rtype.name() && self.id_attrs == other.id_attrs
    }
}

impl Eq for ResourceRef {}

impl Hash for ResourceRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rtype.name().hash(state);
        self.id_attrs.hash(state);
    }
}

impl fmt::Debug for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceRef({})", self.target_identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::ExpandResource;
    use crate::schema::{AttrType, Value, ValueKind, valmap};

    struct Inert;

    impl ExpandResource for Inert {
        fn expand_into(&self, _resource: &Resource, _graph: &mut ResourceGraph) -> Result<()> {
            Ok(())
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

    #[test]
    fn identity_ignores_wanted_state() {
        let rtype = widget_type();
        let a = rtype
            .instance(valmap([("name", Value::from("w")), ("present", Value::from(true))]))
            .unwrap();
        let b = rtype
            .instance(valmap([("name", Value::from("w")), ("present", Value::from(false))]))
            .unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_ne!(*a, *b);
    }

    #[test]
    fn references_compare_by_target() {
        let rtype = widget_type();
        let res = rtype.instance(valmap([("name", Value::from("w"))])).unwrap();
        let by_value = res.make_ref();
        let by_name = rtype.reference(valmap([("name", Value::from("w"))])).unwrap();
        assert_eq!(by_value, by_name);
        assert_eq!(by_value.target_identity(), res.identity());
    }

    #[test]
    fn identity_renders_for_diagnostics() {
        let rtype = widget_type();
        let res = rtype.instance(valmap([("name", Value::from("w"))])).unwrap();
        assert_eq!(res.identity().to_string(), "Widget(name=w)");
    }
}
