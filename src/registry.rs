//! Process-wide lookup of named types and collectors.
//!
//! The registry is mutable only during plugin load; afterwards it is
//! treated as read-only. Resource types, transition types, and collectors
//! live in separate name spaces, so a resource type and a transition type
//! may deliberately share a name (a `Command` resource expands into a
//! `Command` transition). Collectors additionally preserve registration
//! order, which is the order the collect phase runs them in.

use std::sync::{LazyLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use std::sync::Arc;
use tracing::debug;

use crate::collector::Collector;
use crate::core::{EngineError, Result};
use crate::model::types::{ResourceType, TransitionType};

static GLOBAL: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::new()));

/// Name-indexed tables of resource types, transition types, and collectors.
pub struct Registry {
    resource_types: IndexMap<String, Arc<ResourceType>>,
    transition_types: IndexMap<String, Arc<TransitionType>>,
    collectors: IndexMap<String, Arc<dyn Collector>>,
}

impl Registry {
    /// An empty registry. Library users normally go through
    /// [`Registry::read`] and [`Registry::write`] instead.
    pub fn new() -> Self {
        Self {
            resource_types: IndexMap::new(),
            transition_types: IndexMap::new(),
            collectors: IndexMap::new(),
        }
    }

    /// Read access to the process-wide instance.
    pub fn read() -> RwLockReadGuard<'static, Registry> {
        GLOBAL.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access to the process-wide instance. Intended for plugin
    /// `register` entry points only.
    pub fn write() -> RwLockWriteGuard<'static, Registry> {
        GLOBAL.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a resource type under its own name.
    pub fn register_resource_type(&mut self, rtype: Arc<ResourceType>) -> Result<()> {
        let name = rtype.name().to_string();
        if self.resource_types.contains_key(&name) {
            return Err(EngineError::AlreadyRegistered {
                kind: "resource",
                name,
            });
        }
        debug!(name = %name, "registered resource type");
        self.resource_types.insert(name, rtype);
        Ok(())
    }

    /// Register a transition type under its own name.
    pub fn register_transition_type(&mut self, ttype: Arc<TransitionType>) -> Result<()> {
        let name = ttype.name().to_string();
        if self.transition_types.contains_key(&name) {
            return Err(EngineError::AlreadyRegistered {
                kind: "transition",
                name,
            });
        }
        debug!(name = %name, "registered transition type");
        self.transition_types.insert(name, ttype);
        Ok(())
    }

    /// Register a collector under its own name.
    pub fn register_collector(&mut self, collector: Arc<dyn Collector>) -> Result<()> {
        let name = collector.name().to_string();
        if self.collectors.contains_key(&name) {
            return Err(EngineError::AlreadyRegistered {
                kind: "collector",
                name,
            });
        }
        debug!(name = %name, "registered collector");
        self.collectors.insert(name, collector);
        Ok(())
    }

    /// Look up a resource type by name.
    pub fn resource_type(&self, name: &str) -> Result<Arc<ResourceType>> {
        self.resource_types.get(name).cloned().ok_or_else(|| EngineError::UnknownType {
            kind: "resource",
            name: name.to_string(),
        })
    }

    /// Look up a transition type by name.
    pub fn transition_type(&self, name: &str) -> Result<Arc<TransitionType>> {
        self.transition_types.get(name).cloned().ok_or_else(|| EngineError::UnknownType {
            kind: "transition",
            name: name.to_string(),
        })
    }

    /// Look up a collector by name.
    pub fn collector(&self, name: &str) -> Result<Arc<dyn Collector>> {
        self.collectors.get(name).cloned().ok_or_else(|| EngineError::UnknownType {
            kind: "collector",
            name: name.to_string(),
        })
    }

    /// All collectors in registration order.
    pub fn collectors(&self) -> Vec<Arc<dyn Collector>> {
        self.collectors.values().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceGraph;
    use crate::model::resource::Resource;
    use crate::model::types::ExpandResource;
    use crate::schema::{AttrType, ValueKind};

    struct Inert;

    impl ExpandResource for Inert {
        fn expand_into(&self, _resource: &Resource, _graph: &mut ResourceGraph) -> Result<()> {
            Ok(())
        }
    }

    fn widget() -> Arc<ResourceType> {
        ResourceType::builder("Widget")
            .id_attr("name", AttrType::of(ValueKind::Str))
            .expand(Inert)
            .build()
            .unwrap()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = Registry::new();
        registry.register_resource_type(widget()).unwrap();
        let err = registry.register_resource_type(widget()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRegistered { kind: "resource", .. }));
    }

    #[test]
    fn lookup_misses_are_typed() {
        let registry = Registry::new();
        let err = registry.resource_type("Nope").unwrap_err();
        assert!(matches!(err, EngineError::UnknownType { kind: "resource", .. }));
    }

    #[test]
    fn name_spaces_are_independent() {
        let mut registry = Registry::new();
        registry.register_resource_type(widget()).unwrap();
        // A transition type with the same name is fine.
        assert!(registry.transition_type("Widget").is_err());
        assert!(registry.resource_type("Widget").is_ok());
    }
}
