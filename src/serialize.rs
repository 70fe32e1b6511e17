//! Loss-less textual representation of resources and transitions.
//!
//! The form is a YAML mapping keyed by the registered type name. Resources
//! carry `id` and `wanted` sub-maps, transitions carry `instr`; only
//! non-default attributes are emitted. Reference values encode as a
//! single-key `$ref` mapping with the target type name and identity map:
//!
//! ```yaml
//! PgDatabase:
//!   id:
//!     name: tracker
//!   wanted:
//!     owner:
//!       $ref:
//!         type: PgUser
//!         id:
//!           name: tracker
//! ```
//!
//! Deserialization reconstructs instances through the process-wide
//! [`Registry`], so the involved types must be registered first.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::core::{EngineError, Result};
use crate::model::resource::Resource;
use crate::model::transition::Transition;
use crate::registry::Registry;
use crate::schema::{Value, ValueMap};

/// Render a resource to its YAML form.
pub fn resource_to_yaml(resource: &Resource) -> Result<String> {
    serde_yaml::to_string(&ResourceRepr(resource))
        .map_err(|e| EngineError::invalid("document", e.to_string()))
}

/// Render a transition to its YAML form.
pub fn transition_to_yaml(transition: &Transition) -> Result<String> {
    serde_yaml::to_string(&TransitionRepr(transition))
        .map_err(|e| EngineError::invalid("document", e.to_string()))
}

/// Reconstruct a resource from its YAML form through the registry.
pub fn resource_from_yaml(text: &str) -> Result<Arc<Resource>> {
    let (type_name, body) = parse_document(text)?;
    let mut valdict = ValueMap::new();
    for section in ["id", "wanted"] {
        if let Some(section_value) = body.get(section) {
            merge_section(section, section_value, &mut valdict)?;
        }
    }
    let rtype = Registry::read().resource_type(&type_name)?;
    rtype.instance(valdict)
}

/// Reconstruct a transition from its YAML form through the registry.
pub fn transition_from_yaml(text: &str) -> Result<Arc<Transition>> {
    let (type_name, body) = parse_document(text)?;
    let mut valdict = ValueMap::new();
    if let Some(section_value) = body.get("instr") {
        merge_section("instr", section_value, &mut valdict)?;
    }
    let ttype = Registry::read().transition_type(&type_name)?;
    ttype.instance(valdict)
}

struct ResourceRepr<'a>(&'a Resource);

impl Serialize for ResourceRepr<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut outer = serializer.serialize_map(Some(1))?;
        outer.serialize_entry(self.0.rtype().name(), &ResourceBody(self.0))?;
        outer.end()
    }
}

struct ResourceBody<'a>(&'a Resource);

impl Serialize for ResourceBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut body = serializer.serialize_map(Some(2))?;
        body.serialize_entry("id", self.0.id_attrs())?;
        body.serialize_entry("wanted", self.0.wanted_attrs())?;
        body.end()
    }
}

struct TransitionRepr<'a>(&'a Transition);

impl Serialize for TransitionRepr<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut outer = serializer.serialize_map(Some(1))?;
        outer.serialize_entry(self.0.ttype().name(), &TransitionBody(self.0))?;
        outer.end()
    }
}

struct TransitionBody<'a>(&'a Transition);

impl Serialize for TransitionBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut body = serializer.serialize_map(Some(1))?;
        body.serialize_entry("instr", self.0.instr_attrs())?;
        body.end()
    }
}

/// Split a document into its type name and body mapping.
fn parse_document(text: &str) -> Result<(String, serde_yaml::Mapping)> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| EngineError::invalid("document", e.to_string()))?;
    let serde_yaml::Value::Mapping(mapping) = doc else {
        return Err(EngineError::invalid("document", "expected a mapping"));
    };
    if mapping.len() != 1 {
        return Err(EngineError::invalid(
            "document",
            "expected a single type-name key",
        ));
    }
    let (key, body) = mapping
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::invalid("document", "expected a single type-name key"))?;
    let serde_yaml::Value::String(type_name) = key else {
        return Err(EngineError::invalid("document", "type name must be a string"));
    };
    let body = match body {
        serde_yaml::Value::Mapping(body) => body,
        serde_yaml::Value::Null => serde_yaml::Mapping::new(),
        _ => {
            return Err(EngineError::invalid("document", "type body must be a mapping"));
        }
    };
    Ok((type_name, body))
}

fn merge_section(
    section: &str,
    section_value: &serde_yaml::Value,
    valdict: &mut ValueMap,
) -> Result<()> {
    let serde_yaml::Value::Mapping(mapping) = section_value else {
        return Err(EngineError::invalid(section, "expected a mapping"));
    };
    for (key, value) in mapping {
        let serde_yaml::Value::String(name) = key else {
            return Err(EngineError::invalid(section, "attribute names must be strings"));
        };
        valdict.insert(name.clone(), yaml_to_value(value)?);
    }
    Ok(())
}

/// Convert parsed YAML into a [`Value`], reconstructing `$ref` mappings
/// through the registry.
pub fn yaml_to_value(yaml: &serde_yaml::Value) -> Result<Value> {
    match yaml {
        serde_yaml::Value::Null => Ok(Value::Null),
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_yaml::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| EngineError::invalid("value", format!("unsupported number {n}"))),
        serde_yaml::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_yaml::Value::Sequence(items) => {
            Ok(Value::List(items.iter().map(yaml_to_value).collect::<Result<_>>()?))
        }
        serde_yaml::Value::Mapping(mapping) => {
            if mapping.len() == 1
                && let Some(target) = mapping.get("$ref")
            {
                return ref_from_yaml(target);
            }
            let mut entries = BTreeMap::new();
            for (key, value) in mapping {
                let serde_yaml::Value::String(name) = key else {
                    return Err(EngineError::invalid("value", "map keys must be strings"));
                };
                entries.insert(name.clone(), yaml_to_value(value)?);
            }
            Ok(Value::Map(entries))
        }
        serde_yaml::Value::Tagged(_) => {
            Err(EngineError::invalid("value", "tagged values are not supported"))
        }
    }
}

fn ref_from_yaml(target: &serde_yaml::Value) -> Result<Value> {
    let serde_yaml::Value::Mapping(target) = target else {
        return Err(EngineError::invalid("$ref", "expected a mapping"));
    };
    let type_name = target
        .get("type")
        .and_then(serde_yaml::Value::as_str)
        .ok_or_else(|| EngineError::invalid("$ref", "missing target type name"))?;
    let mut id_valdict = ValueMap::new();
    if let Some(id_section) = target.get("id") {
        merge_section("id", id_section, &mut id_valdict)?;
    }
    let rtype = Registry::read().resource_type(type_name)?;
    Ok(Value::Ref(rtype.reference(id_valdict)?))
}
