//! Dynamic attribute values.
//!
//! Resources and transitions are declared through value-dicts: plain maps
//! from attribute name to [`Value`]. Values are deep-comparable and
//! deep-hashable so that resource identities can key graph lookups, and they
//! convert loss-lessly to YAML for the textual representation.
//!
//! Floating-point values are deliberately unsupported: identities must hash.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::model::resource::ResourceRef;

/// A map from attribute name to value, as provided by user code.
pub type ValueMap = BTreeMap<String, Value>;

/// Build a [`ValueMap`] from name/value pairs.
///
/// ```
/// use converge::schema::{Value, valmap};
///
/// let vals = valmap([("name", Value::from("postgres")), ("present", Value::from(true))]);
/// assert_eq!(vals.len(), 2);
/// ```
pub fn valmap<K, I>(entries: I) -> ValueMap
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// A dynamically-typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Explicit absence; only valid where the attribute allows it
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// UTF-8 string
    Str(String),
    /// Ordered list of values
    List(Vec<Value>),
    /// String-keyed mapping
    Map(BTreeMap<String, Value>),
    /// Reference to a resource declared elsewhere, by target identity
    Ref(ResourceRef),
}

/// Type tag for [`Value`] variants, used in native-type constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Int,
    Str,
    List,
    Map,
    Ref,
}

impl Value {
    /// The kind of this value, or `None` for `Null`.
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int(_) => Some(ValueKind::Int),
            Value::Str(_) => Some(ValueKind::Str),
            Value::List(_) => Some(ValueKind::List),
            Value::Map(_) => Some(ValueKind::Map),
            Value::Ref(_) => Some(ValueKind::Ref),
        }
    }

    /// Whether this value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// String view, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean view, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// List view, if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Reference view, if this is a `Ref`.
    pub fn as_ref_value(&self) -> Option<&ResourceRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// List-of-strings view, if this is a `List` of `Str` values.
    pub fn as_str_list(&self) -> Option<Vec<&str>> {
        let items = self.as_list()?;
        items.iter().map(Value::as_str).collect()
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Str => "str",
            ValueKind::List => "list",
            ValueKind::Map => "map",
            ValueKind::Ref => "ref",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Ref(r) => write!(f, "ref {}", r.target_identity()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::Str).collect())
    }
}

impl From<Vec<&str>> for Value {
    fn from(items: Vec<&str>) -> Self {
        Value::List(items.into_iter().map(Value::from).collect())
    }
}

impl From<ResourceRef> for Value {
    fn from(r: ResourceRef) -> Self {
        Value::Ref(r)
    }
}

impl Serialize for Value {
    /// References serialize as a single-key `$ref` mapping carrying the
    /// target type name and identity attributes; every other variant maps to
    /// the natural YAML form.
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => items.serialize(serializer),
            Value::Map(entries) => entries.serialize(serializer),
            Value::Ref(r) => {
                let mut target = BTreeMap::new();
                for (name, value) in r.id_attrs().iter() {
                    target.insert(name.to_string(), value.clone());
                }
                let mut body = serializer.serialize_map(Some(1))?;
                body.serialize_entry(
                    "$ref",
                    &RefRepr {
                        type_name: r.type_name(),
                        id: target,
                    },
                )?;
                body.end()
            }
        }
    }
}

#[derive(serde::Serialize)]
struct RefRepr<'a> {
    #[serde(rename = "type")]
    type_name: &'a str,
    id: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(Value::from(true).kind(), Some(ValueKind::Bool));
        assert_eq!(Value::from(3i64).kind(), Some(ValueKind::Int));
        assert_eq!(Value::from("x").kind(), Some(ValueKind::Str));
        assert_eq!(Value::Null.kind(), None);
    }

    #[test]
    fn str_list_view_rejects_mixed_lists() {
        let ok = Value::from(vec!["a", "b"]);
        assert_eq!(ok.as_str_list(), Some(vec!["a", "b"]));

        let mixed = Value::List(vec![Value::from("a"), Value::from(1i64)]);
        assert_eq!(mixed.as_str_list(), None);
    }

    #[test]
    fn display_is_compact() {
        let v = Value::List(vec![Value::from("a"), Value::from(2i64)]);
        assert_eq!(v.to_string(), "[a, 2]");
    }

    #[test]
    fn scalars_serialize_to_plain_yaml() {
        let v = Value::Map(BTreeMap::from([
            ("n".to_string(), Value::from(3i64)),
            ("s".to_string(), Value::from("hi")),
        ]));
        let yaml = serde_yaml::to_string(&v).unwrap();
        assert!(yaml.contains("n: 3"));
        assert!(yaml.contains("s: hi"));
    }
}
