//! Validated, immutable attribute bags.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::model::resource::ResourceRef;
use crate::schema::simple_type::SimpleType;
use crate::schema::value::Value;

/// A value-dict that has passed validation against a [`SimpleType`].
///
/// Attrs are immutable and cheap to clone. Equality and hashing cover the
/// value map; the owning resource or transition carries the type identity.
/// Values iterate in schema declaration order.
#[derive(Clone)]
pub struct Attrs {
    stype: Arc<SimpleType>,
    values: IndexMap<String, Value>,
    defaulted: BTreeSet<String>,
}

impl Attrs {
    pub(crate) fn from_prepared(
        stype: Arc<SimpleType>,
        values: IndexMap<String, Value>,
        defaulted: Vec<String>,
    ) -> Self {
        Self {
            stype,
            values,
            defaulted: defaulted.into_iter().collect(),
        }
    }

    /// The schema these attrs were validated against.
    pub fn stype(&self) -> &Arc<SimpleType> {
        &self.stype
    }

    /// Look up one value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// String accessor; `None` when absent or not a string.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name)?.as_str()
    }

    /// Boolean accessor; `None` when absent or not a boolean.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name)?.as_bool()
    }

    /// Integer accessor; `None` when absent or not an integer.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_int()
    }

    /// Reference accessor; `None` when absent or not a reference.
    pub fn get_ref(&self, name: &str) -> Option<&ResourceRef> {
        self.get(name)?.as_ref_value()
    }

    /// Number of attributes present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no attributes are present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All (name, value) pairs in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Pairs whose value was provided explicitly and differs from the
    /// schema default. This is the compact presentation used for display
    /// and serialization.
    pub fn iter_nondefault(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.iter().filter(|(name, value)| {
            if self.defaulted.contains(*name) {
                return false;
            }
            match self.stype.attr(name).and_then(|a| a.default_value()) {
                Some(default) => **value != default,
                None => true,
            }
        })
    }

    /// The `Ref`-valued pairs.
    pub fn iter_refs(&self) -> impl Iterator<Item = (&str, &ResourceRef)> {
        self.iter().filter_map(|(name, value)| match value {
            Value::Ref(r) => Some((name, r)),
            _ => None,
        })
    }
}

impl PartialEq for Attrs {
    fn eq(&self, other: &Self) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        self.values
            .iter()
            .all(|(k, v)| other.values.get(k) == Some(v))
    }
}

impl Eq for Attrs {}

impl Hash for Attrs {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Key order is normalized so equal maps hash equally even if their
        // schemas declared attributes in different orders.
        let mut entries: Vec<_> = self.values.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in entries {
            k.hash(state);
            v.hash(state);
        }
    }
}

impl fmt::Debug for Attrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.iter()).finish()
    }
}

impl fmt::Display for Attrs {
    /// Compact `name=value` rendering of the non-default attributes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.iter_nondefault().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

impl std::ops::Index<&str> for Attrs {
    type Output = Value;

    fn index(&self, name: &str) -> &Value {
        &self.values[name]
    }
}

impl Serialize for Attrs {
    /// Serializes the non-default attributes only.
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let entries: Vec<_> = self.iter_nondefault().collect();
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (name, value) in entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
