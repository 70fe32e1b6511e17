//! Named collections of attribute schemas.

use indexmap::IndexMap;

use crate::core::{EngineError, Result};
use crate::schema::attr_type::AttrType;
use crate::schema::attrs::Attrs;
use crate::schema::value::ValueMap;
use std::sync::Arc;

/// An ordered mapping from attribute name to [`AttrType`].
///
/// A `SimpleType` validates value-dicts: unknown names are rejected, missing
/// names are defaulted or reported, and every value passes through its
/// attribute schema. Resource and transition types are each composed of two
/// disjoint `SimpleType`s.
#[derive(Debug, Clone)]
pub struct SimpleType {
    atypes: IndexMap<String, AttrType>,
}

impl SimpleType {
    /// Build a schema from name/attribute pairs.
    ///
    /// Fails when an attribute's own configuration is inconsistent or its
    /// default does not satisfy its constraints.
    pub fn new<K, I>(atypes: I) -> Result<Arc<Self>>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, AttrType)>,
    {
        let atypes: IndexMap<String, AttrType> =
            atypes.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for (name, atype) in &atypes {
            atype.check(name)?;
        }
        Ok(Arc::new(Self { atypes }))
    }

    /// The empty schema.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            atypes: IndexMap::new(),
        })
    }

    /// Internal constructor for schemas known to be consistent.
    pub(crate) fn new_unchecked<K, I>(atypes: I) -> Arc<Self>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, AttrType)>,
    {
        Arc::new(Self {
            atypes: atypes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        })
    }

    /// Look up one attribute schema.
    pub fn attr(&self, name: &str) -> Option<&AttrType> {
        self.atypes.get(name)
    }

    /// Whether the schema declares the given name.
    pub fn declares(&self, name: &str) -> bool {
        self.atypes.contains_key(name)
    }

    /// Iterate (name, schema) pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrType)> {
        self.atypes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of declared attributes.
    pub fn len(&self) -> usize {
        self.atypes.len()
    }

    /// Whether the schema declares no attributes.
    pub fn is_empty(&self) -> bool {
        self.atypes.is_empty()
    }

    /// Declared attribute names whose schemas carry no overlap with `other`.
    pub(crate) fn require_disjoint(&self, other: &SimpleType) -> Result<()> {
        for name in self.atypes.keys() {
            if other.declares(name) {
                return Err(EngineError::invalid(
                    name.clone(),
                    "attribute is declared by both halves of the type",
                ));
            }
        }
        Ok(())
    }

    /// Validate a full value-dict: reject unknown names, fill defaults,
    /// require a value wherever no default exists.
    pub fn prepare(&self, valdict: ValueMap) -> Result<Attrs> {
        for name in valdict.keys() {
            if !self.declares(name) {
                return Err(EngineError::UnknownAttribute { attr: name.clone() });
            }
        }

        let mut values = IndexMap::with_capacity(self.atypes.len());
        let mut defaulted = Vec::new();
        for (name, atype) in &self.atypes {
            let value = match valdict.get(name) {
                Some(value) => value.clone(),
                None => match atype.default_value() {
                    Some(default) => {
                        defaulted.push(name.clone());
                        default
                    }
                    None => {
                        return Err(EngineError::MissingAttribute { attr: name.clone() });
                    }
                },
            };
            atype.validate(name, &value)?;
            values.insert(name.clone(), value);
        }
        Ok(Attrs::from_prepared(Arc::new(self.clone()), values, defaulted))
    }

    /// Validate only the provided names: no defaulting, unknown names still
    /// rejected. The result contains exactly the provided attributes.
    pub fn prepare_partial(&self, valdict: ValueMap) -> Result<Attrs> {
        let mut values = IndexMap::new();
        for (name, atype) in &self.atypes {
            if let Some(value) = valdict.get(name) {
                atype.validate(name, value)?;
                values.insert(name.clone(), value.clone());
            }
        }
        for name in valdict.keys() {
            if !self.declares(name) {
                return Err(EngineError::UnknownAttribute { attr: name.clone() });
            }
        }
        Ok(Attrs::from_prepared(Arc::new(self.clone()), values, Vec::new()))
    }
}
