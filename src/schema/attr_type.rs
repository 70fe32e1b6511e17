//! Per-attribute schemas.
//!
//! An [`AttrType`] carries everything the engine knows about a single
//! attribute: its default, whether explicit absence is allowed, an optional
//! enumerated value set, an optional native kind, an optional resource-type
//! constraint for reference attributes, an optional validator predicate, and
//! an optional reader that discovers the live value from the host.

use crate::core::{EngineError, Result};
use crate::schema::attrs::Attrs;
use crate::schema::value::{Value, ValueKind};

/// Predicate checking a candidate value beyond the structural constraints.
pub type Validator = fn(&Value) -> bool;

/// Reads the live value of one attribute, given the owning identity attrs.
pub type Reader = fn(&Attrs) -> anyhow::Result<Value>;

/// Schema for a single attribute. Immutable once built.
///
/// Construction is builder-style; the combination is checked when the
/// attribute is installed into a [`super::SimpleType`]:
///
/// ```
/// use converge::schema::{AttrType, ValueKind};
///
/// let state = AttrType::new()
///     .kind(ValueKind::Str)
///     .valid_values(["present", "absent"])
///     .default("present");
/// assert!(state.has_default());
/// ```
#[derive(Clone)]
pub struct AttrType {
    default: Option<Value>,
    none_allowed: bool,
    valid_values: Option<Vec<Value>>,
    kind: Option<ValueKind>,
    ref_type: Option<String>,
    validator: Option<Validator>,
    reader: Option<Reader>,
}

impl AttrType {
    /// An unconstrained, required attribute.
    pub fn new() -> Self {
        Self {
            default: None,
            none_allowed: false,
            valid_values: None,
            kind: None,
            ref_type: None,
            validator: None,
            reader: None,
        }
    }

    /// Shorthand for a required attribute of the given kind.
    pub fn of(kind: ValueKind) -> Self {
        Self::new().kind(kind)
    }

    /// Set a default value. Checked against the rest of the schema when the
    /// owning type is built.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Allow `Null`, which becomes the default and bypasses validation.
    /// Mutually exclusive with [`AttrType::default`].
    pub fn none_allowed(mut self) -> Self {
        self.none_allowed = true;
        self
    }

    /// Restrict to an enumerated value set.
    pub fn valid_values(mut self, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        self.valid_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Require a native kind.
    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Require a `Ref` value targeting the named resource type.
    pub fn ref_type(mut self, type_name: impl Into<String>) -> Self {
        self.kind = Some(ValueKind::Ref);
        self.ref_type = Some(type_name.into());
        self
    }

    /// Attach a validator predicate.
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Attach a live-state reader.
    pub fn reader(mut self, reader: Reader) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Whether the attribute can be left unset in a value-dict.
    pub fn has_default(&self) -> bool {
        self.none_allowed || self.default.is_some()
    }

    /// The value used when the attribute is unset, if any.
    pub fn default_value(&self) -> Option<Value> {
        if self.none_allowed {
            Some(Value::Null)
        } else {
            self.default.clone()
        }
    }

    /// Whether a live-state reader is attached.
    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    /// Check internal consistency, then the default against the schema.
    pub(crate) fn check(&self, name: &str) -> Result<()> {
        if self.none_allowed && self.default.is_some() {
            return Err(EngineError::invalid(
                name,
                "cannot combine none_allowed with a default value",
            ));
        }
        if let Some(default) = &self.default {
            self.validate(name, default)?;
        }
        Ok(())
    }

    /// Validate a candidate value against every constraint, in order:
    /// null bypass, kind, reference target type, enumerated set, predicate.
    pub fn validate(&self, name: &str, value: &Value) -> Result<()> {
        if value.is_null() {
            if self.none_allowed {
                return Ok(());
            }
            return Err(EngineError::invalid(name, "null is not allowed here"));
        }

        if let Some(kind) = self.kind
            && value.kind() != Some(kind)
        {
            return Err(EngineError::invalid(
                name,
                format!(
                    "expected {kind}, got {}",
                    value.kind().map(|k| k.to_string()).unwrap_or_default()
                ),
            ));
        }

        if let Some(ref_type) = &self.ref_type {
            match value {
                Value::Ref(r) if r.type_name() == ref_type => {}
                Value::Ref(r) => {
                    return Err(EngineError::invalid(
                        name,
                        format!("reference must target a {ref_type}, got {}", r.type_name()),
                    ));
                }
                _ => {
                    return Err(EngineError::invalid(name, "expected a resource reference"));
                }
            }
        }

        if let Some(valid_values) = &self.valid_values
            && !valid_values.contains(value)
        {
            return Err(EngineError::invalid(
                name,
                format!("'{value}' is not one of the admissible values"),
            ));
        }

        if let Some(validator) = self.validator
            && !validator(value)
        {
            return Err(EngineError::invalid(name, format!("'{value}' was rejected")));
        }

        Ok(())
    }

    /// Read the live value through the attached reader and validate it.
    ///
    /// Returns `None` when no reader is attached.
    pub fn read(&self, name: &str, id_attrs: &Attrs) -> Option<Result<Value>> {
        let reader = self.reader?;
        let outcome = match reader(id_attrs) {
            Ok(value) => self.validate(name, &value).map(|()| value),
            Err(source) => Err(EngineError::StateRead {
                resource: format!("attribute '{name}'"),
                source,
            }),
        };
        Some(outcome)
    }
}

impl Default for AttrType {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AttrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttrType")
            .field("default", &self.default)
            .field("none_allowed", &self.none_allowed)
            .field("valid_values", &self.valid_values)
            .field("kind", &self.kind)
            .field("ref_type", &self.ref_type)
            .field("has_validator", &self.validator.is_some())
            .field("has_reader", &self.reader.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonempty(v: &Value) -> bool {
        v.as_str().is_some_and(|s| !s.is_empty())
    }

    #[test]
    fn kind_constraint_rejects_mismatches() {
        let at = AttrType::of(ValueKind::Str);
        assert!(at.validate("name", &Value::from("x")).is_ok());
        assert!(at.validate("name", &Value::from(1i64)).is_err());
    }

    #[test]
    fn null_bypasses_other_constraints_when_allowed() {
        let at = AttrType::of(ValueKind::Str).none_allowed().validator(nonempty);
        assert!(at.validate("home", &Value::Null).is_ok());
        assert!(at.validate("home", &Value::from("")).is_err());
        assert_eq!(at.default_value(), Some(Value::Null));
    }

    #[test]
    fn enumerated_values_are_enforced() {
        let at = AttrType::of(ValueKind::Str).valid_values(["present", "absent"]);
        assert!(at.validate("state", &Value::from("present")).is_ok());
        assert!(at.validate("state", &Value::from("held")).is_err());
    }

    #[test]
    fn bad_default_is_rejected_at_check_time() {
        let at = AttrType::of(ValueKind::Str)
            .valid_values(["present", "absent"])
            .default("held");
        assert!(at.check("state").is_err());
    }

    #[test]
    fn none_allowed_conflicts_with_default() {
        let at = AttrType::of(ValueKind::Str).none_allowed().default("x");
        assert!(at.check("state").is_err());
    }
}
