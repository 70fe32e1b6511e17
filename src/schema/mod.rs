//! The attribute and type system.
//!
//! Everything a resource or transition declares flows through this module:
//! dynamic [`Value`]s, per-attribute schemas ([`AttrType`]), named schema
//! collections ([`SimpleType`]), and validated bags ([`Attrs`]).

pub mod attr_type;
pub mod attrs;
pub mod simple_type;
pub mod value;

pub use attr_type::{AttrType, Reader, Validator};
pub use attrs::Attrs;
pub use simple_type::SimpleType;
pub use value::{Value, ValueKind, ValueMap, valmap};
