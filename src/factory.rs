//! Registry-indexed construction of resources and transitions.
//!
//! These free functions are the usual way user programs build instances:
//! look the type up by its registered name, hand it a value-dict.
//!
//! ```no_run
//! use converge::factory;
//! use converge::schema::{Value, valmap};
//!
//! # fn main() -> converge::Result<()> {
//! let motd = factory::resource(
//!     "PlainFile",
//!     valmap([
//!         ("path", Value::from("/etc/motd")),
//!         ("contents", Value::from("welcome\n")),
//!     ]),
//! )?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::core::Result;
use crate::model::resource::{Resource, ResourceRef};
use crate::model::transition::Transition;
use crate::registry::Registry;
use crate::schema::ValueMap;

/// Build a resource by registered type name.
pub fn resource(type_name: &str, valdict: ValueMap) -> Result<Arc<Resource>> {
    let rtype = Registry::read().resource_type(type_name)?;
    rtype.instance(valdict)
}

/// Build a transition by registered type name.
pub fn transition(type_name: &str, instr_valdict: ValueMap) -> Result<Arc<Transition>> {
    let ttype = Registry::read().transition_type(type_name)?;
    ttype.instance(instr_valdict)
}

/// Build a reference to a resource by registered type name and identity.
pub fn reference(type_name: &str, id_valdict: ValueMap) -> Result<ResourceRef> {
    let rtype = Registry::read().resource_type(type_name)?;
    rtype.reference(id_valdict)
}
