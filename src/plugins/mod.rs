//! Bundled resource and transition implementations.
//!
//! Each plugin module exposes a `register` entry point that installs its
//! types into the process-wide [`Registry`](crate::registry::Registry).
//! [`register_all`] runs them in a fixed order and is idempotent, so any
//! number of call sites may use it as a guard.

use std::sync::LazyLock;

use crate::core::{EngineError, Result};

pub mod command;
pub mod file;
pub mod pkg;
pub mod user;

static REGISTERED: LazyLock<std::result::Result<(), String>> = LazyLock::new(|| {
    register_in_order().map_err(|e| e.to_string())
});

fn register_in_order() -> Result<()> {
    command::register()?;
    file::register()?;
    pkg::register()?;
    user::register()?;
    Ok(())
}

/// Register every bundled plugin, once per process.
pub fn register_all() -> Result<()> {
    REGISTERED.clone().map_err(|message| EngineError::Registration { message })
}
