//! Core error types shared by every engine module.

pub mod error;

pub use error::{EngineError, Result};
