//! Transitions: imperative, run-once operations.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::core::{EngineError, Result};
use crate::model::types::TransitionType;
use crate::schema::Attrs;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// An imperative side-effecting operation: instruction attrs in, results
/// attrs out, executed exactly once.
///
/// Unlike resources, transitions carry no identity and are never
/// deduplicated: two equal commands may legitimately both run. Each
/// transition is tagged with a process-unique serial for graph bookkeeping
/// and diagnostics.
pub struct Transition {
    ttype: Arc<TransitionType>,
    instr_attrs: Attrs,
    serial: u64,
    results: OnceLock<Attrs>,
}

impl Transition {
    pub(crate) fn new(ttype: Arc<TransitionType>, instr_attrs: Attrs) -> Self {
        Self {
            ttype,
            instr_attrs,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            results: OnceLock::new(),
        }
    }

    /// The transition's type.
    pub fn ttype(&self) -> &Arc<TransitionType> {
        &self.ttype
    }

    /// The validated instruction attributes.
    pub fn instr_attrs(&self) -> &Attrs {
        &self.instr_attrs
    }

    /// Process-unique creation serial.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether `realize` has completed successfully.
    pub fn realized(&self) -> bool {
        self.results.get().is_some()
    }

    /// The results recorded by a successful `realize`, if any.
    pub fn results(&self) -> Option<Attrs> {
        self.results.get().cloned()
    }

    /// Execute the side effect. May only be called once.
    ///
    /// The performer's output is validated against the results schema and
    /// stored; a performer failure becomes
    /// [`EngineError::TransitionFailed`].
    pub fn realize(&self) -> Result<Attrs> {
        if self.realized() {
            return Err(EngineError::AlreadyRealized {
                transition: self.describe(),
            });
        }
        debug!(transition = %self.describe(), "realizing");
        let performer = Arc::clone(self.ttype.performer());
        let valdict =
            performer
                .perform(&self.instr_attrs)
                .map_err(|source| EngineError::TransitionFailed {
                    transition: self.describe(),
                    source,
                })?;
        let attrs = self.ttype.results_type().prepare(valdict)?;
        match self.results.set(attrs.clone()) {
            Ok(()) => Ok(attrs),
            Err(_) => Err(EngineError::AlreadyRealized {
                transition: self.describe(),
            }),
        }
    }

    /// Compact rendering for logs and error messages.
    pub fn describe(&self) -> String {
        let instr = self.instr_attrs.to_string();
        if instr.is_empty() {
            format!("{}#{}", self.ttype.name(), self.serial)
        } else {
            format!("{}#{}({instr})", self.ttype.name(), self.serial)
        }
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transition({})", self.describe())
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
