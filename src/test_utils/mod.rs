//! Test utilities.
//!
//! Fixture resource and transition types for exercising the planner without
//! touching the host: probe transitions record their tag in a process-global
//! log instead of performing side effects, and the fixture resources cover
//! the planning shapes (plain expansion, nesting, references, hoisting,
//! aggregation, and a deliberately ill-formed aggregate).
//!
//! Tests that assert on the realize log share process-global state and must
//! not run concurrently with each other; the integration suites guard them
//! with `serial_test`.

use std::sync::{LazyLock, Mutex, Once, PoisonError};

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::collector::{Aggregate, Collector, ExpandAggregate};
use crate::core::{EngineError, Result};
use crate::graph::{Dep, ResourceGraph};
use crate::model::resource::Resource;
use crate::model::types::{
    ExpandResource, PerformTransition, ResourceType, TransitionType,
};
use crate::registry::Registry;
use crate::schema::{AttrType, Attrs, Value, ValueKind, ValueMap, valmap};
use std::sync::Arc;

static INIT_LOGGING: Once = Once::new();

/// Initialize tracing for tests, once per process.
///
/// Respects `RUST_LOG` when set; otherwise uses the provided level, or
/// stays silent when neither is given.
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

static REALIZE_LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Record one probe firing.
pub fn record(tag: impl Into<String>) {
    REALIZE_LOG.lock().unwrap_or_else(PoisonError::into_inner).push(tag.into());
}

/// Clear the realize log.
pub fn reset_log() {
    REALIZE_LOG.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

/// Take the realize log, clearing it.
pub fn take_log() -> Vec<String> {
    std::mem::take(&mut *REALIZE_LOG.lock().unwrap_or_else(PoisonError::into_inner))
}

// ---------------------------------------------------------------------
// Probe transitions
// ---------------------------------------------------------------------

struct Probe;

impl PerformTransition for Probe {
    fn perform(&self, instr: &Attrs) -> anyhow::Result<ValueMap> {
        record(instr.get_str("tag").unwrap_or_default());
        Ok(ValueMap::new())
    }
}

struct FailProbe;

impl PerformTransition for FailProbe {
    fn perform(&self, instr: &Attrs) -> anyhow::Result<ValueMap> {
        anyhow::bail!("probe '{}' failed", instr.get_str("tag").unwrap_or_default())
    }
}

/// Build a probe transition recording `tag` when realized.
pub fn probe(tag: &str) -> Result<Arc<crate::model::transition::Transition>> {
    let ttype = Registry::read().transition_type("Probe")?;
    ttype.instance(valmap([("tag", Value::from(tag))]))
}

// ---------------------------------------------------------------------
// Fixture resources
// ---------------------------------------------------------------------

/// Expands to one probe tagged `step:<name>`.
struct StepExpand;

impl ExpandResource for StepExpand {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
        let name = resource.id_attrs().get_str("name").unwrap_or_default();
        graph.add_transition(probe(&format!("step:{name}"))?, &[])?;
        Ok(())
    }
}

/// Depends on its `dep` reference: the probe fires after the target's
/// whole expansion.
struct CompositeExpand;

impl ExpandResource for CompositeExpand {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
        let name = resource.id_attrs().get_str("name").unwrap_or_default();
        let dep = resource.wanted_attrs().get_ref("dep").cloned();
        let depends: Vec<Dep> = dep.map(Dep::from).into_iter().collect();
        graph.add_transition(probe(&format!("composite:{name}"))?, &depends)?;
        Ok(())
    }
}

/// Expands into a further `Step` resource plus a probe ordered after it,
/// exercising the expansion fixed point.
struct NestedExpand;

impl ExpandResource for NestedExpand {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
        let name = resource.id_attrs().get_str("name").unwrap_or_default();
        let step = Registry::read()
            .resource_type("Step")?
            .instance(valmap([("name", Value::from(format!("inner-{name}")))]))?;
        let step = graph.add_resource(&step, &[])?;
        graph.add_transition(probe(&format!("nested:{name}"))?, &[Dep::from(&step)])?;
        Ok(())
    }
}

/// Queues a `Step` for the top-level graph and orders its own probe after
/// the reference.
struct HoistedExpand;

impl ExpandResource for HoistedExpand {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
        let name = resource.id_attrs().get_str("name").unwrap_or_default();
        let step = Registry::read()
            .resource_type("Step")?
            .instance(valmap([("name", Value::from(format!("hoisted-{name}")))]))?;
        let rref = graph.add_to_top(&step)?;
        graph.add_transition(probe(&format!("hoist:{name}"))?, &[Dep::from(&rref)])?;
        Ok(())
    }
}

/// Expands to a probe that fails when realized.
struct DoomedExpand;

impl ExpandResource for DoomedExpand {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
        let name = resource.id_attrs().get_str("name").unwrap_or_default();
        let ttype = Registry::read().transition_type("FailProbe")?;
        graph.add_transition(
            ttype.instance(valmap([("tag", Value::from(format!("doomed:{name}")))]))?,
            &[],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Collectors
// ---------------------------------------------------------------------

struct BatchExpand;

impl ExpandAggregate for BatchExpand {
    fn expand_into(&self, aggregate: &Aggregate, graph: &mut ResourceGraph) -> Result<()> {
        let mut names: Vec<&str> = aggregate
            .members()
            .iter()
            .filter_map(|m| m.id_attrs().get_str("name"))
            .collect();
        names.sort_unstable();
        graph.add_transition(probe(&format!("batch:[{}]", names.join(",")))?, &[])?;
        Ok(())
    }
}

/// Batches every `BatchItem` into one probe naming the sorted members.
struct BatchCollector;

impl Collector for BatchCollector {
    fn name(&self) -> &str {
        "BatchCollector"
    }

    fn filter(&self, resource: &Resource) -> bool {
        resource.rtype().name() == "BatchItem"
    }

    fn collect(&self, part: &[Arc<Resource>]) -> Result<Arc<Aggregate>> {
        Aggregate::new("Batch", part.to_vec(), BatchExpand)
    }
}

/// Ill-formed on purpose: the aggregate emits a resource.
struct RogueExpand;

impl ExpandAggregate for RogueExpand {
    fn expand_into(&self, _aggregate: &Aggregate, graph: &mut ResourceGraph) -> Result<()> {
        let step = Registry::read()
            .resource_type("Step")?
            .instance(valmap([("name", Value::from("rogue-escapee"))]))?;
        graph.add_resource(&step, &[])?;
        Ok(())
    }
}

struct RogueCollector;

impl Collector for RogueCollector {
    fn name(&self) -> &str {
        "RogueCollector"
    }

    fn filter(&self, resource: &Resource) -> bool {
        resource.rtype().name() == "RogueItem"
    }

    fn collect(&self, part: &[Arc<Resource>]) -> Result<Arc<Aggregate>> {
        Aggregate::new("RogueBatch", part.to_vec(), RogueExpand)
    }
}

// ---------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------

fn named_resource(
    name: &str,
    expand: impl ExpandResource + 'static,
) -> Result<Arc<ResourceType>> {
    ResourceType::builder(name)
        .id_attr("name", AttrType::of(ValueKind::Str))
        .expand(expand)
        .build()
}

fn register_in_order() -> Result<()> {
    let probe_type = TransitionType::builder("Probe")
        .instr_attr("tag", AttrType::of(ValueKind::Str))
        .perform(Probe)
        .build()?;
    let fail_type = TransitionType::builder("FailProbe")
        .instr_attr("tag", AttrType::of(ValueKind::Str))
        .perform(FailProbe)
        .build()?;
    let composite = ResourceType::builder("Composite")
        .id_attr("name", AttrType::of(ValueKind::Str))
        .state_attr("dep", AttrType::new().ref_type("Step").none_allowed())
        .expand(CompositeExpand)
        .build()?;
    let batch_item = ResourceType::builder("BatchItem")
        .id_attr("name", AttrType::of(ValueKind::Str))
        .collectible()
        .build()?;
    let rogue_item = ResourceType::builder("RogueItem")
        .id_attr("name", AttrType::of(ValueKind::Str))
        .collectible()
        .build()?;

    let mut registry = Registry::write();
    registry.register_transition_type(probe_type)?;
    registry.register_transition_type(fail_type)?;
    registry.register_resource_type(named_resource("Step", StepExpand)?)?;
    registry.register_resource_type(composite)?;
    registry.register_resource_type(named_resource("Nested", NestedExpand)?)?;
    registry.register_resource_type(named_resource("Hoisted", HoistedExpand)?)?;
    registry.register_resource_type(named_resource("Doomed", DoomedExpand)?)?;
    registry.register_resource_type(batch_item)?;
    registry.register_resource_type(rogue_item)?;
    registry.register_collector(Arc::new(BatchCollector))?;
    registry.register_collector(Arc::new(RogueCollector))?;
    Ok(())
}

static REGISTERED: LazyLock<std::result::Result<(), String>> =
    LazyLock::new(|| register_in_order().map_err(|e| e.to_string()));

/// Register every fixture type, once per process.
pub fn register_fixtures() -> Result<()> {
    REGISTERED.clone().map_err(|message| EngineError::Registration { message })
}
