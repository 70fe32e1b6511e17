// The collect phase: batching, dependency-driven partition refinement,
// singleton aggregation, and the ill-formed aggregate that tries to emit a
// resource.

use std::sync::Arc;

use converge::model::types::ExpandResource;
use converge::model::ResourceType;
use converge::schema::{AttrType, Value, ValueKind, valmap};
use converge::{Dep, EngineError, Realizer, Resource, ResourceGraph, factory, test_utils};
use serial_test::serial;

mod common;

fn batch_item(name: &str) -> Arc<Resource> {
    factory::resource("BatchItem", valmap([("name", Value::from(name))])).unwrap()
}

/// The member lists of every batch probe that fired, in firing order.
fn batches(log: &[String]) -> Vec<Vec<String>> {
    log.iter()
        .filter_map(|tag| tag.strip_prefix("batch:["))
        .filter_map(|rest| rest.strip_suffix(']'))
        .map(|names| {
            names.split(',').filter(|n| !n.is_empty()).map(str::to_string).collect()
        })
        .collect()
}

#[test]
#[serial]
fn unconstrained_items_batch_into_one_aggregate() {
    common::setup();
    test_utils::reset_log();

    let mut realizer = Realizer::empty();
    for name in ["a", "b", "c"] {
        realizer.add_resource(&batch_item(name), &[]).unwrap();
    }
    realizer.realize().unwrap();

    let fired = batches(&test_utils::take_log());
    assert_eq!(fired, vec![vec!["a", "b", "c"]]);
}

#[test]
#[serial]
fn dependency_splits_the_batch() {
    common::setup();
    test_utils::reset_log();

    let mut realizer = Realizer::empty();
    let a = realizer.add_resource(&batch_item("a"), &[]).unwrap();
    realizer.add_resource(&batch_item("b"), &[Dep::from(&a)]).unwrap();
    realizer.add_resource(&batch_item("c"), &[]).unwrap();
    realizer.realize().unwrap();

    let fired = batches(&test_utils::take_log());
    let batch_of = |name: &str| {
        fired
            .iter()
            .position(|b| b.iter().any(|n| n == name))
            .unwrap_or_else(|| panic!("'{name}' not collected in {fired:?}"))
    };

    // Any refinement is valid as long as a and b stay apart and a's batch
    // fires first; c may ride with either.
    assert_ne!(batch_of("a"), batch_of("b"));
    assert!(batch_of("a") < batch_of("b"));
    let all: Vec<String> = fired.iter().flatten().cloned().collect();
    assert_eq!(all.len(), 3);
}

#[test]
#[serial]
fn singletons_are_aggregated_uniformly() {
    common::setup();
    test_utils::reset_log();

    let mut realizer = Realizer::empty();
    realizer.add_resource(&batch_item("solo"), &[]).unwrap();
    realizer.realize().unwrap();

    let fired = batches(&test_utils::take_log());
    assert_eq!(fired, vec![vec!["solo"]]);
}

#[test]
#[serial]
fn collected_items_keep_outside_ordering() {
    common::setup();
    test_utils::reset_log();

    let mut realizer = Realizer::empty();
    let before = realizer
        .add_resource(&factory::resource("Step", valmap([("name", Value::from("pre"))])).unwrap(), &[])
        .unwrap();
    let item = realizer.add_resource(&batch_item("x"), &[Dep::from(&before)]).unwrap();
    realizer
        .add_resource(
            &factory::resource("Step", valmap([("name", Value::from("post"))])).unwrap(),
            &[Dep::from(&item)],
        )
        .unwrap();
    realizer.realize().unwrap();

    let log = test_utils::take_log();
    let pos = |tag: &str| log.iter().position(|t| t == tag).unwrap();
    assert!(pos("step:pre") < pos("batch:[x]"));
    assert!(pos("batch:[x]") < pos("step:post"));
}

#[test]
fn rogue_aggregate_fails_the_plan() {
    common::setup();

    let mut realizer = Realizer::empty();
    let rogue =
        factory::resource("RogueItem", valmap([("name", Value::from("r"))])).unwrap();
    realizer.add_resource(&rogue, &[]).unwrap();

    let err = realizer.ensure_frozen().unwrap_err();
    assert!(matches!(err, EngineError::AggregateProducedResource { .. }));
}

#[test]
fn unclaimed_collectible_fails_the_plan() {
    common::setup();

    // A collectible type no registered collector filters.
    let orphan_type = ResourceType::builder("OrphanItem")
        .id_attr("name", AttrType::of(ValueKind::Str))
        .collectible()
        .build()
        .unwrap();
    let orphan = orphan_type.instance(valmap([("name", Value::from("o"))])).unwrap();

    let mut realizer = Realizer::empty();
    realizer.add_resource(&orphan, &[]).unwrap();
    let err = realizer.ensure_frozen().unwrap_err();
    assert!(matches!(err, EngineError::UncollectedResource { .. }));
}

#[test]
fn every_filtered_resource_ends_up_processed() {
    common::setup();

    let mut realizer = Realizer::empty();
    let a = realizer.add_resource(&batch_item("p"), &[]).unwrap();
    realizer.add_resource(&batch_item("q"), &[Dep::from(&a)]).unwrap();
    realizer.ensure_frozen().unwrap();
    assert!(!realizer.graph().has_unprocessed());
    assert!(realizer.graph().iter_uncollected_resources().is_empty());
}

#[test]
fn expansion_may_emit_collectible_resources() {
    common::setup();

    // A resource whose expansion declares a collectible item; the collect
    // phase picks it up after the expand fixed point.
    struct EmitsItem;

    impl ExpandResource for EmitsItem {
        fn expand_into(
            &self,
            _resource: &Resource,
            graph: &mut ResourceGraph,
        ) -> converge::Result<()> {
            graph.add_resource(&batch_item("from-expansion"), &[])?;
            Ok(())
        }
    }

    let wrapper_type = ResourceType::builder("ItemEmitter")
        .id_attr("name", AttrType::of(ValueKind::Str))
        .expand(EmitsItem)
        .build()
        .unwrap();
    let wrapper = wrapper_type.instance(valmap([("name", Value::from("w"))])).unwrap();

    let mut realizer = Realizer::empty();
    realizer.add_resource(&wrapper, &[]).unwrap();
    realizer.ensure_frozen().unwrap();
    assert!(!realizer.graph().has_unprocessed());
}
