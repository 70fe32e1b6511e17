//! Debian packages, batched through aptitude.
//!
//! `AptPackage` is collectible: instances never expand on their own.
//! `AptPackageCollector` gathers every compatible instance into one
//! `AptPackageBatch` aggregate, which expands to a single aptitude
//! invocation covering the whole batch. Package dependencies are aptitude's
//! problem, not ours.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::collector::{Aggregate, Collector, ExpandAggregate};
use crate::core::Result;
use crate::graph::ResourceGraph;
use crate::model::resource::Resource;
use crate::model::types::ResourceType;
use crate::registry::Registry;
use crate::schema::{AttrType, Value, ValueKind, valmap};

// Package names per Debian policy 5.6.1.
static PKG_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9+.-]+$").expect("package name pattern"));

// Versions per Debian policy 5.6.12, epoch and revision optional.
static PKG_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+:)?[0-9][A-Za-z0-9.+:~-]*$").expect("package version pattern")
});

fn is_pkg_name(value: &Value) -> bool {
    value.as_str().is_some_and(|s| PKG_NAME_RE.is_match(s))
}

fn is_pkg_version(value: &Value) -> bool {
    value.as_str().is_some_and(|s| PKG_VERSION_RE.is_match(s))
}

/// The `name[=version]` plus state-suffix form documented in aptitude(8).
fn to_aptitude_string(package: &Resource) -> String {
    let name = package.id_attrs().get_str("name").unwrap_or_default();
    let state = package.wanted_attrs().get_str("state").unwrap_or("installed");
    let mut spec = name.to_string();
    if state == "installed"
        && let Some(version) = package.wanted_attrs().get_str("version")
    {
        spec.push('=');
        spec.push_str(version);
    }
    spec.push(match state {
        "installed" => '+',
        "uninstalled" => '-',
        "purged" => '_',
        _ => '+',
    });
    spec
}

struct BatchExpand;

impl ExpandAggregate for BatchExpand {
    fn expand_into(&self, aggregate: &Aggregate, graph: &mut ResourceGraph) -> Result<()> {
        let mut cmdline = vec![
            "/usr/bin/aptitude".to_string(),
            "install".to_string(),
            "-y".to_string(),
            "--".to_string(),
        ];
        let mut specs: Vec<String> =
            aggregate.members().iter().map(|p| to_aptitude_string(p)).collect();
        specs.sort();
        cmdline.extend(specs);

        let env = Value::Map(BTreeMap::from([(
            "DEBIAN_FRONTEND".to_string(),
            Value::from("noninteractive"),
        )]));
        let ttype = Registry::read().transition_type("Command")?;
        let transition = ttype.instance(valmap([
            ("cmdline", Value::from(cmdline)),
            ("extra_env", env),
        ]))?;
        graph.add_transition(transition, &[])?;
        Ok(())
    }
}

/// Groups every eligible package into one batch.
struct AptPackageCollector;

impl Collector for AptPackageCollector {
    fn name(&self) -> &str {
        "AptPackageCollector"
    }

    fn filter(&self, resource: &Resource) -> bool {
        resource.rtype().name() == "AptPackage"
    }

    fn collect(&self, part: &[Arc<Resource>]) -> Result<Arc<Aggregate>> {
        Aggregate::new("AptPackageBatch", part.to_vec(), BatchExpand)
    }
}

fn resource_type() -> Result<Arc<ResourceType>> {
    ResourceType::builder("AptPackage")
        .id_attr("name", AttrType::of(ValueKind::Str).validator(is_pkg_name))
        .state_attr("version", AttrType::of(ValueKind::Str).none_allowed().validator(is_pkg_version))
        .state_attr(
            "state",
            AttrType::of(ValueKind::Str)
                .valid_values(["installed", "uninstalled", "purged"])
                .default("installed"),
        )
        .collectible()
        .build()
}

/// Register the `AptPackage` type and its collector.
pub fn register() -> Result<()> {
    let mut registry = Registry::write();
    registry.register_resource_type(resource_type()?)?;
    registry.register_collector(Arc::new(AptPackageCollector))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(entries: Vec<(&str, Value)>) -> Arc<Resource> {
        resource_type().unwrap().instance(valmap(entries)).unwrap()
    }

    #[test]
    fn name_validator_follows_debian_policy() {
        assert!(is_pkg_name(&Value::from("libc6")));
        assert!(is_pkg_name(&Value::from("g++-12")));
        assert!(!is_pkg_name(&Value::from("A")));
        assert!(!is_pkg_name(&Value::from("x")));
    }

    #[test]
    fn version_validator_accepts_epochs_and_revisions() {
        assert!(is_pkg_version(&Value::from("1.2.3-1")));
        assert!(is_pkg_version(&Value::from("2:9.0~beta1")));
        assert!(!is_pkg_version(&Value::from("not a version")));
    }

    #[test]
    fn aptitude_spec_encodes_state() {
        let installed = package(vec![("name", Value::from("gitosis"))]);
        assert_eq!(to_aptitude_string(&installed), "gitosis+");

        let pinned = package(vec![
            ("name", Value::from("gitosis")),
            ("version", Value::from("0.2-1")),
        ]);
        assert_eq!(to_aptitude_string(&pinned), "gitosis=0.2-1+");

        let purged = package(vec![
            ("name", Value::from("gitosis")),
            ("state", Value::from("purged")),
        ]);
        assert_eq!(to_aptitude_string(&purged), "gitosis_");
    }

    #[test]
    fn batch_expands_to_one_command() {
        crate::plugins::register_all().unwrap();
        let members = vec![
            package(vec![("name", Value::from("vim"))]),
            package(vec![("name", Value::from("curl"))]),
        ];
        let aggregate = AptPackageCollector.collect(&members).unwrap();

        let mut sub = ResourceGraph::new();
        aggregate.expand_into(&mut sub).unwrap();
        let transitions = sub.sorted_transitions().unwrap();
        assert_eq!(transitions.len(), 1);
        let cmdline = transitions[0].instr_attrs().get("cmdline").unwrap();
        assert_eq!(
            cmdline.as_str_list().unwrap(),
            vec!["/usr/bin/aptitude", "install", "-y", "--", "curl+", "vim+"]
        );
    }
}
