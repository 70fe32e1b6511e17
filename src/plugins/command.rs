//! Shell command execution.
//!
//! The `Command` transition runs an argv-style command line, optionally
//! feeding stdin and skipping the run entirely when an `unless` guard
//! already succeeds. The `Command` resource wraps the same fields for
//! graph-level declaration; it expands to a single transition. Either the
//! command is idempotent, or it is guarded by `unless`.

use std::io::Write;
use std::path::Path;
use std::process::{Command as OsCommand, Stdio};
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::core::Result;
use crate::graph::ResourceGraph;
use crate::model::resource::Resource;
use crate::model::types::{ExpandResource, PerformTransition, ResourceType, TransitionType};
use crate::registry::Registry;
use crate::schema::{AttrType, Attrs, Value, ValueKind, ValueMap, valmap};

fn is_cmdline(value: &Value) -> bool {
    value.as_str_list().is_some_and(|argv| !argv.is_empty())
}

fn is_env_map(value: &Value) -> bool {
    match value {
        Value::Map(entries) => entries.values().all(|v| v.as_str().is_some()),
        _ => false,
    }
}

/// Locate the executable for the first argv element.
fn resolve_program(argv0: &str) -> anyhow::Result<std::path::PathBuf> {
    let path = Path::new(argv0);
    if path.is_absolute() || argv0.contains('/') {
        return Ok(path.to_path_buf());
    }
    which::which(argv0).with_context(|| format!("no '{argv0}' executable on PATH"))
}

fn build_command(instr: &Attrs, argv: &[&str]) -> anyhow::Result<OsCommand> {
    let program = resolve_program(argv[0])?;
    let mut command = OsCommand::new(program);
    command.args(&argv[1..]);
    if let Some(Value::Map(extra_env)) = instr.get("extra_env") {
        for (key, value) in extra_env {
            if let Some(v) = value.as_str() {
                command.env(key, v);
            }
        }
    }
    Ok(command)
}

struct RunCommand;

impl PerformTransition for RunCommand {
    fn perform(&self, instr: &Attrs) -> anyhow::Result<ValueMap> {
        if let Some(unless) = instr.get("unless").and_then(Value::as_str_list) {
            let guard = build_command(instr, &unless)?
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .with_context(|| format!("could not run guard '{}'", unless.join(" ")))?;
            if guard.success() {
                debug!(guard = %unless.join(" "), "guard succeeded, skipping command");
                return Ok(valmap([("status", Value::from(0i64))]));
            }
        }

        let argv = instr
            .get("cmdline")
            .and_then(Value::as_str_list)
            .context("cmdline must be a list of strings")?;
        let mut command = build_command(instr, &argv)?;

        let input = instr.get_str("input");
        if input.is_some() {
            command.stdin(Stdio::piped());
        }
        debug!(cmdline = %argv.join(" "), "running command");
        let mut child =
            command.spawn().with_context(|| format!("could not start '{}'", argv[0]))?;
        if let (Some(input), Some(stdin)) = (input, child.stdin.take()) {
            let mut stdin = stdin;
            stdin.write_all(input.as_bytes()).context("writing command input")?;
        }
        let status = child.wait().context("waiting for command")?;
        if !status.success() {
            anyhow::bail!("'{}' exited with {status}", argv.join(" "));
        }
        Ok(valmap([("status", Value::from(i64::from(status.code().unwrap_or(0))))]))
    }
}

struct CommandExpand;

impl ExpandResource for CommandExpand {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
        let mut instr = ValueMap::new();
        for name in ["cmdline", "input", "unless", "extra_env"] {
            if let Some(value) = resource.wanted_attrs().get(name) {
                instr.insert(name.to_string(), value.clone());
            }
        }
        let ttype = Registry::read().transition_type("Command")?;
        graph.add_transition(ttype.instance(instr)?, &[])?;
        Ok(())
    }
}

fn transition_type() -> Result<Arc<TransitionType>> {
    TransitionType::builder("Command")
        .instr_attr("cmdline", AttrType::of(ValueKind::List).validator(is_cmdline))
        .instr_attr("input", AttrType::of(ValueKind::Str).none_allowed())
        .instr_attr(
            "unless",
            AttrType::of(ValueKind::List).none_allowed().validator(is_cmdline),
        )
        .instr_attr(
            "extra_env",
            AttrType::of(ValueKind::Map).none_allowed().validator(is_env_map),
        )
        .results_attr("status", AttrType::of(ValueKind::Int))
        .perform(RunCommand)
        .build()
}

fn resource_type() -> Result<Arc<ResourceType>> {
    ResourceType::builder("Command")
        .id_attr("name", AttrType::of(ValueKind::Str))
        .state_attr("cmdline", AttrType::of(ValueKind::List).validator(is_cmdline))
        .state_attr("input", AttrType::of(ValueKind::Str).none_allowed())
        .state_attr(
            "unless",
            AttrType::of(ValueKind::List).none_allowed().validator(is_cmdline),
        )
        .state_attr(
            "extra_env",
            AttrType::of(ValueKind::Map).none_allowed().validator(is_env_map),
        )
        .expand(CommandExpand)
        .build()
}

/// Register the `Command` transition and resource types.
pub fn register() -> Result<()> {
    let mut registry = Registry::write();
    registry.register_transition_type(transition_type()?)?;
    registry.register_resource_type(resource_type()?)?;
    Ok(())
}
