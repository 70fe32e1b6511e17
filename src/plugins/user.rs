//! Local system users, managed with the Debian adduser tools.

use std::fs;
use std::sync::{Arc, LazyLock};

use anyhow::Context;
use regex::Regex;

use crate::core::Result;
use crate::graph::ResourceGraph;
use crate::model::resource::Resource;
use crate::model::types::{ExpandResource, ResourceType};
use crate::registry::Registry;
use crate::schema::{Attrs, Value, ValueKind, ValueMap, valmap};
use crate::schema::AttrType;

// From useradd(8).
static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]*\$?$").expect("username pattern"));

static UNIX_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[/A-Za-z0-9._-]*$").expect("path pattern"));

fn is_username(value: &Value) -> bool {
    value.as_str().is_some_and(|s| USERNAME_RE.is_match(s))
}

fn is_unix_path(value: &Value) -> bool {
    value.is_null() || value.as_str().is_some_and(|s| UNIX_PATH_RE.is_match(s))
}

/// Look a user up in the passwd database.
fn passwd_lookup(name: &str) -> anyhow::Result<Option<(String, String)>> {
    let passwd = fs::read_to_string("/etc/passwd").context("reading /etc/passwd")?;
    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.first() == Some(&name) && fields.len() >= 7 {
            return Ok(Some((fields[5].to_string(), fields[6].to_string())));
        }
    }
    Ok(None)
}

fn read_all(id_attrs: &Attrs) -> anyhow::Result<ValueMap> {
    let name = id_attrs.get_str("name").context("name must be a string")?;
    Ok(match passwd_lookup(name)? {
        Some((home, shell)) => valmap([
            ("state", Value::from("present")),
            ("home", Value::from(home)),
            ("shell", Value::from(shell)),
        ]),
        None => valmap([
            ("state", Value::from("absent")),
            ("home", Value::Null),
            ("shell", Value::Null),
        ]),
    })
}

/// The command line converging one user, or `None` when already converged.
///
/// Pure over the read and wanted states, so the decision table is testable
/// without touching the host.
fn plan_user(name: &str, read: &Attrs, wanted: &Attrs) -> Option<Vec<String>> {
    if read == wanted {
        return None;
    }
    let s0 = read.get_str("state").unwrap_or("absent");
    let s1 = wanted.get_str("state").unwrap_or("present");
    let mut cmdline: Vec<String> = match (s0, s1) {
        ("absent", "absent") => return None,
        ("present", "present") => vec!["/usr/sbin/usermod".into()],
        ("absent", "present") => vec![
            "/usr/sbin/adduser".into(),
            "--system".into(),
            "--disabled-password".into(),
        ],
        _ => vec!["/usr/sbin/deluser".into()],
    };

    if s1 == "present" {
        if let Some(home) = wanted.get_str("home") {
            cmdline.push("--home".into());
            cmdline.push(home.into());
        }
        if let Some(shell) = wanted.get_str("shell") {
            cmdline.push("--shell".into());
            cmdline.push(shell.into());
        }
    }
    cmdline.push("--".into());
    cmdline.push(name.into());
    Some(cmdline)
}

struct UserExpand;

impl ExpandResource for UserExpand {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
        let name = resource.id_attrs().get_str("name").unwrap_or_default().to_string();
        let read = resource.read_attrs()?;
        if let Some(cmdline) = plan_user(&name, &read, resource.wanted_attrs()) {
            let ttype = Registry::read().transition_type("Command")?;
            graph.add_transition(
                ttype.instance(valmap([("cmdline", Value::from(cmdline))]))?,
                &[],
            )?;
        }
        Ok(())
    }
}

fn resource_type() -> Result<Arc<ResourceType>> {
    ResourceType::builder("User")
        .id_attr("name", AttrType::of(ValueKind::Str).validator(is_username))
        .state_attr(
            "state",
            AttrType::of(ValueKind::Str).valid_values(["present", "absent"]).default("present"),
        )
        .state_attr("home", AttrType::new().none_allowed().validator(is_unix_path))
        .state_attr("shell", AttrType::new().none_allowed().validator(is_unix_path))
        .read_all(read_all)
        .expand(UserExpand)
        .build()
}

/// Register the `User` type.
pub fn register() -> Result<()> {
    Registry::write().register_resource_type(resource_type()?)
}
