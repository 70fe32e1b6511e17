//! Files and directories on the local filesystem.
//!
//! `PlainFile` declares a file's contents, mode, and presence; `Directory`
//! declares a directory. Both read the live state before expanding and emit
//! only the transitions needed to converge, so an already-converged host
//! yields an empty plan. Writes go through a temporary file in the target
//! directory and a rename, so a crashed run never leaves a half-written
//! file behind.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use anyhow::Context;
use regex::Regex;
use tracing::debug;

use crate::core::{EngineError, Result};
use crate::graph::ResourceGraph;
use crate::model::resource::Resource;
use crate::model::types::{ExpandResource, PerformTransition, ResourceType, TransitionType};
use crate::registry::Registry;
use crate::schema::{AttrType, Attrs, Value, ValueKind, ValueMap, valmap};

static MODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^0[0-7]{3}$").expect("mode pattern")
});

fn is_abs_path(value: &Value) -> bool {
    value.as_str().is_some_and(|s| Path::new(s).is_absolute())
}

fn is_mode(value: &Value) -> bool {
    value.as_str().is_some_and(|s| MODE_RE.is_match(s))
}

fn file_present(path: &str) -> bool {
    // Broken symlinks still count as present.
    fs::symlink_metadata(path).is_ok()
}

fn file_contents(path: &str) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {path}"))
}

fn file_mode(path: &str) -> anyhow::Result<String> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = fs::symlink_metadata(path).with_context(|| format!("inspecting {path}"))?;
        Ok(format!("0{:03o}", meta.permissions().mode() & 0o777))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok("0644".to_string())
    }
}

fn apply_mode(file: &fs::File, mode: &str) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = u32::from_str_radix(mode, 8).context("parsing mode")?;
        file.set_permissions(fs::Permissions::from_mode(mode)).context("setting mode")?;
    }
    #[cfg(not(unix))]
    {
        let _ = (file, mode);
    }
    Ok(())
}

fn apply_mode_path(path: &str, mode: &str) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = u32::from_str_radix(mode, 8).context("parsing mode")?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting mode of {path}"))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------

struct WriteFile;

impl PerformTransition for WriteFile {
    fn perform(&self, instr: &Attrs) -> anyhow::Result<ValueMap> {
        let path = instr.get_str("path").context("path must be a string")?;
        let contents = instr.get_str("contents").unwrap_or_default();
        let mode = instr.get_str("mode").unwrap_or("0600");
        let dir = Path::new(path).parent().context("path has no parent directory")?;

        debug!(path, bytes = contents.len(), "writing file");
        let mut staged =
            tempfile::NamedTempFile::new_in(dir).with_context(|| format!("staging in {}", dir.display()))?;
        staged.write_all(contents.as_bytes()).context("writing staged file")?;
        // Mode goes on before the rename so the file is never world-visible
        // with staging permissions.
        apply_mode(staged.as_file(), mode)?;
        staged.persist(path).with_context(|| format!("replacing {path}"))?;
        Ok(ValueMap::new())
    }
}

struct RemoveFile;

impl PerformTransition for RemoveFile {
    fn perform(&self, instr: &Attrs) -> anyhow::Result<ValueMap> {
        let path = instr.get_str("path").context("path must be a string")?;
        debug!(path, "removing file");
        fs::remove_file(path).with_context(|| format!("removing {path}"))?;
        Ok(ValueMap::new())
    }
}

struct SetFileMode;

impl PerformTransition for SetFileMode {
    fn perform(&self, instr: &Attrs) -> anyhow::Result<ValueMap> {
        let path = instr.get_str("path").context("path must be a string")?;
        let mode = instr.get_str("mode").context("mode must be a string")?;
        apply_mode_path(path, mode)?;
        Ok(ValueMap::new())
    }
}

struct MakeDir;

impl PerformTransition for MakeDir {
    fn perform(&self, instr: &Attrs) -> anyhow::Result<ValueMap> {
        let path = instr.get_str("path").context("path must be a string")?;
        let mode = instr.get_str("mode").unwrap_or("0755");
        debug!(path, "creating directory");
        fs::create_dir_all(path).with_context(|| format!("creating {path}"))?;
        apply_mode_path(path, mode)?;
        Ok(ValueMap::new())
    }
}

struct RemoveDir;

impl PerformTransition for RemoveDir {
    fn perform(&self, instr: &Attrs) -> anyhow::Result<ValueMap> {
        let path = instr.get_str("path").context("path must be a string")?;
        debug!(path, "removing directory");
        fs::remove_dir(path).with_context(|| format!("removing {path}"))?;
        Ok(ValueMap::new())
    }
}

// ---------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------

fn read_present(id_attrs: &Attrs) -> anyhow::Result<Value> {
    let path = id_attrs.get_str("path").context("path must be a string")?;
    Ok(Value::Bool(file_present(path)))
}

fn read_contents(id_attrs: &Attrs) -> anyhow::Result<Value> {
    let path = id_attrs.get_str("path").context("path must be a string")?;
    Ok(Value::Str(file_contents(path)?))
}

fn read_mode(id_attrs: &Attrs) -> anyhow::Result<Value> {
    let path = id_attrs.get_str("path").context("path must be a string")?;
    Ok(Value::Str(file_mode(path)?))
}

/// The transitions converging one file, given its current and wanted state.
/// Empty when already converged.
fn plan_file(
    path: &str,
    wanted: &Attrs,
    present0: bool,
    current: Option<(&str, &str)>,
) -> Vec<(&'static str, ValueMap)> {
    let want_present = wanted.get_bool("present").unwrap_or(true);
    let contents = wanted.get_str("contents").unwrap_or_default();
    let mode = wanted.get_str("mode").unwrap_or("0600");

    if want_present {
        let write = valmap([
            ("path", Value::from(path)),
            ("contents", Value::from(contents)),
            ("mode", Value::from(mode)),
        ]);
        match current {
            Some((contents0, mode0)) => {
                if contents0 != contents {
                    vec![("WriteFile", write)]
                } else if mode0 != mode {
                    vec![(
                        "SetFileMode",
                        valmap([("path", Value::from(path)), ("mode", Value::from(mode))]),
                    )]
                } else {
                    Vec::new()
                }
            }
            None => vec![("WriteFile", write)],
        }
    } else if present0 {
        vec![("RemoveFile", valmap([("path", Value::from(path))]))]
    } else {
        Vec::new()
    }
}

struct PlainFileExpand;

impl ExpandResource for PlainFileExpand {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
        let read_failed = |source| EngineError::StateRead {
            resource: resource.identity().to_string(),
            source,
        };
        let path = resource.id_attrs().get_str("path").unwrap_or_default().to_string();
        let present0 = file_present(&path);
        let current = if present0 {
            Some((
                file_contents(&path).map_err(read_failed)?,
                file_mode(&path).map_err(read_failed)?,
            ))
        } else {
            None
        };
        let steps = plan_file(
            &path,
            resource.wanted_attrs(),
            present0,
            current.as_ref().map(|(c, m)| (c.as_str(), m.as_str())),
        );
        let registry = Registry::read();
        for (type_name, instr) in steps {
            let ttype = registry.transition_type(type_name)?;
            graph.add_transition(ttype.instance(instr)?, &[])?;
        }
        Ok(())
    }
}

struct DirectoryExpand;

impl ExpandResource for DirectoryExpand {
    fn expand_into(&self, resource: &Resource, graph: &mut ResourceGraph) -> Result<()> {
        let path = resource.id_attrs().get_str("path").unwrap_or_default().to_string();
        let wanted = resource.wanted_attrs();
        let want_present = wanted.get_bool("present").unwrap_or(true);
        let mode = wanted.get_str("mode").unwrap_or("0755");
        let present0 = Path::new(&path).is_dir();

        let step = if want_present && !present0 {
            Some((
                "MakeDir",
                valmap([("path", Value::from(path.as_str())), ("mode", Value::from(mode))]),
            ))
        } else if want_present {
            let mode0 = file_mode(&path).map_err(|source| EngineError::StateRead {
                resource: resource.identity().to_string(),
                source,
            })?;
            (mode0 != mode).then(|| {
                (
                    "SetFileMode",
                    valmap([("path", Value::from(path.as_str())), ("mode", Value::from(mode))]),
                )
            })
        } else if present0 {
            Some(("RemoveDir", valmap([("path", Value::from(path.as_str()))])))
        } else {
            None
        };

        if let Some((type_name, instr)) = step {
            let ttype = Registry::read().transition_type(type_name)?;
            graph.add_transition(ttype.instance(instr)?, &[])?;
        }
        Ok(())
    }
}

fn path_only_transition(name: &str, perform: impl PerformTransition + 'static) -> Result<Arc<TransitionType>> {
    TransitionType::builder(name)
        .instr_attr("path", AttrType::of(ValueKind::Str).validator(is_abs_path))
        .perform(perform)
        .build()
}

/// Register the file and directory types.
pub fn register() -> Result<()> {
    let write_file = TransitionType::builder("WriteFile")
        .instr_attr("path", AttrType::of(ValueKind::Str).validator(is_abs_path))
        .instr_attr("contents", AttrType::of(ValueKind::Str).default(""))
        .instr_attr("mode", AttrType::of(ValueKind::Str).validator(is_mode).default("0600"))
        .perform(WriteFile)
        .build()?;
    let set_mode = TransitionType::builder("SetFileMode")
        .instr_attr("path", AttrType::of(ValueKind::Str).validator(is_abs_path))
        .instr_attr("mode", AttrType::of(ValueKind::Str).validator(is_mode))
        .perform(SetFileMode)
        .build()?;
    let make_dir = TransitionType::builder("MakeDir")
        .instr_attr("path", AttrType::of(ValueKind::Str).validator(is_abs_path))
        .instr_attr("mode", AttrType::of(ValueKind::Str).validator(is_mode).default("0755"))
        .perform(MakeDir)
        .build()?;

    let plain_file = ResourceType::builder("PlainFile")
        .id_attr("path", AttrType::of(ValueKind::Str).validator(is_abs_path))
        .state_attr("present", AttrType::of(ValueKind::Bool).default(true).reader(read_present))
        .state_attr("contents", AttrType::of(ValueKind::Str).default("").reader(read_contents))
        .state_attr(
            "mode",
            AttrType::of(ValueKind::Str).validator(is_mode).default("0600").reader(read_mode),
        )
        .expand(PlainFileExpand)
        .build()?;
    let directory = ResourceType::builder("Directory")
        .id_attr("path", AttrType::of(ValueKind::Str).validator(is_abs_path))
        .state_attr("present", AttrType::of(ValueKind::Bool).default(true).reader(read_present))
        .state_attr(
            "mode",
            AttrType::of(ValueKind::Str).validator(is_mode).default("0755").reader(read_mode),
        )
        .expand(DirectoryExpand)
        .build()?;

    let mut registry = Registry::write();
    registry.register_transition_type(write_file)?;
    registry.register_transition_type(path_only_transition("RemoveFile", RemoveFile)?)?;
    registry.register_transition_type(set_mode)?;
    registry.register_transition_type(make_dir)?;
    registry.register_transition_type(path_only_transition("RemoveDir", RemoveDir)?)?;
    registry.register_resource_type(plain_file)?;
    registry.register_resource_type(directory)?;
    Ok(())
}
