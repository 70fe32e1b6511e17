// End-to-end runs of the bundled plugins: file convergence against a
// temporary directory, guarded commands, and apt batch planning.

use std::fs;

use converge::schema::{Value, valmap};
use converge::{Dep, Realizer, factory};

mod common;

#[test]
fn plain_file_converges_and_then_plans_nothing() {
    common::setup_with_plugins();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motd");
    let path_str = path.to_str().unwrap();

    let declare = || {
        factory::resource(
            "PlainFile",
            valmap([
                ("path", Value::from(path_str)),
                ("contents", Value::from("hello host\n")),
                ("mode", Value::from("0640"))
            ]),
        )
        .unwrap()
    };

    let mut realizer = Realizer::empty();
    realizer.add_resource(&declare(), &[]).unwrap();
    realizer.realize().unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "hello host\n");

    // Re-declaring the same state yields an empty plan.
    let mut second = Realizer::empty();
    second.add_resource(&declare(), &[]).unwrap();
    second.ensure_frozen().unwrap();
    assert!(second.sorted_transitions().unwrap().is_empty());
}

#[test]
fn plain_file_removal() {
    common::setup_with_plugins();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale");
    fs::write(&path, "old").unwrap();

    let resource = factory::resource(
        "PlainFile",
        valmap([
            ("path", Value::from(path.to_str().unwrap())),
            ("present", Value::from(false)),
        ]),
    )
    .unwrap();

    let mut realizer = Realizer::empty();
    realizer.add_resource(&resource, &[]).unwrap();
    realizer.realize().unwrap();
    assert!(!path.exists());
}

#[test]
fn directory_is_created_with_mode() {
    common::setup_with_plugins();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("svc/log");
    let resource = factory::resource(
        "Directory",
        valmap([
            ("path", Value::from(path.to_str().unwrap())),
            ("mode", Value::from("0750")),
        ]),
    )
    .unwrap();

    let mut realizer = Realizer::empty();
    realizer.add_resource(&resource, &[]).unwrap();
    realizer.realize().unwrap();
    assert!(path.is_dir());
}

#[cfg(unix)]
#[test]
fn command_transition_runs_and_reports_status() {
    common::setup_with_plugins();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let transition = factory::transition(
        "Command",
        valmap([(
            "cmdline",
            Value::from(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("touch {}", marker.display()),
            ]),
        )]),
    )
    .unwrap();

    let results = transition.realize().unwrap();
    assert_eq!(results.get_int("status"), Some(0));
    assert!(marker.exists());
}

#[cfg(unix)]
#[test]
fn unless_guard_skips_the_command() {
    common::setup_with_plugins();

    // The command itself would fail; the guard prevents it from running.
    let transition = factory::transition(
        "Command",
        valmap([
            ("cmdline", Value::from(vec!["/bin/sh", "-c", "exit 1"])),
            ("unless", Value::from(vec!["/bin/sh", "-c", "exit 0"])),
        ]),
    )
    .unwrap();
    assert_eq!(transition.realize().unwrap().get_int("status"), Some(0));
}

#[cfg(unix)]
#[test]
fn command_resource_realizes_through_expansion() {
    common::setup_with_plugins();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("expanded");

    let resource = factory::resource(
        "Command",
        valmap([
            ("name", Value::from("make-marker")),
            (
                "cmdline",
                Value::from(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("touch {}", marker.display()),
                ]),
            ),
        ]),
    )
    .unwrap();

    let mut realizer = Realizer::empty();
    realizer.add_resource(&resource, &[]).unwrap();
    realizer.realize().unwrap();
    assert!(marker.exists());
}

#[test]
fn apt_packages_plan_one_batched_install() {
    common::setup_with_plugins();

    let pkg = |name: &str| {
        factory::resource("AptPackage", valmap([("name", Value::from(name))])).unwrap()
    };

    let mut realizer = Realizer::empty();
    realizer.add_resource(&pkg("vim"), &[]).unwrap();
    realizer.add_resource(&pkg("curl"), &[]).unwrap();
    realizer.add_resource(&pkg("git"), &[]).unwrap();
    realizer.ensure_frozen().unwrap();

    let plan = realizer.sorted_transitions().unwrap();
    assert_eq!(plan.len(), 1);
    let cmdline = plan[0].instr_attrs().get("cmdline").unwrap().as_str_list().unwrap();
    assert_eq!(cmdline[..4], ["/usr/bin/aptitude", "install", "-y", "--"]);
    assert!(cmdline.contains(&"vim+"));
    assert!(cmdline.contains(&"curl+"));
    assert!(cmdline.contains(&"git+"));
}

#[test]
fn dependent_apt_packages_split_into_ordered_installs() {
    common::setup_with_plugins();

    let pkg = |name: &str| {
        factory::resource("AptPackage", valmap([("name", Value::from(name))])).unwrap()
    };

    let mut realizer = Realizer::empty();
    let base = realizer.add_resource(&pkg("postgresql"), &[]).unwrap();
    realizer.add_resource(&pkg("postgresql-contrib"), &[Dep::from(&base)]).unwrap();
    realizer.ensure_frozen().unwrap();

    let plan = realizer.sorted_transitions().unwrap();
    assert_eq!(plan.len(), 2);
    let spec_of = |i: usize| {
        plan[i].instr_attrs().get("cmdline").unwrap().as_str_list().unwrap().join(" ")
    };
    // The base package's batch installs first and the two never share a
    // command line.
    assert!(spec_of(0).contains("postgresql+"));
    assert!(!spec_of(0).contains("postgresql-contrib+"));
    assert!(spec_of(1).contains("postgresql-contrib+"));
}

#[test]
fn user_plan_is_inspectable_without_running() {
    common::setup_with_plugins();

    // Freezing reads /etc/passwd; the declared user does not exist, so the
    // plan is exactly one adduser command. Nothing is realized.
    if !std::path::Path::new("/etc/passwd").exists() {
        return;
    }
    let user = factory::resource(
        "User",
        valmap([
            ("name", Value::from("converge-test-nobody")),
            ("home", Value::from("/var/empty")),
        ]),
    )
    .unwrap();

    let mut realizer = Realizer::empty();
    realizer.add_resource(&user, &[]).unwrap();
    realizer.ensure_frozen().unwrap();

    let plan = realizer.sorted_transitions().unwrap();
    assert_eq!(plan.len(), 1);
    let cmdline = plan[0].instr_attrs().get("cmdline").unwrap().as_str_list().unwrap();
    assert_eq!(cmdline[0], "/usr/sbin/adduser");
    assert!(cmdline.contains(&"converge-test-nobody"));
}
