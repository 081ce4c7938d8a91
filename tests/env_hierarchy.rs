mod common;

use std::fs;

use common::DeepMerger;
use genesis::env::{Environment, lookup};
use serde_json::Value;

fn write(root: &std::path::Path, name: &str, body: &str) {
    fs::write(root.join(name), body).expect("write env file");
}

#[test]
fn child_inherits_and_overrides_ancestor_params() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.yml",
        "genesis: { env: a }\nkit: { name: demo }\nparams:\n  x: 1\n",
    );
    write(
        dir.path(),
        "a-b.yml",
        "genesis: { env: a-b }\nkit: { name: demo }\nparams: {}\n",
    );

    let environment = Environment::load(dir.path(), "a-b").expect("load a-b");
    let params = environment.params(&DeepMerger).expect("params merge");
    assert_eq!(
        lookup(&params, "params.x").and_then(Value::as_i64),
        Some(1),
        "a-b inherits params.x from a.yml"
    );

    write(
        dir.path(),
        "a-b.yml",
        "genesis: { env: a-b }\nkit: { name: demo }\nparams:\n  x: 2\n",
    );
    let environment = Environment::load(dir.path(), "a-b").expect("reload a-b");
    let params = environment.params(&DeepMerger).expect("params merge");
    assert_eq!(lookup(&params, "params.x").and_then(Value::as_i64), Some(2));
}

#[test]
fn serialized_parameter_view_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.yml",
        "genesis: { env: a }\nkit: { name: demo }\nparams:\n  region: us-east\n  count: 3\n",
    );
    let environment = Environment::load(dir.path(), "a").unwrap();
    let first = environment.params(&DeepMerger).unwrap();
    let second = environment.params(&DeepMerger).unwrap();
    assert_eq!(first, second);
    let reparsed: Value =
        serde_yaml_bw::from_str(&serde_yaml_bw::to_string(&first).unwrap()).unwrap();
    assert_eq!(
        lookup(&reparsed, "params.region"),
        lookup(&first, "params.region")
    );
}

#[test]
fn hierarchy_list_is_ancestors_plus_inherits() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.yml", "params: { tier: base }\n");
    write(
        dir.path(),
        "a-b.yml",
        "genesis:\n  inherits: [shared-net]\nparams: {}\n",
    );
    write(
        dir.path(),
        "a-b-c.yml",
        "genesis: { env: a-b-c }\nkit: { name: demo }\n",
    );
    write(dir.path(), "shared-net.yml", "params: { cidr: 10.0.0.0/16 }\n");

    let environment = Environment::load(dir.path(), "a-b-c").unwrap();
    let files = environment.hierarchy_files().unwrap();
    let names: Vec<String> = files
        .iter()
        .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec!["a.yml", "shared-net.yml", "a-b.yml", "a-b-c.yml"],
        "3 ancestors plus 1 inherited file, inherited inserted before its referrer"
    );
}

#[test]
fn missing_inherited_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "solo.yml",
        "genesis:\n  env: solo\n  inherits: [gone]\nkit: { name: demo }\n",
    );
    let environment = Environment::load(dir.path(), "solo").unwrap();
    let err = environment.hierarchy_files().unwrap_err();
    assert!(format!("{err}").contains("gone.yml"), "{err}");
}

#[test]
fn environment_must_declare_its_own_name() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "sandbox.yml",
        "genesis: { env: production }\nkit: { name: demo }\n",
    );
    let err = Environment::load(dir.path(), "sandbox").unwrap_err();
    assert!(format!("{err}").contains("production"), "{err}");

    assert!(Environment::load(dir.path(), "absent").is_err());
}

#[test]
fn cached_ancestor_copies_win_over_repo_files() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.yml", "params: { from: repo }\n");
    write(
        dir.path(),
        "a-b.yml",
        "genesis: { env: a-b }\nkit: { name: demo }\n",
    );
    let cache = dir.path().join(".genesis/cached/a-b");
    fs::create_dir_all(&cache).unwrap();
    fs::write(cache.join("a.yml"), "params: { from: cache }\n").unwrap();

    let environment = Environment::load(dir.path(), "a-b").unwrap();
    let params = environment.params(&DeepMerger).unwrap();
    assert_eq!(
        lookup(&params, "params.from").and_then(Value::as_str),
        Some("cache")
    );
}
