mod common;

use common::TestStore;
use genesis::secrets::validator::OpensslInspector;
use genesis::secrets::{
    NullSink, ParseOptions, PlanAction, PlanExecutor, PlanValidator, SecretPlan, plans_for,
};
use serde_json::Value;

fn metadata(yaml: &str) -> Value {
    serde_yaml_bw::from_str(yaml).expect("metadata parses")
}

#[test]
fn ca_is_ordered_and_materialized_before_its_dependents() {
    let meta = metadata(
        r#"
certificates:
  base:
    tls:
      ca: { is_ca: true }
      server: { names: [api.example] }
"#,
    );
    let plans = plans_for(&meta, &[], &ParseOptions::new()).unwrap();
    let paths: Vec<String> = plans.iter().map(|p| p.path()).collect();
    assert_eq!(paths, vec!["tls/ca", "tls/server"]);

    let store = TestStore::new();
    let client = store.client();
    let executor = PlanExecutor::new(&client, "secret/sandbox/demo");
    let summary = executor
        .execute(PlanAction::Add, &plans, &mut NullSink)
        .unwrap();
    assert_eq!(summary.ok, 2);

    let invocations = store.safe.invocations.lock().unwrap().clone();
    let issue_order: Vec<&Vec<String>> = invocations
        .iter()
        .filter(|args| args.first().map(String::as_str) == Some("x509"))
        .collect();
    assert_eq!(issue_order[0][2], "secret/sandbox/demo/tls/ca");
    assert_eq!(issue_order[1][2], "secret/sandbox/demo/tls/server");
    let server_cmd = issue_order[1].join(" ");
    assert!(
        server_cmd.contains("--signed-by secret/sandbox/demo/tls/ca"),
        "{server_cmd}"
    );
    assert!(server_cmd.contains("--name api.example"), "{server_cmd}");
}

#[test]
fn added_plans_pass_the_presence_check() {
    let meta = metadata(
        r#"
certificates:
  base:
    tls:
      ca: { is_ca: true }
      server: { names: [api.example] }
credentials:
  base:
    app/ssh: ssh 2048
    app/users:
      pass: random 32 fmt base64 at pass-b64
"#,
    );
    let plans = plans_for(&meta, &[], &ParseOptions::new()).unwrap();
    let store = TestStore::new();
    let client = store.client();
    let executor = PlanExecutor::new(&client, "secret/sandbox/demo");
    executor
        .execute(PlanAction::Add, &plans, &mut NullSink)
        .unwrap();

    let inspector = OpensslInspector;
    let validator = PlanValidator::new(&client, "secret/sandbox/demo", &inspector);
    let summary = validator.check(&plans, &mut NullSink).unwrap();
    assert_eq!(summary.missing, 0, "everything just added must be present");
    assert_eq!(summary.error, 0);
    assert_eq!(summary.ok, plans.len());
    assert_eq!(
        store.safe.value("secret/sandbox/demo/app/users", "pass-b64"),
        Some("formatted".to_string())
    );
}

#[test]
fn signing_cycle_fails_the_batch_with_cycle_errors() {
    let meta = metadata(
        r#"
certificates:
  base:
    a:
      ca: { is_ca: true, signed_by: b/ca }
    b:
      ca: { is_ca: true, signed_by: a/ca }
"#,
    );
    let plans = plans_for(&meta, &[], &ParseOptions::new()).unwrap();
    assert_eq!(plans.len(), 2);
    for plan in &plans {
        let SecretPlan::Error(err) = plan else {
            panic!("expected error plan, got {plan:?}");
        };
        assert!(err.error.contains("Cyclical"), "{}", err.error);
    }

    let store = TestStore::new();
    let client = store.client();
    let executor = PlanExecutor::new(&client, "secret/sandbox/demo");
    let summary = executor
        .execute(PlanAction::Add, &plans, &mut NullSink)
        .unwrap();
    assert_eq!(summary.error, 2);
    assert!(summary.failed(false), "cycle must fail the aggregate status");
}

#[test]
fn renew_on_keypairs_is_skipped_without_store_traffic() {
    let meta = metadata(
        r#"
credentials:
  base:
    app/signing: rsa 2048
"#,
    );
    let plans = plans_for(&meta, &[], &ParseOptions::new()).unwrap();
    let store = TestStore::new();
    let client = store.client();
    let executor = PlanExecutor::new(&client, "secret/sandbox/demo");
    let summary = executor
        .execute(PlanAction::Renew, &plans, &mut NullSink)
        .unwrap();
    assert_eq!(summary.skipped, 1);
    assert!(
        store.safe.invocations.lock().unwrap().is_empty(),
        "renew on rsa must emit no store commands"
    );
}

#[test]
fn fixed_random_survives_repeated_rotation() {
    let meta = metadata(
        r#"
credentials:
  base:
    app/users:
      token: random 16 fixed
"#,
    );
    let plans = plans_for(&meta, &[], &ParseOptions::new()).unwrap();
    let store = TestStore::new();
    let client = store.client();
    let executor = PlanExecutor::new(&client, "secret/sandbox/demo");

    executor
        .execute(PlanAction::Add, &plans, &mut NullSink)
        .unwrap();
    let before = store.safe.value("secret/sandbox/demo/app/users", "token");
    let summary = executor
        .execute(PlanAction::Recreate, &plans, &mut NullSink)
        .unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(
        store.safe.value("secret/sandbox/demo/app/users", "token"),
        before,
        "fixed secrets must not change on rotation"
    );
}

#[test]
fn removal_clears_both_halves_of_formatted_random_secrets() {
    let meta = metadata(
        r#"
credentials:
  base:
    app/users:
      pass: random 32 fmt base64
"#,
    );
    let plans = plans_for(&meta, &[], &ParseOptions::new()).unwrap();
    let store = TestStore::new();
    let client = store.client();
    let executor = PlanExecutor::new(&client, "secret/sandbox/demo");
    executor
        .execute(PlanAction::Add, &plans, &mut NullSink)
        .unwrap();
    assert!(store.safe.value("secret/sandbox/demo/app/users", "pass").is_some());

    executor
        .execute(PlanAction::Remove, &plans, &mut NullSink)
        .unwrap();
    assert!(store.safe.value("secret/sandbox/demo/app/users", "pass").is_none());
    assert!(
        store
            .safe
            .value("secret/sandbox/demo/app/users", "pass-base64")
            .is_none()
    );
}
