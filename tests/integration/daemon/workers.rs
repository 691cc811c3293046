//! Workers through the client facet.

use serde_json::json;

use crate::fixtures::rig::DaemonRig;

#[test]
fn evaluate_binds_pet_names() {
    let rig = DaemonRig::start();
    let client = rig.client();
    client
        .evaluate("MAIN", "{\"port\": 8080, \"host\": \"localhost\"}", &[], &[], Some("cfg"))
        .unwrap();
    let port = client
        .evaluate("MAIN", "c.port", &["c"], &["cfg"], Some("port"))
        .unwrap();
    assert_eq!(port, json!(8080));
    assert_eq!(client.provide("port").unwrap(), json!(8080));
}

#[test]
fn arity_mismatch_is_reported_before_anything_runs() {
    let rig = DaemonRig::start();
    let client = rig.client();
    let err = client
        .evaluate("NEW", "a", &["a", "b"], &["x"], Some("out"))
        .unwrap_err();
    let payload = err.to_payload();
    assert_eq!(payload.code, "arity_mismatch");
    assert_eq!(payload.details.unwrap(), json!({ "names": 2, "values": 1 }));
    assert!(client.list().unwrap().is_empty());
}

#[test]
fn named_workers_can_be_terminated_and_revived() {
    let rig = DaemonRig::start();
    let client = rig.client();
    let worker = client.make_worker(Some("helper")).unwrap();
    assert_eq!(worker["@type"], "worker");

    assert_eq!(client.evaluate("helper", "[1]", &[], &[], None).unwrap(), json!([1]));
    client.terminate_worker("helper").unwrap();
    // The next use starts a fresh worker for the same formula.
    assert_eq!(client.evaluate("helper", "[2]", &[], &[], None).unwrap(), json!([2]));
}

#[test]
fn new_worker_per_evaluation() {
    let rig = DaemonRig::start();
    let client = rig.client();
    assert_eq!(client.evaluate("NEW", "\"fresh\"", &[], &[], None).unwrap(), json!("fresh"));
}

#[test]
fn bundles_run_with_their_powers() {
    let rig = DaemonRig::start();
    let client = rig.client();
    client.store(b"powers.motd", Some("app")).unwrap();
    client
        .evaluate("MAIN", "{\"motd\": \"welcome\"}", &[], &[], Some("caps"))
        .unwrap();
    let value = client.make_bundle("MAIN", "app", "caps", Some("running")).unwrap();
    assert_eq!(value, json!("welcome"));
    assert_eq!(client.provide("running").unwrap(), json!("welcome"));
}

#[test]
fn unknown_worker_name() {
    let rig = DaemonRig::start();
    let client = rig.client();
    let err = client.evaluate("nobody", "1", &[], &[], None).unwrap_err();
    assert_eq!(err.to_payload().code, "unknown_reference");
}
