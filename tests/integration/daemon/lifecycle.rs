//! Starting, serving and stopping a daemon.

use std::thread;
use std::time::Duration;

use serde_json::json;

use endo_daemon::core::{FormulaType, parse_locator};
use endo_daemon::daemon::{DaemonClient, run_daemon};

use crate::fixtures::rig::{DaemonRig, MAX_FRAME_BYTES, rooted_config, sock_path};

#[test]
fn store_survives_restart() {
    let mut rig = DaemonRig::start();
    let client = rig.client();
    let stored = client.store(b"hello, world", Some("greeting")).unwrap();
    assert_eq!(stored["@type"], "readable-blob");
    let node = rig.daemon.node().clone();
    drop(client);

    rig.restart();
    assert_eq!(rig.daemon.node(), &node);
    let client = rig.client();
    assert_eq!(client.text("greeting").unwrap(), "hello, world");
    assert_eq!(client.list().unwrap(), vec!["greeting".to_string()]);
}

#[test]
fn blobs_larger_than_a_frame_upload_in_chunks() {
    let rig = DaemonRig::start();
    let client = rig.client();
    // Too big to send as hex in one frame, small enough to read back in one.
    let text: String = "0123456789abcdef".repeat(MAX_FRAME_BYTES / 16 * 5 / 8);
    assert!(text.len() * 2 > MAX_FRAME_BYTES && text.len() < MAX_FRAME_BYTES);

    let stored = client.store(text.as_bytes(), Some("large")).unwrap();
    assert_eq!(stored["sha512"], endo_daemon::core::sha512_bytes(text.as_bytes()).to_hex());
    assert_eq!(client.text("large").unwrap(), text);
    let blobs = std::fs::read_dir(rig.paths().content_dir()).unwrap().count();
    assert_eq!(blobs, 1);
}

#[test]
fn identical_content_is_stored_once() {
    let rig = DaemonRig::start();
    let client = rig.client();
    let a = client.store(b"twice", Some("a")).unwrap();
    let b = client.store(b"twice", Some("b")).unwrap();
    assert_eq!(a["sha512"], b["sha512"]);
    let blobs = std::fs::read_dir(rig.paths().content_dir()).unwrap().count();
    assert_eq!(blobs, 1);
    assert_eq!(client.locate("a").unwrap(), client.locate("b").unwrap());
}

#[test]
fn tampered_blob_reports_integrity_failure() {
    let rig = DaemonRig::start();
    let client = rig.client();
    let stored = client.store(b"original", Some("doc")).unwrap();
    let digest = stored["sha512"].as_str().unwrap().to_string();
    std::fs::write(rig.paths().content_dir().join(&digest), b"changed").unwrap();

    let err = client.text("doc").unwrap_err();
    assert_eq!(err.code(), "remote");
    let payload = err.to_payload();
    assert_eq!(payload.code, "integrity_failure");
    assert_eq!(payload.details.unwrap()["expected"], digest.as_str());
}

#[test]
fn invalid_names_are_rejected_without_writing() {
    let rig = DaemonRig::start();
    let client = rig.client();
    let err = client.store(b"x", Some("Not-Valid")).unwrap_err();
    assert_eq!(err.to_payload().code, "invalid_name");
    assert!(client.list().unwrap().is_empty());
}

#[test]
fn locators_resolve_back_to_the_value() {
    let rig = DaemonRig::start();
    let client = rig.client();
    client
        .evaluate("MAIN", "{\"answer\": 42}", &[], &[], Some("config"))
        .unwrap();
    let locator = client.locate("config").unwrap();
    let parsed = parse_locator(&locator).unwrap();
    assert_eq!(parsed.node(), rig.daemon.node());
    assert_eq!(parsed.formula_type, FormulaType::Eval);
    assert_eq!(client.provide(&locator).unwrap(), json!({ "answer": 42 }));
}

#[test]
fn pet_names_can_be_renamed_and_removed() {
    let rig = DaemonRig::start();
    let client = rig.client();
    client.store(b"1", Some("one")).unwrap();
    client.rename("one", "uno").unwrap();
    assert_eq!(client.text("uno").unwrap(), "1");
    client.remove("uno").unwrap();
    let err = client.text("uno").unwrap_err();
    assert_eq!(err.to_payload().code, "unknown_reference");
}

#[test]
fn guests_and_child_hosts_are_named() {
    let rig = DaemonRig::start();
    let client = rig.client();
    let guest = client.provide_guest(Some("visitor")).unwrap();
    assert_eq!(guest["@type"], "guest");
    let host = client.provide_host(Some("child")).unwrap();
    assert_eq!(host["@type"], "host");
    assert_eq!(
        client.list().unwrap(),
        vec!["child".to_string(), "visitor".to_string()]
    );
}

#[test]
fn run_daemon_serves_the_socket_until_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let config = rooted_config(&dir);
    let handle = {
        let config = config.clone();
        thread::spawn(move || run_daemon(&config))
    };

    let sock = sock_path(&dir);
    let client = DaemonClient::connect_with_retry(&sock, MAX_FRAME_BYTES, Duration::from_secs(10))
        .unwrap();
    assert_eq!(client.ping().unwrap(), json!("pong"));

    let pid_path = dir.path().join("run").join("endo.pid");
    let pid = std::fs::read_to_string(&pid_path).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());

    client.terminate().unwrap();
    handle.join().unwrap().unwrap();
    assert!(!pid_path.exists());
    assert!(!sock.exists());
    assert!(client.closed().wait_timeout(Duration::from_secs(5)).is_some());
}
