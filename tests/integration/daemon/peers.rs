//! Two daemons reaching each other's values over TCP.

use serde_json::json;

use crate::fixtures::rig::DaemonRig;

#[test]
fn provide_a_value_from_a_peer() {
    let alice = DaemonRig::start();
    let bob = DaemonRig::start();
    let alice_addr = alice.listen_for_peers();
    bob.listen_for_peers();

    let alice_client = alice.client();
    alice_client
        .evaluate("MAIN", "{\"greeting\": \"hi bob\"}", &[], &[], Some("note"))
        .unwrap();
    let locator = alice_client.locate("note").unwrap();

    let bob_client = bob.client();
    bob_client
        .add_peer("alice", alice.daemon.node(), &[alice_addr])
        .unwrap();
    assert_eq!(bob_client.provide(&locator).unwrap(), json!({ "greeting": "hi bob" }));
    // Served from the memoized remote value the second time.
    assert_eq!(bob_client.provide(&locator).unwrap(), json!({ "greeting": "hi bob" }));
}

#[test]
fn blobs_from_a_peer_arrive_as_descriptors() {
    let alice = DaemonRig::start();
    let bob = DaemonRig::start();
    let alice_addr = alice.listen_for_peers();

    let alice_client = alice.client();
    let stored = alice_client.store(b"shared text", Some("doc")).unwrap();
    let locator = alice_client.locate("doc").unwrap();

    let bob_client = bob.client();
    bob_client
        .add_peer("alice", alice.daemon.node(), &[alice_addr])
        .unwrap();
    let seen = bob_client.provide(&locator).unwrap();
    assert_eq!(seen["@type"], "readable-blob");
    assert_eq!(seen["sha512"], stored["sha512"]);
}

#[test]
fn unknown_node_is_refused() {
    let alice = DaemonRig::start();
    let bob = DaemonRig::start();
    let alice_client = alice.client();
    alice_client.store(b"private", Some("doc")).unwrap();
    let locator = alice_client.locate("doc").unwrap();

    let err = bob.client().provide(&locator).unwrap_err();
    assert_eq!(err.to_payload().code, "connection_refused");
}

#[test]
fn peers_cannot_name_this_node() {
    let alice = DaemonRig::start();
    let err = alice
        .client()
        .add_peer("me", alice.daemon.node(), &["tcp://127.0.0.1:1".to_string()])
        .unwrap_err();
    assert_eq!(err.to_payload().code, "connection_refused");
}
