use callbridge::signal::{NameLookupState, NameRegistrationState};
use callbridge_daemon::{AccountDetails, BridgeError, NativeDaemon};
use callbridge_tests::harness::server::TestServer;

#[tokio::test]
async fn names_resolve_in_both_directions() {
    let server = TestServer::spawn().await.unwrap();
    let alice = server.account("alice").await.unwrap();

    let forward = server.bridge().lookup_name(None, "ALICE").await.unwrap();
    assert!(forward.is_found());
    assert_eq!(forward.address, alice.uri);

    let reverse = server
        .bridge()
        .lookup_address(Some(&alice.id), &alice.uri)
        .await
        .unwrap();
    assert_eq!(reverse.state, NameLookupState::Found);
    assert_eq!(reverse.username, "alice");

    let missing = server.bridge().lookup_name(None, "nobody").await.unwrap();
    assert_eq!(missing.state, NameLookupState::NotFound);
}

#[tokio::test]
async fn taken_name_is_reported_for_the_right_account() {
    let server = TestServer::spawn().await.unwrap();
    server.account("alice").await.unwrap();

    let bridge = server.bridge();
    let other = bridge
        .add_account(&AccountDetails::new_jami("impostor"))
        .await
        .unwrap();
    match bridge.register_name(&other, "", "alice").await {
        Err(BridgeError::NameRegistration {
            account_id, state, ..
        }) => {
            assert_eq!(account_id, other);
            assert_eq!(state, NameRegistrationState::AlreadyTaken);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_account_creation_resolves_each_request() {
    let server = TestServer::spawn().await.unwrap();
    let bridge = server.bridge();

    let (first, second, third) = (
        AccountDetails::new_jami("a"),
        AccountDetails::new_jami("b"),
        AccountDetails::new_jami("c"),
    );
    let (a, b, c) = tokio::join!(
        bridge.add_account(&first),
        bridge.add_account(&second),
        bridge.add_account(&third),
    );
    let mut ids = vec![a.unwrap(), b.unwrap(), c.unwrap()];
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    let mut known = server.daemon.account_ids();
    known.sort();
    assert_eq!(known, ids);
}

#[tokio::test]
async fn nameserver_outage_fails_fast() {
    let server = TestServer::spawn().await.unwrap();
    let alice = server.account("alice").await.unwrap();
    server.daemon.set_nameserver_available(false);

    assert!(matches!(
        server.bridge().lookup_name(None, "alice").await,
        Err(BridgeError::NoNameserver)
    ));
    assert!(matches!(
        server.bridge().register_name(&alice.id, "", "alice2").await,
        Err(BridgeError::NoNameserver)
    ));
}
