use callbridge_call::testing::FakePeer;
use callbridge_call::{CallError, CallRole, CallStatus, MediaError, StartCall, TrackKind};
use callbridge_tests::harness::client::CallClient;
use callbridge_tests::harness::server::{TestAccount, TestServer};
use callbridge_tests::harness::{WAIT, eventually};
use std::time::Duration;

struct Pair {
    server: TestServer,
    alice: TestAccount,
    bob: TestAccount,
    conversation: String,
    alice_call: CallClient,
    bob_call: CallClient,
}

async fn pair() -> Pair {
    let server = TestServer::spawn().await.unwrap();
    let alice = server.account("alice").await.unwrap();
    let bob = server.account("bob").await.unwrap();
    let conversation = server.conversation(&alice, &[&bob]).unwrap();

    let alice_call = CallClient::connect(&server.ws_url(&alice), "alice")
        .await
        .unwrap();
    let bob_call = CallClient::connect(&server.ws_url(&bob), "bob")
        .await
        .unwrap();
    server.wait_for_sockets(2).await.unwrap();

    Pair {
        server,
        alice,
        bob,
        conversation,
        alice_call,
        bob_call,
    }
}

fn call(conversation: &str, to: &TestAccount, with_video: bool) -> StartCall {
    StartCall {
        conversation_id: conversation.to_string(),
        contact_id: to.uri.clone(),
        with_video,
    }
}

/// Ring bob from alice and let bob answer, until both are in the call.
async fn connect_call(p: &mut Pair, with_video: bool) {
    p.alice_call
        .handle
        .start_call(call(&p.conversation, &p.bob, with_video))
        .await
        .unwrap();
    p.bob_call.wait_for(CallStatus::Ringing, WAIT).await.unwrap();
    p.bob_call.handle.accept_call().await.unwrap();
    p.alice_call.wait_for(CallStatus::InCall, WAIT).await.unwrap();
    p.bob_call.wait_for(CallStatus::InCall, WAIT).await.unwrap();
}

#[tokio::test]
async fn call_connects_and_ends_through_server() {
    let mut p = pair().await;

    p.alice_call
        .handle
        .start_call(call(&p.conversation, &p.bob, true))
        .await
        .unwrap();
    let caller = p.alice_call.wait_for(CallStatus::Ringing, WAIT).await.unwrap();
    assert_eq!(caller.role, CallRole::Caller);

    // The server rewrites contactId so bob sees who is calling.
    let ringing = p.bob_call.wait_for(CallStatus::Ringing, WAIT).await.unwrap();
    assert_eq!(ringing.role, CallRole::Receiver);
    assert_eq!(ringing.contact_id, p.alice.uri);
    assert_eq!(ringing.conversation_id, p.conversation);
    assert!(ringing.with_video);

    p.bob_call.handle.accept_call().await.unwrap();
    let alice_in_call = p.alice_call.wait_for(CallStatus::InCall, WAIT).await.unwrap();
    let bob_in_call = p.bob_call.wait_for(CallStatus::InCall, WAIT).await.unwrap();
    assert_eq!(alice_in_call.local_tracks.len(), 2);
    assert_eq!(bob_in_call.local_tracks.len(), 2);

    // Every gathered candidate crosses the server and is applied once.
    let alice_factory = p.alice_call.factory.clone();
    let bob_factory = p.bob_call.factory.clone();
    assert!(
        eventually(WAIT, || {
            alice_factory.last().unwrap().applied_candidates.len() == FakePeer::CANDIDATES
                && bob_factory.last().unwrap().applied_candidates.len() == FakePeer::CANDIDATES
        })
        .await
    );
    let alice_peer = alice_factory.last().unwrap();
    assert!(alice_peer.remote.unwrap().sdp.contains("o=bob answer"));
    assert!(bob_factory.last().unwrap().remote.unwrap().sdp.contains("o=alice offer"));

    p.alice_call.handle.end_call().await.unwrap();
    p.alice_call.wait_for(CallStatus::Ended, WAIT).await.unwrap();
    p.bob_call.wait_for(CallStatus::Ended, WAIT).await.unwrap();
    assert!(alice_factory.last().unwrap().closed);
    let bob_media = p.bob_call.media.clone();
    assert!(eventually(WAIT, || bob_media.released().len() == 2).await);
}

#[tokio::test]
async fn audio_only_call_sends_no_video() {
    let mut p = pair().await;
    connect_call(&mut p, false).await;

    let session = p.bob_call.session().unwrap();
    assert!(!session.with_video);
    assert!(session.local_tracks.iter().all(|t| t.kind == TrackKind::Audio));
}

#[tokio::test]
async fn refused_media_ends_the_call_on_both_sides() {
    let mut p = pair().await;
    p.bob_call.media.deny_permission(true);

    p.alice_call
        .handle
        .start_call(call(&p.conversation, &p.bob, true))
        .await
        .unwrap();
    p.bob_call.wait_for(CallStatus::Ringing, WAIT).await.unwrap();

    assert_eq!(
        p.bob_call.handle.accept_call().await.unwrap_err(),
        CallError::Media(MediaError::PermissionDenied)
    );
    p.bob_call
        .wait_for(CallStatus::PermissionDenied, WAIT)
        .await
        .unwrap();
    p.alice_call.wait_for(CallStatus::Ended, WAIT).await.unwrap();
    assert_eq!(p.bob_call.factory.created(), 0);
}

#[tokio::test]
async fn busy_receiver_ignores_second_caller() {
    let mut p = pair().await;
    connect_call(&mut p, true).await;

    let carol = p.server.account("carol").await.unwrap();
    let other = p.server.conversation(&carol, &[&p.bob]).unwrap();
    let mut carol_call = CallClient::connect(&p.server.ws_url(&carol), "carol")
        .await
        .unwrap();
    p.server.wait_for_sockets(3).await.unwrap();

    carol_call
        .handle
        .start_call(call(&other, &p.bob, false))
        .await
        .unwrap();
    carol_call.wait_for(CallStatus::Ringing, WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let session = p.bob_call.session().unwrap();
    assert_eq!(session.status, CallStatus::InCall);
    assert_eq!(session.contact_id, p.alice.uri);
    assert_eq!(carol_call.session().unwrap().status, CallStatus::Ringing);
}

#[tokio::test]
async fn second_call_while_calling_is_rejected_locally() {
    let mut p = pair().await;
    p.alice_call
        .handle
        .start_call(call(&p.conversation, &p.bob, false))
        .await
        .unwrap();
    p.alice_call.wait_for(CallStatus::Ringing, WAIT).await.unwrap();

    let err = p
        .alice_call
        .handle
        .start_call(call(&p.conversation, &p.bob, false))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::SessionActive { .. }));
}

#[tokio::test]
async fn switching_microphone_mid_call_releases_the_old_one() {
    let mut p = pair().await;
    connect_call(&mut p, true).await;

    let before = p.bob_call.session().unwrap().local_tracks;
    let old_mic = before
        .iter()
        .find(|t| t.kind == TrackKind::Audio)
        .cloned()
        .unwrap();
    let new_mic = p.bob_call.media.another(TrackKind::Audio);
    p.bob_call.handle.switch_track(new_mic.clone()).await.unwrap();

    let media = p.bob_call.media.clone();
    assert!(eventually(WAIT, || media.released().contains(&old_mic)).await);
    let bob_call = &p.bob_call;
    assert!(
        eventually(WAIT, || bob_call
            .session()
            .is_some_and(|s| s.local_tracks.contains(&new_mic)))
        .await
    );
}

#[tokio::test]
async fn lost_connection_ends_the_call_locally() {
    let mut p = pair().await;
    connect_call(&mut p, false).await;

    p.bob_call.disconnect();
    p.bob_call.wait_for(CallStatus::Ended, WAIT).await.unwrap();
    p.server.wait_for_sockets(1).await.unwrap();
}
