//! End-to-end behavior of the call engine: two or more engines wired through
//! recording stanza senders, with stanzas relayed by hand so each test
//! controls the interleaving.

use std::time::Duration;

use crate::calls::{CallStanzaBuilder, MediaError, MediaQuery, SignalingType};
use crate::config::RtcConfig;
use crate::stanza::{Jid, Node, NodeBuilder};
use crate::stats::{StatsOptions, StatsSample};
use crate::test_utils::{TestEngine, settle};
use crate::types::events::Event;
use crate::types::{AnswerError, AvFlags, CallType, EntryKind, SessionId, TermCode};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn attr(node: &Node, key: &str) -> Option<String> {
    node.attrs.get(key).map(|v| v.to_string_value())
}

async fn relay(nodes: Vec<Node>, to: &[&TestEngine]) {
    for node in nodes {
        for engine in to {
            let _ = engine.engine.handle_stanza(node.clone()).await;
        }
    }
    settle().await;
}

/// Drive a call from `alice` to `bob` until both sides hold a session.
async fn establish(alice: &TestEngine, bob: &TestEngine, media: AvFlags) -> SessionId {
    let call = alice
        .engine
        .start_call(&bob.jid.to_string(), media, None, None)
        .await
        .unwrap();
    settle().await;
    alice.deliver_to(bob).await;

    let incoming = bob.events.incoming();
    let handle = incoming.last().unwrap().handle.clone();
    handle.answer(true, media, None, None).await.unwrap();
    settle().await;
    bob.deliver_to(alice).await;

    bob.engine
        .session_initiated(call.sid(), media)
        .await
        .unwrap();
    call.sid().clone()
}

#[tokio::test(start_paused = true)]
async fn test_answered_call_creates_exactly_one_session() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");

    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO_VIDEO, None, None)
        .await
        .unwrap();
    settle().await;

    assert_eq!(call.sid().as_str().len(), 16);
    let invites = alice.sender.sent_of_type(SignalingType::Invite);
    assert_eq!(invites.len(), 1);
    assert_eq!(attr(&invites[0], "media").as_deref(), Some("av"));
    assert!(attr(&invites[0], "fprmackey").is_some());
    assert!(attr(&invites[0], "anonid").is_some());

    alice.deliver_to(&bob).await;
    let incoming = bob.events.incoming();
    assert_eq!(incoming.len(), 1);
    assert_eq!(&incoming[0].sid, call.sid());
    assert_eq!(incoming[0].caller, alice.jid);
    incoming[0]
        .handle
        .answer(true, AvFlags::AUDIO_VIDEO, None, None)
        .await
        .unwrap();
    settle().await;
    bob.deliver_to(&alice).await;

    assert_eq!(
        alice.events.count(|e| matches!(e, Event::SessionCreated(_))),
        1
    );
    assert_eq!(alice.events.count(|e| matches!(e, Event::CallDeclined(_))), 0);
    assert_eq!(
        alice.events.count(|e| matches!(e, Event::CallAnswerTimeout(_))),
        0
    );
    assert_eq!(alice.media.initiated().len(), 1);
    assert!(alice.media.initiated()[0].is_caller);

    // the answer timer was disarmed
    tokio::time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert!(alice.events.ended_for(call.sid()).is_empty());
    assert!(alice.sender.sent_of_type(SignalingType::Cancel).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_local_media_sends_no_invite() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let gate = alice.media.hold_capture();

    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    assert_eq!(alice.media.open_count(), 1);

    assert!(call.cancel().await);
    gate.notify_one();
    settle().await;

    assert!(alice.sender.sent().is_empty());
    let ended = alice.events.ended_for(call.sid());
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].kind, EntryKind::Request);
    assert_eq!(ended[0].termination.code(), TermCode::CallReqCancel);
    assert!(!ended[0].termination.by_peer());

    let status = alice.engine.local_media_status().await.unwrap();
    assert_eq!(status.total_refs, 0);
    assert_eq!(status.capture, None);
    assert_eq!(alice.media.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_ringing_sends_one_notice_and_releases_media() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let before = alice.engine.local_media_status().await.unwrap();

    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO_VIDEO, None, None)
        .await
        .unwrap();
    settle().await;
    let ringing = alice.engine.local_media_status().await.unwrap();
    assert_eq!(ringing.total_refs, 1);
    assert_eq!(ringing.video_refs, 1);
    assert!(ringing.video_attached);

    assert!(call.cancel().await);
    assert!(!call.cancel().await);

    let cancels = alice.sender.sent_of_type(SignalingType::Cancel);
    assert_eq!(cancels.len(), 1);
    assert_eq!(attr(&cancels[0], "reason").as_deref(), Some("caller"));
    assert_eq!(attr(&cancels[0], "to").as_deref(), Some("bob@example.com"));

    let after = alice.engine.local_media_status().await.unwrap();
    assert_eq!(after.total_refs, before.total_refs);
    assert_eq!(after.video_refs, before.video_refs);
    assert!(!after.video_attached);
    assert_eq!(alice.events.ended_for(call.sid()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_answer_after_timeout_is_ignored() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");

    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    alice.deliver_to(&bob).await;
    let handle = bob.events.incoming()[0].handle.clone();
    handle.answer(true, AvFlags::AUDIO, None, None).await.unwrap();
    settle().await;

    // bob's answer is held back until the timer has fired
    tokio::time::sleep(Duration::from_secs(51)).await;
    settle().await;
    assert_eq!(
        alice.events.count(|e| matches!(e, Event::CallAnswerTimeout(_))),
        1
    );
    let cancels = alice.sender.sent_of_type(SignalingType::Cancel);
    assert_eq!(cancels.len(), 1);
    assert_eq!(attr(&cancels[0], "reason").as_deref(), Some("answer-timeout"));

    bob.deliver_to(&alice).await;
    assert_eq!(
        alice.events.count(|e| matches!(e, Event::SessionCreated(_))),
        0
    );
    assert!(alice.media.initiated().is_empty());
    let ended = alice.events.ended_for(call.sid());
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].termination.code(), TermCode::AnswerTimeout);

    // the late cancel reaches bob and ends that side as a peer timeout
    alice.deliver_to(&bob).await;
    let bob_ended = bob.events.ended_for(call.sid());
    assert_eq!(bob_ended.len(), 1);
    assert_eq!(bob_ended[0].termination.code(), TermCode::AnswerTimeout);
    assert!(bob_ended[0].termination.by_peer());
    assert!(!handle.is_still_valid());
}

#[tokio::test(start_paused = true)]
async fn test_decline_reports_reason_and_releases_media() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");

    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO_VIDEO, None, None)
        .await
        .unwrap();
    settle().await;
    let ringing = alice.engine.local_media_status().await.unwrap();

    alice.deliver_to(&bob).await;
    let handle = bob.events.incoming()[0].handle.clone();
    handle
        .answer(false, AvFlags::NONE, Some("busy".to_string()), None)
        .await
        .unwrap();
    bob.deliver_to(&alice).await;

    let declined: Vec<_> = alice
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::CallDeclined(d) => Some(d),
            _ => None,
        })
        .collect();
    assert_eq!(declined.len(), 1);
    assert_eq!(declined[0].reason.as_deref(), Some("busy"));
    assert_eq!(
        alice.events.count(|e| matches!(e, Event::CallAnswerTimeout(_))),
        0
    );

    let after = alice.engine.local_media_status().await.unwrap();
    assert_eq!(after.total_refs, ringing.total_refs - 1);

    let ended = alice.events.ended_for(call.sid());
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].termination.code(), TermCode::CallReqCancel);
    assert!(ended[0].termination.by_peer());

    let bob_ended = bob.events.ended_for(call.sid());
    assert_eq!(bob_ended.len(), 1);
    assert!(!bob_ended[0].termination.by_peer());
}

#[tokio::test(start_paused = true)]
async fn test_bare_invite_answered_on_one_device_stops_the_other() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob_a = TestEngine::spawn("bob@example.com/deviceA");
    let bob_b = TestEngine::spawn("bob@example.com/deviceB");

    let call = alice
        .engine
        .start_call("bob@example.com", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    relay(alice.sender.take(), &[&bob_a, &bob_b]).await;

    let handle_a = bob_a.events.incoming()[0].handle.clone();
    let handle_b = bob_b.events.incoming()[0].handle.clone();
    handle_a
        .answer(true, AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    bob_a.deliver_to(&alice).await;

    let handled = alice.sender.sent_of_type(SignalingType::CallHandled);
    assert_eq!(handled.len(), 1);
    assert_eq!(attr(&handled[0], "to").as_deref(), Some("bob@example.com"));
    assert_eq!(
        attr(&handled[0], "by").as_deref(),
        Some("bob@example.com/deviceA")
    );
    assert_eq!(attr(&handled[0], "accepted").as_deref(), Some("1"));

    relay(alice.sender.take(), &[&bob_a, &bob_b]).await;

    let b_ended = bob_b.events.ended_for(call.sid());
    assert_eq!(b_ended.len(), 1);
    assert_eq!(b_ended[0].termination.code(), TermCode::AnsweredElsewhere);
    assert!(!handle_b.is_still_valid());
    assert_eq!(
        handle_b.answer(true, AvFlags::AUDIO, None, None).await,
        Err(AnswerError::AlreadyCanceled)
    );
    // device B never touched its capture devices
    assert_eq!(bob_b.media.open_count(), 0);

    assert!(bob_a.events.ended_for(call.sid()).is_empty());
    bob_a
        .engine
        .session_initiated(call.sid(), AvFlags::AUDIO)
        .await
        .unwrap();
    assert_eq!(
        bob_a.events.count(|e| matches!(e, Event::SessionCreated(_))),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_device_answer_is_ignored() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob_a = TestEngine::spawn("bob@example.com/deviceA");
    let bob_b = TestEngine::spawn("bob@example.com/deviceB");

    let call = alice
        .engine
        .start_call("bob@example.com", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    relay(alice.sender.take(), &[&bob_a, &bob_b]).await;

    for bob in [&bob_a, &bob_b] {
        let handle = bob.events.incoming()[0].handle.clone();
        handle.answer(true, AvFlags::AUDIO, None, None).await.unwrap();
    }
    settle().await;
    bob_a.deliver_to(&alice).await;
    bob_b.deliver_to(&alice).await;

    assert_eq!(
        alice.events.count(|e| matches!(e, Event::SessionCreated(_))),
        1
    );
    let peer = alice
        .engine
        .sent_media(MediaQuery::Peer("bob@example.com".parse().unwrap()))
        .await
        .unwrap();
    assert_eq!(peer, AvFlags::AUDIO);
    assert!(alice.events.ended_for(call.sid()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_one_terminal_event_when_cancel_races_decline() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");

    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    alice.deliver_to(&bob).await;
    bob.events.incoming()[0]
        .handle
        .answer(false, AvFlags::NONE, None, None)
        .await
        .unwrap();

    assert!(call.cancel().await);
    bob.deliver_to(&alice).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;

    assert_eq!(alice.events.ended_for(call.sid()).len(), 1);
    assert_eq!(alice.events.count(|e| matches!(e, Event::CallDeclined(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hangup_all_covers_a_snapshot() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");

    let first = alice
        .engine
        .start_call("carol@example.com/phone", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    alice.sender.take();
    let established = establish(&alice, &bob, AvFlags::AUDIO).await;
    settle().await;

    let count = alice
        .engine
        .hangup_all(CallType::Any, TermCode::UserHangup, None)
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(alice.events.ended_for(first.sid()).len(), 1);
    assert_eq!(alice.events.ended_for(&established).len(), 1);
    assert_eq!(alice.media.terminated().len(), 1);

    let later = alice
        .engine
        .start_call("dave@example.com/tablet", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    assert!(alice.events.ended_for(later.sid()).is_empty());

    let status = alice.engine.local_media_status().await.unwrap();
    assert_eq!(status.total_refs, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hangup_by_peer_matches_bare_and_full_addresses() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");

    for target in [
        "bob@example.com/deviceA",
        "bob@example.com/deviceB",
        "carol@example.com/phone",
    ] {
        alice
            .engine
            .start_call(target, AvFlags::AUDIO, None, None)
            .await
            .unwrap();
    }
    settle().await;

    let full: Jid = "bob@example.com/deviceB".parse().unwrap();
    let count = alice
        .engine
        .hangup_by_peer(&full, CallType::Any, TermCode::UserHangup, None)
        .await
        .unwrap();
    assert_eq!(count, 1);

    let bare: Jid = "bob@example.com".parse().unwrap();
    let count = alice
        .engine
        .hangup_by_peer(&bare, CallType::Any, TermCode::UserHangup, None)
        .await
        .unwrap();
    assert_eq!(count, 1);

    let count = alice
        .engine
        .hangup_by_peer(&bare, CallType::Any, TermCode::UserHangup, None)
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert_eq!(alice.events.ended().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hangup_filters_by_call_type() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");

    let media = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    let data = alice
        .engine
        .start_call(
            "bob@example.com/deviceA",
            AvFlags::AUDIO_VIDEO,
            Some(vec!["notes.txt".to_string()]),
            None,
        )
        .await
        .unwrap();
    settle().await;

    let invites = alice.sender.sent_of_type(SignalingType::Invite);
    let data_invite = invites
        .iter()
        .find(|n| attr(n, "sid").as_deref() == Some(data.sid().as_str()))
        .unwrap();
    assert_eq!(attr(data_invite, "media").as_deref(), Some("_"));
    assert_eq!(data_invite.get_children_by_tag("file").count(), 1);

    let count = alice
        .engine
        .hangup_by_sid(data.sid(), CallType::Media, TermCode::UserHangup, None)
        .await
        .unwrap();
    assert_eq!(count, 0);
    let count = alice
        .engine
        .hangup_all(CallType::Data, TermCode::UserHangup, None)
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert!(alice.events.ended_for(media.sid()).is_empty());

    // data calls have no answer timer
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(alice.events.ended_for(media.sid()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_share_one_capture() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let gate = alice.media.hold_capture();

    let one = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO_VIDEO, None, None)
        .await
        .unwrap();
    let two = alice
        .engine
        .start_call("carol@example.com/phone", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    assert_eq!(alice.media.open_count(), 1);

    gate.notify_one();
    settle().await;
    assert_eq!(alice.sender.sent_of_type(SignalingType::Invite).len(), 2);
    let status = alice.engine.local_media_status().await.unwrap();
    assert_eq!(status.total_refs, 2);
    assert_eq!(status.video_refs, 1);
    assert_eq!(alice.media.attach_count(), 1);

    assert!(one.cancel().await);
    let status = alice.engine.local_media_status().await.unwrap();
    assert_eq!(status.total_refs, 1);
    assert!(!status.video_attached);
    assert_eq!(alice.media.close_count(), 0);

    assert!(two.cancel().await);
    let status = alice.engine.local_media_status().await.unwrap();
    assert_eq!(status.total_refs, 0);
    assert_eq!(status.capture, None);
    assert_eq!(alice.media.close_count(), 1);
    assert_eq!(alice.media.detach_count(), 1);

    // a new call opens capture again
    alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    gate.notify_one();
    settle().await;
    assert_eq!(alice.media.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_video_call_after_audio_call_gets_camera() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");

    alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    assert_eq!(alice.media.opened_with(), vec![AvFlags::AUDIO_VIDEO]);
    assert_eq!(alice.media.attach_count(), 0);

    alice
        .engine
        .start_call("carol@example.com/phone", AvFlags::AUDIO_VIDEO, None, None)
        .await
        .unwrap();
    settle().await;

    let media: Vec<_> = alice
        .sender
        .sent_of_type(SignalingType::Invite)
        .iter()
        .map(|n| attr(n, "media"))
        .collect();
    assert_eq!(media, vec![Some("a".to_string()), Some("av".to_string())]);
    assert_eq!(alice.media.open_count(), 1);

    let status = alice.engine.local_media_status().await.unwrap();
    assert_eq!(status.total_refs, 2);
    assert_eq!(status.video_refs, 1);
    assert!(status.video_attached);
    assert_eq!(alice.media.attach_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_capture_failure_continues_without_media() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    alice
        .media
        .fail_capture(MediaError::NoDevice("no camera".to_string()));

    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO_VIDEO, None, None)
        .await
        .unwrap();
    settle().await;

    let fails: Vec<_> = alice
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::LocalMediaFail(f) => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(fails.len(), 1);
    assert!(fails[0].continued);

    let invites = alice.sender.sent_of_type(SignalingType::Invite);
    assert_eq!(invites.len(), 1);
    assert_eq!(attr(&invites[0], "media").as_deref(), Some("_"));
    assert!(alice.events.ended_for(call.sid()).is_empty());
    assert_eq!(alice.engine.local_media_status().await.unwrap().total_refs, 0);
}

#[tokio::test(start_paused = true)]
async fn test_capture_failure_without_continue_ends_request() {
    init_logging();
    let alice = TestEngine::spawn_with_config(
        "alice@example.com/laptop",
        RtcConfig {
            continue_without_local_media: false,
            ..Default::default()
        },
    );
    alice
        .media
        .fail_capture(MediaError::DeviceBusy("in use".to_string()));

    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;

    assert!(alice.sender.sent().is_empty());
    let ended = alice.events.ended_for(call.sid());
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].termination.code(), TermCode::NoMediaError);
}

#[tokio::test(start_paused = true)]
async fn test_downgraded_capture_is_reflected_in_invite() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    alice.media.set_available(AvFlags::AUDIO);

    alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO_VIDEO, None, None)
        .await
        .unwrap();
    settle().await;

    let invites = alice.sender.sent_of_type(SignalingType::Invite);
    assert_eq!(attr(&invites[0], "media").as_deref(), Some("a"));
    let status = alice.engine.local_media_status().await.unwrap();
    assert_eq!(status.video_refs, 0);
    assert!(!status.video_attached);
}

#[tokio::test(start_paused = true)]
async fn test_invite_send_failure_is_a_protocol_error() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    alice.sender.set_failing(true);

    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;

    let ended = alice.events.ended_for(call.sid());
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].termination.code(), TermCode::ProtoError);
    assert_eq!(alice.engine.local_media_status().await.unwrap().total_refs, 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_call_rejects_bad_targets() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");

    for target in ["", "no-domain@"] {
        let err = alice
            .engine
            .start_call(target, AvFlags::AUDIO, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::types::ResultCode::InvalidArgument);
    }
    assert!(alice.events.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_undecryptable_key_material_does_not_fail_the_call() {
    init_logging();
    let bob = TestEngine::spawn("bob@example.com/deviceA");
    let alice: Jid = "alice@example.com/laptop".parse().unwrap();
    let sid = SessionId::generate();

    let invite = CallStanzaBuilder::new(SignalingType::Invite, &sid, bob.jid.clone())
        .from(alice.clone())
        .fpr_mac_key("deadbeef")
        .anon_id("0011223344556677")
        .media(AvFlags::AUDIO)
        .build();
    bob.engine.handle_stanza(invite).await.unwrap();

    let incoming = bob.events.incoming();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].caller, alice);
    assert!(incoming[0].handle.is_still_valid());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_stanzas_are_rejected() {
    init_logging();
    let bob = TestEngine::spawn("bob@example.com/deviceA");

    let no_sid = NodeBuilder::new("message")
        .attr("type", "call-invite")
        .attr("from", "alice@example.com/laptop")
        .build();
    assert!(bob.engine.handle_stanza(no_sid).await.is_err());

    let unknown = NodeBuilder::new("message")
        .attr("type", "chat")
        .attr("sid", "abc")
        .attr("from", "alice@example.com/laptop")
        .build();
    assert!(bob.engine.handle_stanza(unknown).await.is_err());
    assert!(bob.events.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_accept_with_no_media_on_either_side_is_invalid() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");

    alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::NONE, None, None)
        .await
        .unwrap();
    settle().await;
    alice.deliver_to(&bob).await;

    let handle = bob.events.incoming()[0].handle.clone();
    let err = handle
        .answer(true, AvFlags::NONE, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AnswerError::InvalidArgument(_)));
    // still ringing
    assert!(handle.is_still_valid());
    handle
        .answer(false, AvFlags::NONE, None, None)
        .await
        .unwrap();
    assert!(!handle.is_still_valid());
}

#[tokio::test(start_paused = true)]
async fn test_media_queries_distinguish_not_found_and_no_stream() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");
    let sid = establish(&alice, &bob, AvFlags::AUDIO_VIDEO).await;

    let sent = alice
        .engine
        .sent_media(MediaQuery::Sid(sid.clone()))
        .await
        .unwrap();
    assert_eq!(sent, AvFlags::AUDIO_VIDEO);

    let err = alice
        .engine
        .received_media(MediaQuery::Sid(sid.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), crate::types::ResultCode::NoStream);

    alice
        .engine
        .remote_stream_changed(&sid, Some(AvFlags::AUDIO))
        .await
        .unwrap();
    let received = alice
        .engine
        .received_media(MediaQuery::Peer(bob.jid.clone()))
        .await
        .unwrap();
    assert_eq!(received, AvFlags::AUDIO);

    let err = alice
        .engine
        .sent_media(MediaQuery::Sid(SessionId::from("missing")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), crate::types::ResultCode::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_fingerprint_mismatch_ends_the_session() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");
    let sid = establish(&alice, &bob, AvFlags::AUDIO).await;

    let fingerprint = "sha-256 AB:CD:EF";
    let mac = alice.engine.fingerprint_mac(&sid, fingerprint).await.unwrap();
    assert!(
        bob.engine
            .verify_peer_fingerprint(&sid, fingerprint, &mac)
            .await
            .unwrap()
    );

    let forged = bob.engine.fingerprint_mac(&sid, fingerprint).await.unwrap();
    assert!(
        !alice
            .engine
            .verify_peer_fingerprint(&sid, "sha-256 00:00:00", &forged)
            .await
            .unwrap()
    );
    let ended = alice.events.ended_for(&sid);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].termination.code(), TermCode::FprVerifFail);
    assert_eq!(
        ended[0].text.as_deref(),
        Some("fingerprint verification failed")
    );
}

#[tokio::test(start_paused = true)]
async fn test_stats_are_finalized_and_uploaded() {
    init_logging();
    let alice = TestEngine::spawn_with_config(
        "alice@example.com/laptop",
        RtcConfig {
            stats_url: Some("https://stats.example.com/rtc".to_string()),
            ..Default::default()
        },
    );
    let bob = TestEngine::spawn("bob@example.com/deviceA");
    let sid = establish(&alice, &bob, AvFlags::AUDIO).await;

    let err = alice
        .engine
        .record_stats_sample(&sid, StatsSample::default())
        .await
        .unwrap_err();
    assert!(matches!(err, crate::calls::CallError::NoStats(_)));

    alice
        .engine
        .media_started(
            &sid,
            StatsOptions {
                enable: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let kept = alice
        .engine
        .record_stats_sample(
            &sid,
            StatsSample {
                ts_ms: 0,
                rtt_ms: 40,
                is_relay: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(kept);
    assert!(alice.engine.is_relay(&sid).await.unwrap());

    alice
        .engine
        .hangup_by_sid(&sid, CallType::Any, TermCode::UserHangup, None)
        .await
        .unwrap();
    settle().await;

    let ended = alice.events.ended_for(&sid);
    assert_eq!(ended.len(), 1);
    assert!(ended[0].stats.is_full());
    assert_eq!(alice.http.request_count(), 1);
    let request = alice.http.last_request().unwrap();
    assert_eq!(request.url, "https://stats.example.com/rtc");
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_ends_everything_without_notices() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");
    let sid = establish(&alice, &bob, AvFlags::AUDIO).await;
    alice
        .engine
        .start_call("carol@example.com/phone", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;
    alice.sender.take();

    assert_eq!(alice.engine.connection_lost().await.unwrap(), 2);
    assert!(alice.sender.sent().is_empty());
    let ended = alice.events.ended_for(&sid);
    assert_eq!(ended[0].termination.code(), TermCode::XmppDisconnError);
    assert!(!ended[0].termination.by_peer());
    assert_eq!(alice.engine.local_media_status().await.unwrap().total_refs, 0);
}

#[tokio::test(start_paused = true)]
async fn test_peer_presence_loss_ends_only_its_sessions() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let bob = TestEngine::spawn("bob@example.com/deviceA");
    let carol = TestEngine::spawn("carol@example.com/phone");
    let with_bob = establish(&alice, &bob, AvFlags::AUDIO).await;
    let with_carol = establish(&alice, &carol, AvFlags::AUDIO).await;

    let presence = NodeBuilder::new("presence")
        .attr("type", "unavailable")
        .attr("from", "bob@example.com/deviceA")
        .build();
    alice.engine.handle_stanza(presence).await.unwrap();

    let ended = alice.events.ended_for(&with_bob);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].termination.code(), TermCode::XmppDisconnError);
    assert!(ended[0].termination.by_peer());
    assert_eq!(ended[0].text.as_deref(), Some("peer-disconnected"));
    assert!(alice.events.ended_for(&with_carol).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_terminates_calls_and_stops_the_engine() {
    init_logging();
    let alice = TestEngine::spawn("alice@example.com/laptop");
    let call = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap();
    settle().await;

    assert_eq!(alice.engine.shutdown().await.unwrap(), 1);
    let ended = alice.events.ended_for(call.sid());
    assert_eq!(ended[0].termination.code(), TermCode::AppTerminating);
    assert_eq!(alice.sender.sent_of_type(SignalingType::Cancel).len(), 1);

    let err = alice
        .engine
        .start_call("bob@example.com/deviceA", AvFlags::AUDIO, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, crate::calls::CallError::EngineStopped));
    assert!(!call.cancel().await);
}
