//! Outgoing and incoming call flows, in-call controls and teardown

mod common;

use common::{peer_invite, peer_request, Harness, FAKE_ANSWER, FAKE_OFFER, PEER_CONTACT, PEER_SDP, PEER_TAG};
use std::sync::atomic::Ordering;
use std::time::Duration;
use wsphone::domain::{CallDirection, CallState, RegistrationState};
use wsphone::infrastructure::protocols::webrtc::{media_direction, MediaDirection, SdpKind};
use wsphone::EngineEvent;

#[tokio::test(start_paused = true)]
async fn test_outgoing_call_connects_with_single_ack() {
    let mut h = Harness::registered().await;

    h.engine.make_call("1001");
    h.wait_call_state(CallState::Calling).await;
    let info = h.engine.call_info().borrow().clone().expect("call info");
    assert_eq!(info.number, "1001");
    assert_eq!(info.direction, CallDirection::Outgoing);
    assert!(h.engine.audio_flags().borrow().in_call_audio);

    let invite = h.expect_request("INVITE").await;
    assert_eq!(invite.request_uri, "sip:1001@pbx.example.com");
    assert_eq!(invite.body, FAKE_OFFER);
    assert!(invite.header("from").unwrap().starts_with("\"Alice\" <sip:alice@pbx.example.com>;tag="));
    assert!(invite.to_tag().is_none());
    assert_eq!(invite.header("content-type"), Some("application/sdp"));

    h.reply(&invite, 100);
    h.send(h.response(&invite, 180));
    h.wait_call_state(CallState::Ringing).await;

    h.send(
        h.response(&invite, 200)
            .header("Contact", PEER_CONTACT)
            .body("application/sdp", PEER_SDP),
    );
    let ack = h.expect_request("ACK").await;
    assert_eq!(ack.call_id(), invite.call_id());
    assert_eq!(ack.cseq(), Some((invite.cseq().unwrap().0, "ACK".to_string())));
    assert_eq!(ack.to_tag().as_deref(), Some(PEER_TAG));
    assert_eq!(ack.request_uri, "sip:1001@10.0.0.2:5060;transport=ws");
    h.wait_call_state(CallState::Connected).await;
    h.assert_quiet().await;

    let remote = h.media.remote.lock().unwrap().clone();
    assert_eq!(remote, vec![(PEER_SDP.to_string(), SdpKind::Answer)]);
}

#[tokio::test(start_paused = true)]
async fn test_retransmitted_ok_is_reacked() {
    let mut h = Harness::registered().await;
    h.engine.make_call("1001");
    let invite = h.expect_request("INVITE").await;

    let ok = h
        .response(&invite, 200)
        .header("Contact", PEER_CONTACT)
        .body("application/sdp", PEER_SDP);
    h.send(ok.clone());
    h.expect_request("ACK").await;
    h.send(ok);
    h.expect_request("ACK").await;
    h.assert_quiet().await;
    assert_eq!(h.engine.snapshot().await.unwrap().call_state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_hangup_decays_to_idle_after_grace() {
    let mut h = Harness::registered().await;
    let invite = h.connected_outgoing_call("1001").await;

    h.engine.hangup_call();
    let bye = h.expect_request("BYE").await;
    assert_eq!(bye.call_id(), invite.call_id());
    assert_eq!(bye.to_tag().as_deref(), Some(PEER_TAG));
    assert_eq!(bye.request_uri, "sip:1001@10.0.0.2:5060;transport=ws");

    h.wait_call_state(CallState::Disconnected).await;
    assert!(h.engine.call_info().borrow().is_some());
    assert_eq!(*h.engine.audio_flags().borrow(), wsphone::AudioFlags::default());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(*h.engine.call_state().borrow(), CallState::Disconnected);

    h.wait_call_state(CallState::Idle).await;
    assert!(h.engine.call_info().borrow().is_none());
    assert_eq!(h.media.disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_ringing() {
    let mut h = Harness::registered().await;
    h.engine.make_call("1001");
    let invite = h.expect_request("INVITE").await;
    h.send(h.response(&invite, 180));
    h.wait_call_state(CallState::Ringing).await;

    h.engine.hangup_call();
    let cancel = h.expect_request("CANCEL").await;
    assert_eq!(cancel.header("via"), invite.header("via"));
    assert_eq!(cancel.cseq().unwrap().0, invite.cseq().unwrap().0);
    h.wait_call_state(CallState::Disconnected).await;

    // The 487 for the canceled INVITE is still ACKed
    h.reply(&invite, 487);
    let ack = h.expect_request("ACK").await;
    assert_eq!(ack.header("via"), invite.header("via"));
}

#[tokio::test(start_paused = true)]
async fn test_busy_response_ends_call() {
    let mut h = Harness::registered().await;
    h.engine.make_call("1001");
    let invite = h.expect_request("INVITE").await;

    h.reply(&invite, 486);
    h.expect_request("ACK").await;
    let ended = h
        .wait_event(Duration::from_secs(5), |e| matches!(e, EngineEvent::CallEnded { .. }))
        .await;
    assert!(matches!(ended, EngineEvent::CallEnded { ref reason, .. } if reason == "busy"));
    h.wait_call_state(CallState::Disconnected).await;
}

#[tokio::test(start_paused = true)]
async fn test_invite_challenge_is_answered() {
    let mut h = Harness::registered().await;
    h.engine.make_call("1001");
    let first = h.expect_request("INVITE").await;

    h.send(h.response(&first, 407).header(
        "Proxy-Authenticate",
        "Digest realm=\"pbx.example.com\", nonce=\"call-nonce\"",
    ));
    h.expect_request("ACK").await;

    let second = h.expect_request("INVITE").await;
    assert_eq!(second.call_id(), first.call_id());
    assert_eq!(second.from_tag(), first.from_tag());
    assert_eq!(second.cseq().unwrap().0, first.cseq().unwrap().0 + 1);
    assert_ne!(second.header("via"), first.header("via"));
    assert!(second.to_tag().is_none());
    let auth = second.header("proxy-authorization").expect("credentials");
    assert!(auth.contains("uri=\"sip:1001@pbx.example.com\""));
    assert_eq!(second.body, first.body);
}

#[tokio::test(start_paused = true)]
async fn test_hold_and_resume_send_reinvites() {
    let mut h = Harness::registered().await;
    let invite = h.connected_outgoing_call("1001").await;

    h.engine.hold_call();
    h.wait_call_state(CallState::Holding).await;
    assert!(h.engine.audio_flags().borrow().on_hold);
    let hold = h.expect_request("INVITE").await;
    assert_eq!(hold.call_id(), invite.call_id());
    assert_eq!(hold.to_tag().as_deref(), Some(PEER_TAG));
    assert!(hold.cseq().unwrap().0 > invite.cseq().unwrap().0);
    assert_eq!(media_direction(&hold.body), MediaDirection::SendOnly);
    h.send(
        h.response(&hold, 200)
            .body("application/sdp", PEER_SDP.replace("a=sendrecv", "a=recvonly")),
    );
    h.expect_request("ACK").await;

    h.engine.unhold_call();
    h.wait_call_state(CallState::Connected).await;
    let resume = h.expect_request("INVITE").await;
    assert_eq!(media_direction(&resume.body), MediaDirection::SendRecv);
    h.send(h.response(&resume, 200).body("application/sdp", PEER_SDP));
    h.expect_request("ACK").await;

    assert_eq!(*h.media.track_enabled.lock().unwrap(), vec![false, true]);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_reinvites_ack_every_2xx() {
    let mut h = Harness::registered().await;
    h.connected_outgoing_call("1001").await;

    h.engine.hold_call();
    let hold = h.expect_request("INVITE").await;
    h.engine.unhold_call();
    h.wait_call_state(CallState::Connected).await;
    let resume = h.expect_request("INVITE").await;
    let hold_cseq = hold.cseq().unwrap().0;
    assert!(resume.cseq().unwrap().0 > hold_cseq);

    // The answer to the superseded hold still needs its ACK
    h.send(
        h.response(&hold, 200)
            .body("application/sdp", PEER_SDP.replace("a=sendrecv", "a=recvonly")),
    );
    let ack = h.expect_request("ACK").await;
    assert_eq!(ack.cseq(), Some((hold_cseq, "ACK".to_string())));
    assert_eq!(*h.engine.call_state().borrow(), CallState::Connected);

    h.send(h.response(&resume, 200).body("application/sdp", PEER_SDP));
    let ack = h.expect_request("ACK").await;
    assert_eq!(ack.cseq(), Some((resume.cseq().unwrap().0, "ACK".to_string())));
    assert_eq!(*h.engine.call_state().borrow(), CallState::Connected);
    h.assert_quiet().await;
}

#[tokio::test(start_paused = true)]
async fn test_call_survives_transport_reconnect() {
    let mut h = Harness::registered().await;
    let invite = h.connected_outgoing_call("1001").await;
    let invite_cseq = invite.cseq().unwrap().0;

    h.network.drop_connection();
    h.wait_registration(RegistrationState::Failed).await;
    let register = h.expect_request("REGISTER").await;
    h.reply(&register, 200);
    h.wait_registration(RegistrationState::Registered).await;

    let snapshot = h.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.call_state, CallState::Connected);
    assert!(snapshot.duration_timer_active);
    assert!(snapshot.media_active);
    assert_eq!(h.media.disposed.load(Ordering::SeqCst), 0);

    let before = h.engine.call_info().borrow().as_ref().unwrap().duration;
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let after = h.engine.call_info().borrow().as_ref().unwrap().duration;
    assert!(after >= before + 2);

    h.engine.send_dtmf('7');
    let info = h.expect_request("INFO").await;
    assert_eq!(info.call_id(), invite.call_id());
    let info_cseq = info.cseq().unwrap().0;
    assert!(info_cseq > invite_cseq);
    h.reply(&info, 200);

    h.engine.hangup_call();
    let bye = h.expect_request("BYE").await;
    assert_eq!(bye.call_id(), invite.call_id());
    assert!(bye.cseq().unwrap().0 > info_cseq);
    h.reply(&bye, 200);
    h.wait_call_state(CallState::Disconnected).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_reinvite_hangs_up() {
    let mut h = Harness::registered().await;
    h.connected_outgoing_call("1001").await;

    h.engine.hold_call();
    let hold = h.expect_request("INVITE").await;
    h.reply(&hold, 488);
    h.expect_request("ACK").await;
    h.expect_request("BYE").await;
    h.wait_call_state(CallState::Disconnected).await;
}

#[tokio::test(start_paused = true)]
async fn test_mute_touches_only_the_track() {
    let mut h = Harness::registered().await;
    h.connected_outgoing_call("1001").await;

    h.engine.mute_call();
    h.engine.toggle_speaker();
    let mut audio = h.engine.audio_flags();
    tokio::time::timeout(Duration::from_secs(5), audio.wait_for(|a| a.muted && a.speaker_on))
        .await
        .unwrap()
        .unwrap();
    h.assert_quiet().await;

    // Resuming from hold keeps the mute
    h.engine.hold_call();
    h.expect_request("INVITE").await;
    h.engine.unhold_call();
    h.expect_request("INVITE").await;
    h.engine.unmute_call();
    tokio::time::timeout(Duration::from_secs(5), audio.wait_for(|a| !a.muted))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        *h.media.track_enabled.lock().unwrap(),
        vec![false, false, false, true]
    );
}

#[tokio::test(start_paused = true)]
async fn test_dtmf_sends_info() {
    let mut h = Harness::registered().await;
    h.connected_outgoing_call("1001").await;

    h.engine.send_dtmf('5');
    let info = h.expect_request("INFO").await;
    assert_eq!(info.header("content-type"), Some("application/dtmf-relay"));
    assert_eq!(info.body, "Signal=5\r\nDuration=160\r\n");
    h.wait_event(Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::DtmfSent { digit: '5', .. })
    })
    .await;

    h.engine.send_dtmf('x');
    h.assert_quiet().await;

    h.engine.hold_call();
    h.expect_request("INVITE").await;
    h.engine.send_dtmf('1');
    h.assert_quiet().await;
}

#[tokio::test(start_paused = true)]
async fn test_transfer_sends_refer() {
    let mut h = Harness::registered().await;
    h.connected_outgoing_call("1001").await;

    h.engine.transfer_call("3003");
    let refer = h.expect_request("REFER").await;
    assert_eq!(refer.header("refer-to"), Some("<sip:3003@pbx.example.com>"));
    assert_eq!(refer.to_tag().as_deref(), Some(PEER_TAG));

    h.reply(&refer, 202);
    let accepted = h
        .wait_event(Duration::from_secs(5), |e| {
            matches!(e, EngineEvent::TransferAccepted { .. })
        })
        .await;
    assert!(matches!(accepted, EngineEvent::TransferAccepted { ref target, .. } if target == "3003"));
    assert_eq!(h.engine.snapshot().await.unwrap().call_state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_peer_bye_ends_call() {
    let mut h = Harness::registered().await;
    let invite = h.connected_outgoing_call("1001").await;
    let call_id = invite.call_id().unwrap().to_string();
    let local_tag = invite.from_tag().unwrap();

    h.network
        .inject(peer_request("BYE", &call_id, PEER_TAG, Some(&local_tag), 1));
    let ok = h.expect_response(200).await;
    assert_eq!(ok.cseq(), Some((1, "BYE".to_string())));

    let ended = h
        .wait_event(Duration::from_secs(5), |e| matches!(e, EngineEvent::CallEnded { .. }))
        .await;
    assert!(matches!(ended, EngineEvent::CallEnded { ref reason, .. } if reason == "remote hangup"));
    h.wait_call_state(CallState::Disconnected).await;
    h.wait_call_state(CallState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn test_bye_for_unknown_dialog_is_481() {
    let mut h = Harness::registered().await;
    h.network
        .inject(peer_request("BYE", "nobody@else", "x1", Some("y2"), 7));
    h.expect_response(481).await;
}

#[tokio::test(start_paused = true)]
async fn test_duration_counts_connected_seconds() {
    let mut h = Harness::registered().await;
    h.connected_outgoing_call("1001").await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let duration = h.engine.call_info().borrow().as_ref().unwrap().duration;
    assert_eq!(duration, 3);
}

#[tokio::test(start_paused = true)]
async fn test_incoming_call_answered() {
    let mut h = Harness::registered().await;

    h.inject_invite("incoming-1@10.0.0.2", "bob-tag", 1);
    let ringing = h.expect_response(180).await;
    let local_tag = ringing.to_tag().expect("To tag on 180");
    h.wait_call_state(CallState::Incoming).await;

    let info = h.engine.call_info().borrow().clone().unwrap();
    assert_eq!(info.number, "2002");
    assert_eq!(info.name.as_deref(), Some("Bob"));
    assert_eq!(info.direction, CallDirection::Incoming);

    h.engine.answer_call();
    let ok = h.expect_response(200).await;
    assert_eq!(ok.to_tag().as_deref(), Some(local_tag.as_str()));
    assert_eq!(ok.body, FAKE_ANSWER);
    assert!(ok.header("contact").is_some());
    h.wait_call_state(CallState::Connected).await;

    let remote = h.media.remote.lock().unwrap().clone();
    assert_eq!(remote, vec![(PEER_SDP.to_string(), SdpKind::Offer)]);

    // In-dialog requests go back to the caller's Contact
    h.engine.hangup_call();
    let bye = h.expect_request("BYE").await;
    assert_eq!(bye.request_uri, "sip:2002@10.0.0.2:5060;transport=ws");
    assert_eq!(bye.from_tag().as_deref(), Some(local_tag.as_str()));
    assert_eq!(bye.to_tag().as_deref(), Some("bob-tag"));
}

#[tokio::test(start_paused = true)]
async fn test_incoming_invite_retransmission_resends_ringing() {
    let mut h = Harness::registered().await;
    h.inject_invite("incoming-2@10.0.0.2", "bob-tag", 1);
    h.expect_response(180).await;
    h.inject_invite("incoming-2@10.0.0.2", "bob-tag", 1);
    h.expect_response(180).await;
    h.assert_quiet().await;
}

#[tokio::test(start_paused = true)]
async fn test_declining_incoming_call_sends_busy() {
    let mut h = Harness::registered().await;
    h.inject_invite("incoming-3@10.0.0.2", "bob-tag", 1);
    h.expect_response(180).await;

    h.engine.hangup_call();
    h.expect_response(486).await;
    h.wait_call_state(CallState::Disconnected).await;
}

#[tokio::test(start_paused = true)]
async fn test_peer_cancel_while_incoming() {
    let mut h = Harness::registered().await;
    h.inject_invite("incoming-4@10.0.0.2", "bob-tag", 1);
    h.expect_response(180).await;

    h.network
        .inject(peer_request("CANCEL", "incoming-4@10.0.0.2", "bob-tag", None, 1));
    let ok = h.expect_response(200).await;
    assert_eq!(ok.cseq(), Some((1, "CANCEL".to_string())));
    let terminated = h.expect_response(487).await;
    assert_eq!(terminated.cseq(), Some((1, "INVITE".to_string())));
    h.wait_call_state(CallState::Disconnected).await;
}

#[tokio::test(start_paused = true)]
async fn test_second_call_is_rejected_busy() {
    let mut h = Harness::registered().await;
    h.connected_outgoing_call("1001").await;

    h.inject_invite("other@10.0.0.9", "carol-tag", 1);
    let busy = h.expect_response(486).await;
    assert_eq!(busy.call_id(), Some("other@10.0.0.9"));
    assert_eq!(h.engine.snapshot().await.unwrap().call_state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_peer_reinvite_hold_is_surfaced() {
    let mut h = Harness::registered().await;
    h.inject_invite("incoming-5@10.0.0.2", "bob-tag", 1);
    let ringing = h.expect_response(180).await;
    let local_tag = ringing.to_tag().unwrap();
    h.engine.answer_call();
    h.expect_response(200).await;
    h.wait_call_state(CallState::Connected).await;

    let reinvite = peer_invite("incoming-5@10.0.0.2", "bob-tag", 2, Some(&local_tag))
        .replace("a=sendrecv", "a=sendonly");
    h.network.inject(reinvite);
    let ok = h.expect_response(200).await;
    assert_eq!(ok.cseq(), Some((2, "INVITE".to_string())));
    assert!(ok.has_body());

    let hold = h
        .wait_event(Duration::from_secs(5), |e| matches!(e, EngineEvent::RemoteHold { .. }))
        .await;
    assert!(matches!(hold, EngineEvent::RemoteHold { on_hold: true, .. }));
    assert_eq!(h.engine.snapshot().await.unwrap().call_state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_options_and_unknown_requests() {
    let mut h = Harness::registered().await;
    h.network
        .inject(peer_request("OPTIONS", "ping@10.0.0.2", "p1", None, 1));
    h.expect_response(200).await;
    h.network
        .inject(peer_request("SUBSCRIBE", "sub@10.0.0.2", "p2", None, 1));
    h.expect_response(501).await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_outside_their_state_are_no_ops() {
    let mut h = Harness::registered().await;

    h.engine.answer_call();
    h.engine.hangup_call();
    h.engine.hold_call();
    h.engine.unhold_call();
    h.engine.mute_call();
    h.engine.send_dtmf('1');
    h.engine.transfer_call("3003");
    h.assert_quiet().await;
    let snapshot = h.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.call_state, CallState::Idle);
    assert!(!snapshot.audio.muted);

    // One call at a time
    h.connected_outgoing_call("1001").await;
    h.engine.make_call("2002");
    h.assert_quiet().await;
    h.engine.answer_call();
    h.assert_quiet().await;
}

#[tokio::test(start_paused = true)]
async fn test_make_call_requires_registration() {
    let mut h = Harness::new();
    h.engine.initialize(common::account());
    h.engine.make_call("1001");
    h.assert_quiet().await;
    assert_eq!(*h.engine.call_state().borrow(), CallState::Idle);
    assert_eq!(
        *h.engine.registration_state().borrow(),
        RegistrationState::Unregistered
    );
}

#[tokio::test(start_paused = true)]
async fn test_fallback_sdp_when_media_unavailable() {
    let mut h = Harness::without_media();
    h.register().await;

    h.engine.make_call("1001");
    let invite = h.expect_request("INVITE").await;
    assert!(invite.body.contains("s=WsPhone"));
    assert!(invite.body.contains("m=audio 9 UDP/TLS/RTP/SAVPF 0 8 101"));
    h.wait_event(Duration::from_secs(5), |e| matches!(e, EngineEvent::Warning { .. }))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_hangup_before_offer_is_ready_sends_nothing() {
    let mut h = Harness::registered().await;
    h.engine.make_call("1001");
    h.engine.hangup_call();
    h.wait_call_state(CallState::Disconnected).await;
    h.assert_quiet().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_call_hangs_up() {
    let mut h = Harness::registered().await;
    h.connected_outgoing_call("1001").await;

    h.engine.shutdown().await;
    h.expect_request("BYE").await;
    let unregister = h.expect_request("REGISTER").await;
    assert_eq!(unregister.header("expires"), Some("0"));

    let snapshot = h.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.call_state, CallState::Idle);
    assert!(snapshot.call_info.is_none());
    assert_eq!(snapshot.background_tasks(), 0);
}
