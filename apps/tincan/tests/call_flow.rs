//! End-to-end call flows over an in-process rendezvous with scripted engines.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use tincan::call::{CallHandle, CallNotice, CallState, CallStateMachine};
use tincan::ident::CallerId;
use tincan::media::MediaKind;
use tincan::peer::{ConnectionHealth, EngineEvent, EngineFactory};
use tincan::signaling::{IceCandidate, SignalingChannel};
use tincan::testing::{FakeAudioRoute, FakeEngineFactory, FakeMedia, MemorySignaling, Rendezvous};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Party {
    handle: CallHandle,
    notices: mpsc::UnboundedReceiver<CallNotice>,
    factory: Arc<FakeEngineFactory>,
    media: Arc<FakeMedia>,
    audio: Arc<FakeAudioRoute>,
    signaling: Arc<MemorySignaling>,
}

async fn join(rendezvous: &Arc<Rendezvous>, id: &str) -> Party {
    init_tracing();
    let caller_id = CallerId::new(id);
    let (signaling, signals) = rendezvous.join(caller_id.clone());
    let factory = Arc::new(FakeEngineFactory::new());
    let media = Arc::new(FakeMedia::new());
    let audio = Arc::new(FakeAudioRoute::new());
    let (handle, notices, _task) = CallStateMachine::spawn(
        caller_id,
        Arc::clone(&signaling) as Arc<dyn SignalingChannel>,
        signals,
        Arc::clone(&factory) as Arc<dyn EngineFactory>,
        Arc::clone(&media) as _,
        Arc::clone(&audio) as _,
        Duration::from_millis(50),
    )
    .await
    .expect("spawn call driver");
    Party {
        handle,
        notices,
        factory,
        media,
        audio,
        signaling,
    }
}

async fn wait_for_state(handle: &CallHandle, state: CallState) {
    let mut info = handle.watch_info();
    timeout(WAIT, info.wait_for(|i| i.state == state))
        .await
        .expect("state change timed out")
        .expect("call driver dropped");
}

async fn next_notice(notices: &mut mpsc::UnboundedReceiver<CallNotice>) -> CallNotice {
    timeout(WAIT, notices.recv())
        .await
        .expect("notice timed out")
        .expect("notice channel closed")
}

async fn connect_pair(rendezvous: &Arc<Rendezvous>) -> (Party, Party) {
    let mut caller = join(rendezvous, "111111").await;
    let mut callee = join(rendezvous, "222222").await;
    caller
        .handle
        .start(CallerId::new("222222"), MediaKind::Audio)
        .unwrap();
    match next_notice(&mut callee.notices).await {
        CallNotice::IncomingCall { from, kind } => {
            assert_eq!(from.as_str(), "111111");
            assert_eq!(kind, MediaKind::Audio);
        }
        other => panic!("expected incoming call, got {other:?}"),
    }
    callee.handle.accept().unwrap();
    wait_for_state(&caller.handle, CallState::Connected).await;
    wait_for_state(&callee.handle, CallState::Connected).await;
    (caller, callee)
}

#[tokio::test]
async fn audio_call_round_trip() {
    let rendezvous = Rendezvous::new();
    let (caller, callee) = connect_pair(&rendezvous).await;

    let info = caller.handle.info();
    assert_eq!(info.local_media, MediaKind::Audio);
    assert_eq!(info.remote_media, Some(MediaKind::Audio));
    assert!(info.started_at.is_some());

    let audio_log = callee.audio.log();
    assert!(audio_log.contains(&"start_ringtone".to_string()));
    assert!(audio_log.contains(&"stop_ringtone".to_string()));
    assert!(audio_log.contains(&"start_session:audio".to_string()));

    // One offer from the caller, answered by the callee.
    assert_eq!(caller.factory.latest().offer_count(), 1);
    assert!(callee.factory.latest().remote_description().is_some());
}

#[tokio::test]
async fn video_call_round_trip() {
    let rendezvous = Rendezvous::new();
    let caller = join(&rendezvous, "111111").await;
    let mut callee = join(&rendezvous, "222222").await;

    caller
        .handle
        .start(CallerId::new("222222"), MediaKind::Video)
        .unwrap();
    match next_notice(&mut callee.notices).await {
        CallNotice::IncomingCall { from, kind } => {
            assert_eq!(from.as_str(), "111111");
            assert_eq!(kind, MediaKind::Video);
        }
        other => panic!("expected incoming video call, got {other:?}"),
    }
    callee.handle.accept().unwrap();
    wait_for_state(&caller.handle, CallState::Connected).await;
    wait_for_state(&callee.handle, CallState::Connected).await;

    for party in [&caller, &callee] {
        let info = party.handle.info();
        assert_eq!(info.local_media, MediaKind::Video);
        assert_eq!(info.remote_media, Some(MediaKind::Video));
        assert!(party
            .factory
            .latest()
            .attached_tracks()
            .iter()
            .any(|t| t.kind() == MediaKind::Video));
    }
    assert!(callee
        .audio
        .log()
        .contains(&"start_session:video".to_string()));
}

#[tokio::test]
async fn rejecting_an_incoming_call_releases_everything() {
    let rendezvous = Rendezvous::new();
    let mut caller = join(&rendezvous, "111111").await;
    let mut callee = join(&rendezvous, "222222").await;

    caller
        .handle
        .start(CallerId::new("222222"), MediaKind::Audio)
        .unwrap();
    next_notice(&mut callee.notices).await;
    callee.handle.leave().unwrap();

    assert_eq!(next_notice(&mut caller.notices).await, CallNotice::CallRejected);
    wait_for_state(&caller.handle, CallState::Idle).await;
    wait_for_state(&callee.handle, CallState::Idle).await;

    for track in caller.media.acquired() {
        assert!(!track.is_enabled(), "caller track must be released");
    }
}

#[tokio::test]
async fn canceling_an_outgoing_call_notifies_the_callee() {
    let rendezvous = Rendezvous::new();
    let mut caller = join(&rendezvous, "111111").await;
    let mut callee = join(&rendezvous, "222222").await;

    caller
        .handle
        .start(CallerId::new("222222"), MediaKind::Audio)
        .unwrap();
    next_notice(&mut callee.notices).await;
    caller.handle.leave().unwrap();

    assert_eq!(next_notice(&mut callee.notices).await, CallNotice::CallCanceled);
    wait_for_state(&callee.handle, CallState::Idle).await;
    assert!(
        callee.audio.log().contains(&"stop_ringtone".to_string()),
        "ringtone must stop on cancel"
    );
}

#[tokio::test]
async fn accept_retries_after_a_transient_send_failure() {
    let rendezvous = Rendezvous::new();
    let caller = join(&rendezvous, "111111").await;
    let mut callee = join(&rendezvous, "222222").await;

    caller
        .handle
        .start(CallerId::new("222222"), MediaKind::Audio)
        .unwrap();
    next_notice(&mut callee.notices).await;

    // The answer cannot be delivered; the offer must survive the attempt.
    callee.signaling.set_connected(false);
    callee.handle.accept().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(callee.handle.info().state, CallState::IncomingRinging);

    callee.signaling.set_connected(true);
    callee.handle.accept().unwrap();
    wait_for_state(&caller.handle, CallState::Connected).await;
    wait_for_state(&callee.handle, CallState::Connected).await;
}

#[tokio::test]
async fn a_third_caller_is_rejected_while_busy() {
    let rendezvous = Rendezvous::new();
    let (_caller, callee) = connect_pair(&rendezvous).await;

    let mut third = join(&rendezvous, "333333").await;
    third
        .handle
        .start(CallerId::new("222222"), MediaKind::Audio)
        .unwrap();

    assert_eq!(next_notice(&mut third.notices).await, CallNotice::CallRejected);
    wait_for_state(&third.handle, CallState::Idle).await;
    assert_eq!(callee.handle.info().state, CallState::Connected);
}

#[tokio::test]
async fn trickled_candidates_arrive_in_order() {
    let rendezvous = Rendezvous::new();
    let (caller, callee) = connect_pair(&rendezvous).await;

    let callee_engine = callee.factory.latest();
    for tag in ["first", "second", "third"] {
        callee_engine.emit(EngineEvent::Candidate(Some(IceCandidate {
            candidate: tag.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        })));
    }

    let caller_engine = caller.factory.latest();
    timeout(WAIT, async {
        loop {
            if caller_engine.applied_candidates().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("candidates never applied");

    let applied: Vec<String> = caller_engine
        .applied_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(applied, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn established_calls_suppress_automatic_offers() {
    let rendezvous = Rendezvous::new();
    let (caller, _callee) = connect_pair(&rendezvous).await;

    let engine = caller.factory.latest();
    assert_eq!(engine.offer_count(), 1);
    engine.emit(EngineEvent::NegotiationNeeded);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.offer_count(), 1, "no offer may follow mid-call");
}

#[tokio::test]
async fn video_upgrade_handshake() {
    let rendezvous = Rendezvous::new();
    let (caller, mut callee) = connect_pair(&rendezvous).await;

    caller.handle.request_video().unwrap();
    match next_notice(&mut callee.notices).await {
        CallNotice::MediaChangeRequested { from, kind } => {
            assert_eq!(from.as_str(), "111111");
            assert_eq!(kind, MediaKind::Video);
        }
        other => panic!("expected media change request, got {other:?}"),
    }
    callee.handle.approve_media_change().unwrap();

    let mut caller_info = caller.handle.watch_info();
    timeout(WAIT, caller_info.wait_for(|i| i.local_media == MediaKind::Video))
        .await
        .expect("caller never upgraded")
        .unwrap();
    let mut callee_info = callee.handle.watch_info();
    timeout(WAIT, callee_info.wait_for(|i| i.local_media == MediaKind::Video))
        .await
        .expect("callee never upgraded")
        .unwrap();

    // Both sides now hold a camera track and exchanged a fresh offer/answer.
    // The re-acquired microphone must not have grown a second audio sender.
    for party in [&caller, &callee] {
        let tracks = party.factory.latest().attached_tracks();
        assert!(tracks.iter().any(|t| t.kind() == MediaKind::Video));
        assert_eq!(
            tracks.iter().filter(|t| t.kind() == MediaKind::Audio).count(),
            1
        );
    }
    assert_eq!(caller.factory.latest().offer_count(), 2);
}

#[tokio::test]
async fn declined_upgrade_leaves_the_call_on_audio() {
    let rendezvous = Rendezvous::new();
    let (mut caller, mut callee) = connect_pair(&rendezvous).await;

    caller.handle.request_video().unwrap();
    next_notice(&mut callee.notices).await;
    callee.handle.reject_media_change().unwrap();

    assert_eq!(
        next_notice(&mut caller.notices).await,
        CallNotice::MediaChangeRejected
    );
    assert_eq!(caller.handle.info().local_media, MediaKind::Audio);
    assert_eq!(caller.factory.latest().offer_count(), 1);
}

#[tokio::test]
async fn video_downgrade_is_unilateral() {
    let rendezvous = Rendezvous::new();
    let (caller, mut callee) = connect_pair(&rendezvous).await;

    caller.handle.request_video().unwrap();
    next_notice(&mut callee.notices).await;
    callee.handle.approve_media_change().unwrap();
    let mut caller_info = caller.handle.watch_info();
    timeout(WAIT, caller_info.wait_for(|i| i.local_media == MediaKind::Video))
        .await
        .expect("upgrade never settled")
        .unwrap();

    caller.handle.end_video().unwrap();
    assert_eq!(
        next_notice(&mut callee.notices).await,
        CallNotice::RemoteVideoEnded
    );
    timeout(WAIT, caller_info.wait_for(|i| i.local_media == MediaKind::Audio))
        .await
        .expect("downgrade never settled")
        .unwrap();

    assert!(!caller
        .factory
        .latest()
        .attached_tracks()
        .iter()
        .any(|t| t.kind() == MediaKind::Video));
    let mut callee_info = callee.handle.watch_info();
    timeout(
        WAIT,
        callee_info.wait_for(|i| i.remote_media == Some(MediaKind::Audio)),
    )
    .await
    .expect("callee never observed the downgrade")
    .unwrap();
}

#[tokio::test]
async fn denied_camera_turns_approval_into_reject() {
    let rendezvous = Rendezvous::new();
    let (mut caller, mut callee) = connect_pair(&rendezvous).await;

    caller.handle.request_video().unwrap();
    next_notice(&mut callee.notices).await;
    callee.media.deny_access();
    callee.handle.approve_media_change().unwrap();

    match next_notice(&mut callee.notices).await {
        CallNotice::MediaUnavailable(_) => {}
        other => panic!("expected media unavailable, got {other:?}"),
    }
    assert_eq!(
        next_notice(&mut caller.notices).await,
        CallNotice::MediaChangeRejected
    );
    assert_eq!(callee.handle.info().local_media, MediaKind::Audio);
}

#[tokio::test]
async fn hanging_up_resets_both_sides() {
    let rendezvous = Rendezvous::new();
    let (caller, mut callee) = connect_pair(&rendezvous).await;

    caller.handle.leave().unwrap();
    assert_eq!(next_notice(&mut callee.notices).await, CallNotice::CallEnded);
    wait_for_state(&caller.handle, CallState::Idle).await;
    wait_for_state(&callee.handle, CallState::Idle).await;

    // Teardown replaces the engine so the next call starts clean.
    assert_eq!(caller.factory.engines().len(), 2);
    assert!(caller.audio.log().contains(&"stop_session".to_string()));
}

#[tokio::test]
async fn a_hangup_does_not_disturb_the_next_call() {
    let rendezvous = Rendezvous::new();
    let (mut caller, mut callee) = connect_pair(&rendezvous).await;

    caller.handle.leave().unwrap();
    assert_eq!(next_notice(&mut callee.notices).await, CallNotice::CallEnded);
    wait_for_state(&caller.handle, CallState::Idle).await;
    wait_for_state(&callee.handle, CallState::Idle).await;

    // The torn-down engine reported Closed on its way out; calling again
    // right away must not pick that up.
    caller
        .handle
        .start(CallerId::new("222222"), MediaKind::Audio)
        .unwrap();
    next_notice(&mut callee.notices).await;
    callee.handle.accept().unwrap();
    wait_for_state(&caller.handle, CallState::Connected).await;
    wait_for_state(&callee.handle, CallState::Connected).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(caller.handle.info().state, CallState::Connected);
    assert!(caller.notices.try_recv().is_err(), "no stray notice expected");
    assert_eq!(caller.factory.engines().len(), 2);
}

#[tokio::test]
async fn transport_failure_first_restarts_then_gives_up() {
    let rendezvous = Rendezvous::new();
    let (mut caller, _callee) = connect_pair(&rendezvous).await;

    let engine = caller.factory.latest();
    engine.emit(EngineEvent::ConnectionState(ConnectionHealth::Failed));
    timeout(WAIT, async {
        loop {
            if engine.last_offer_options().is_some_and(|o| o.ice_restart) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no ICE restart offer went out");

    engine.emit(EngineEvent::ConnectionState(ConnectionHealth::Failed));
    assert_eq!(
        next_notice(&mut caller.notices).await,
        CallNotice::ConnectionFailed
    );
    wait_for_state(&caller.handle, CallState::Idle).await;
}

#[tokio::test]
async fn mic_and_speaker_toggles_reach_the_device() {
    let rendezvous = Rendezvous::new();
    let (caller, _callee) = connect_pair(&rendezvous).await;

    caller.handle.set_mic_enabled(false).unwrap();
    caller.handle.set_speaker(true).unwrap();

    let mut info = caller.handle.watch_info();
    timeout(WAIT, info.wait_for(|i| !i.mic_enabled && i.speaker_on))
        .await
        .expect("toggles never observed")
        .unwrap();

    let log = caller.audio.log();
    assert!(log.contains(&"set_mic_mute:true".to_string()));
    assert!(log.contains(&"set_speaker:true".to_string()));
    assert!(caller
        .media
        .acquired()
        .iter()
        .all(|track| !track.is_enabled()));
}
