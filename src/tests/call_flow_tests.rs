//! End-to-end call scenarios over fake audio and a fake backend.

use super::fakes::{is_status, wait_for, FakeRecognizer, FakeReply, Harness, SPEECH};
use crate::orchestrator::{CallError, CallEvent, EndReason};
use crate::session::CallState;
use crate::settings::InterruptedTurnPolicy;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn spawn_call(harness: &Harness) -> tokio::task::JoinHandle<Result<crate::orchestrator::CallReport, CallError>> {
    let orchestrator = harness.orchestrator.clone();
    tokio::spawn(async move { orchestrator.start_call().await })
}

fn assert_torn_down(harness: &Harness) {
    let graph = harness.orchestrator.graph();
    assert_eq!(graph.live_mic_tracks(), 0);
    assert_eq!(harness.mic.live_tracks(), 0);
    assert_eq!(harness.orchestrator.scheduled_frames(), 0);
    assert_eq!(graph.blobs().live_count(), 0);
    assert!(!harness.orchestrator.playback().is_playing());
    assert_eq!(harness.orchestrator.state(), CallState::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_happy_turn_round_trip() {
    let harness = Harness::builder().build();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| is_status(e, "AI greeting you…")).await;
    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Recording))).await;
    wait_for(&mut events, |e| is_status(e, "Thinking…")).await;
    wait_for(&mut events, |e| is_status(e, "AI replying…")).await;
    wait_for(&mut events, |e| is_status(e, "Your turn…")).await;
    let caption = wait_for(&mut events, |e| matches!(e, CallEvent::AssistantCaption(c) if c.is_final)).await;
    assert_eq!(
        caption,
        CallEvent::AssistantCaption(crate::captions::Caption {
            text: "Sure, tell me more".into(),
            is_final: true,
        })
    );

    harness.orchestrator.end_call();
    let report = call.await.unwrap().unwrap();

    assert_eq!(report.turns_recorded, 1);
    assert_eq!(report.ai_turns_completed, 1);
    assert_eq!(report.ai_turns_interrupted, 0);
    assert_eq!(report.ended_reason, EndReason::HungUp);
    assert_torn_down(&harness);

    let requests = harness.backend.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].call_id, report.call_id.to_string());
    assert_eq!(requests[0].user_id, "user-1");
    assert_eq!(requests[0].device_id, "device-1");
    assert_eq!(requests[0].source, "voice");
    assert!(!requests[0].has_transcript);
    // Greeting for this call plus the prefetch for the next one.
    assert_eq!(harness.backend.greetings.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_end_call_twice_leaves_nothing_running() {
    let harness = Harness::builder().build();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Recording))).await;
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(harness.orchestrator.scheduled_frames(), 1);
    assert_eq!(harness.orchestrator.graph().live_mic_tracks(), 1);

    harness.orchestrator.end_call();
    assert_torn_down(&harness);
    harness.orchestrator.end_call();
    assert_torn_down(&harness);

    let report = call.await.unwrap().unwrap();
    assert_eq!(report.turns_recorded, 0);
    assert_eq!(report.ended_reason, EndReason::HungUp);
    assert_torn_down(&harness);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.mic.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_end_call_during_greeting_stops_playback() {
    let harness = Harness::builder().playback_duration(Duration::from_secs(5)).build();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| is_status(e, "AI greeting you…")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.orchestrator.playback().is_playing());

    harness.orchestrator.end_call();
    assert_torn_down(&harness);
    assert_eq!(harness.sink.log.stopped.load(Ordering::SeqCst), 1);

    call.await.unwrap().unwrap();
    assert_eq!(harness.mic.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_call_while_mic_opens_closes_the_late_track() {
    let harness = Harness::builder().build();
    let finish_open = harness.mic.hold_next_open();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Recording))).await;
    while harness.mic.opened.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    harness.orchestrator.end_call();
    let report = call.await.unwrap().unwrap();
    assert_eq!(report.ended_reason, EndReason::HungUp);
    assert_eq!(report.turns_recorded, 0);

    // The device finishes opening after the call is gone.
    finish_open.send(()).unwrap();
    for _ in 0..1000 {
        if harness.mic.total_tracks() == 1 && harness.mic.live_tracks() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(harness.mic.total_tracks(), 1);
    assert_eq!(harness.mic.live_tracks(), 0);
    assert_torn_down(&harness);
}

#[tokio::test(start_paused = true)]
async fn test_unplayable_reply_is_reported_not_completed() {
    let harness = Harness::builder().sink_fails().build();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| is_status(e, "AI replying…")).await;
    wait_for(&mut events, |e| is_status(e, "AI processing failed (no audio).")).await;
    let error = wait_for(&mut events, |e| matches!(e, CallEvent::Error { .. })).await;
    assert!(matches!(error, CallEvent::Error { fatal: false, .. }));
    wait_for(&mut events, |e| is_status(e, "Listening again…")).await;

    harness.orchestrator.end_call();
    let report = call.await.unwrap().unwrap();
    assert_eq!(report.turns_recorded, 1);
    assert_eq!(report.ai_turns_completed, 0);
    assert_eq!(report.ai_turns_interrupted, 0);
    assert_torn_down(&harness);
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_interrupts_reply() {
    let harness = Harness::builder().playback_duration(Duration::from_secs(10)).build();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Playing))).await;
    harness.mic.set_amplitude(SPEECH);

    wait_for(&mut events, |e| matches!(e, CallEvent::BargeIn)).await;
    harness.mic.set_amplitude(0.0);
    assert!(!harness.orchestrator.playback().is_playing());
    assert_eq!(harness.orchestrator.state(), CallState::Recording);

    wait_for(&mut events, |e| is_status(e, "Go ahead…")).await;
    wait_for(&mut events, |e| is_status(e, "Your turn…")).await;
    harness.orchestrator.end_call();
    let report = call.await.unwrap().unwrap();

    assert_eq!(report.ai_turns_completed, 0);
    assert_eq!(report.ai_turns_interrupted, 1);
    assert!(harness.sink.log.stopped.load(Ordering::SeqCst) >= 1);
    assert_torn_down(&harness);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_reply_can_count_as_completed() {
    let harness = Harness::builder()
        .playback_duration(Duration::from_secs(10))
        .settings(|s| s.barge_in.interrupted_turn_policy = InterruptedTurnPolicy::CountAsCompleted)
        .build();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Playing))).await;
    harness.mic.set_amplitude(SPEECH);
    wait_for(&mut events, |e| matches!(e, CallEvent::BargeIn)).await;
    harness.mic.set_amplitude(0.0);
    wait_for(&mut events, |e| is_status(e, "Your turn…")).await;

    harness.orchestrator.end_call();
    let report = call.await.unwrap().unwrap();
    assert_eq!(report.ai_turns_completed, 1);
    assert_eq!(report.ai_turns_interrupted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reply_echo_inside_cooldown_does_not_barge_in() {
    let harness = Harness::builder()
        .playback_duration(Duration::from_millis(300))
        .build();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Playing))).await;
    harness.mic.set_amplitude(SPEECH);
    wait_for(&mut events, |e| is_status(e, "Your turn…")).await;
    harness.mic.set_amplitude(0.0);

    harness.orchestrator.end_call();
    let report = call.await.unwrap().unwrap();
    assert_eq!(report.ai_turns_completed, 1);
    assert_eq!(report.ai_turns_interrupted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_backend_failure_loops_back_to_recording() {
    let harness = Harness::builder().build();
    harness.backend.failures.store(1, Ordering::SeqCst);
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| is_status(e, "AI processing failed.")).await;
    let error = wait_for(&mut events, |e| matches!(e, CallEvent::Error { .. })).await;
    assert!(matches!(error, CallEvent::Error { fatal: false, .. }));
    wait_for(&mut events, |e| is_status(e, "Listening again…")).await;
    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Recording))).await;

    // The next turn goes through.
    wait_for(&mut events, |e| is_status(e, "Your turn…")).await;
    harness.orchestrator.end_call();
    let report = call.await.unwrap().unwrap();

    assert_eq!(report.turns_recorded, 2);
    assert_eq!(report.ai_turns_completed, 1);
    assert_eq!(report.ended_reason, EndReason::HungUp);
}

#[tokio::test(start_paused = true)]
async fn test_text_only_reply_is_captioned_and_loops() {
    let harness = Harness::builder().build();
    *harness.backend.reply.lock().unwrap() = FakeReply::TextOnly("I lost my voice".into());
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    let caption = wait_for(&mut events, |e| matches!(e, CallEvent::AssistantCaption(_))).await;
    assert!(matches!(caption, CallEvent::AssistantCaption(c) if c.text == "I lost my voice" && c.is_final));
    wait_for(&mut events, |e| is_status(e, "AI processing failed (no audio).")).await;
    wait_for(&mut events, |e| is_status(e, "Listening again…")).await;

    harness.orchestrator.end_call();
    let report = call.await.unwrap().unwrap();
    assert_eq!(report.ai_turns_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_mic_failure_is_fatal() {
    let harness = Harness::builder().mic_fails().build();
    let mut events = harness.orchestrator.subscribe();

    let report = harness.orchestrator.start_call().await.unwrap();
    assert!(matches!(report.ended_reason, EndReason::Failed(_)));
    assert_eq!(report.turns_recorded, 0);
    assert_torn_down(&harness);

    wait_for(&mut events, |e| is_status(e, "Mic permission or codec not supported.")).await;
    wait_for(&mut events, |e| matches!(e, CallEvent::Error { fatal: true, .. })).await;
    wait_for(&mut events, |e| is_status(e, "Call ended.")).await;
}

#[tokio::test(start_paused = true)]
async fn test_greeting_failure_falls_through_to_recording() {
    let harness = Harness::builder().build();
    harness.backend.greeting_fails.store(true, Ordering::SeqCst);
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Recording))).await;
    assert_eq!(harness.sink.log.started.load(Ordering::SeqCst), 0);

    harness.orchestrator.end_call();
    call.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_second_start_while_in_call_is_rejected() {
    let harness = Harness::builder().build();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Greeting))).await;
    let err = harness.orchestrator.start_call().await.unwrap_err();
    assert!(matches!(err, CallError::AlreadyInCall));

    harness.orchestrator.end_call();
    let first = call.await.unwrap().unwrap();

    // Ended is terminal for that session; a new call gets a fresh one.
    let again = spawn_call(&harness);
    wait_for(&mut events, |e| matches!(e, CallEvent::StateChanged(CallState::Ringing))).await;
    harness.orchestrator.end_call();
    let second = again.await.unwrap().unwrap();
    assert_ne!(first.call_id, second.call_id);
}

#[tokio::test(start_paused = true)]
async fn test_transcripts_feed_history_and_captions() {
    let recognizer = Arc::new(FakeRecognizer::new("hello there"));
    let harness = Harness::builder().recognizer(recognizer).build();
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| {
        matches!(e, CallEvent::UserCaption { text, is_final: true } if text == "hello there")
    })
    .await;
    wait_for(&mut events, |e| is_status(e, "Your turn…")).await;
    wait_for(&mut events, |e| is_status(e, "Your turn…")).await;
    harness.orchestrator.end_call();
    call.await.unwrap().unwrap();

    let requests = harness.backend.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].transcript, "hello there");
    assert_eq!(requests[0].user_turn, "hello there");
    assert!(requests[0].has_transcript);
    assert_eq!(requests[0].history_user_last3, vec!["hello there"]);
    assert_eq!(requests[1].history_user_last3, vec!["hello there", "hello there"]);
}

#[tokio::test(start_paused = true)]
async fn test_muted_mic_reads_as_silence() {
    let harness = Harness::builder().build();
    harness.orchestrator.set_mic_muted(true);
    harness.mic.set_amplitude(SPEECH);
    let mut events = harness.orchestrator.subscribe();
    let call = spawn_call(&harness);

    wait_for(&mut events, |e| is_status(e, "Thinking…")).await;
    harness.orchestrator.end_call();
    let report = call.await.unwrap().unwrap();
    assert_eq!(report.turns_recorded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_speaker_unmute_routes_to_preferred_output() {
    let harness = Harness::builder().build();
    harness.orchestrator.set_speaker_muted(true);
    assert!(harness.sink.log.muted.load(Ordering::SeqCst));
    assert!(harness.sink.log.routed_to.lock().unwrap().is_none());

    harness.orchestrator.set_speaker_muted(false);
    assert!(!harness.sink.log.muted.load(Ordering::SeqCst));
    assert_eq!(harness.sink.log.routed_to.lock().unwrap().as_deref(), Some("loud"));
    assert_eq!(harness.orchestrator.graph().output_device().as_deref(), Some("loud"));
    assert_eq!(harness.orchestrator.elapsed_display(), "00:00");
}
