//! End-to-end session tests against a scripted in-memory server

use futures::future::BoxFuture;
use futures::FutureExt;
use interview_session::audio::{encode_wav, NullSink};
use interview_session::integration::{
    Notification, OrchestratorBuilder, SessionConfig, SessionHandle, UserAction,
};
use interview_session::session::{SessionPhase, TurnState};
use interview_session::transport::{ConnectionState, Connector, Frame, Link, TransportConfig};
use interview_session::{Result, SessionError};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

/// Hands out one link, then refuses
struct OneShotConnector {
    link: Mutex<Option<Link>>,
}

impl Connector for OneShotConnector {
    fn connect(&self, _address: &str) -> BoxFuture<'static, Result<Link>> {
        let next = self
            .link
            .lock()
            .take()
            .ok_or_else(|| SessionError::ConnectionFailed("refused".to_string()));
        async move { next }.boxed()
    }
}

/// Server side of the link
struct Server {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl Server {
    fn send(&self, kind: &str, payload: Value) {
        let text = serde_json::json!({ "kind": kind, "payload": payload, "sessionId": "s-1" });
        self.to_client.send(Frame::Text(text.to_string())).unwrap();
    }

    /// Next message kind sent by the client
    async fn expect(&mut self) -> (String, Value) {
        let frame = timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("client sent nothing")
            .expect("link closed");
        let Frame::Text(text) = frame else {
            panic!("unexpected binary frame from client");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["sessionId"], "s-1");
        (value["kind"].as_str().unwrap().to_string(), value["payload"].clone())
    }
}

fn test_config() -> SessionConfig {
    SessionConfig::new("ws://interview.test/ws", "s-1")
        .with_participant("cand-1", "Casey")
        .with_config_id("backend")
        .without_audio_input()
        .without_audio_output()
}

fn build(config: SessionConfig) -> (interview_session::integration::InterviewOrchestrator, SessionHandle, Server) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    let connector = Arc::new(OneShotConnector {
        link: Mutex::new(Some(Link { outgoing, incoming })),
    });

    let (orchestrator, handle) = OrchestratorBuilder::new()
        .with_config(config)
        .with_connector(connector)
        .with_sink_factory(NullSink::factory())
        .build()
        .unwrap();

    (orchestrator, handle, Server { to_client, from_client })
}

/// Poll for a notification matching `pred`
async fn wait_for<F>(handle: &SessionHandle, pred: F) -> Notification
where
    F: Fn(&Notification) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        while let Some(notification) = handle.try_recv_notification() {
            if pred(&notification) {
                return notification;
            }
        }
        assert!(Instant::now() < deadline, "notification never arrived");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the snapshot satisfies `pred`
async fn wait_until<F>(handle: &SessionHandle, pred: F)
where
    F: Fn(&interview_session::session::SessionSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred(&handle.snapshot()) {
        assert!(Instant::now() < deadline, "state never reached");
        sleep(Duration::from_millis(10)).await;
    }
}

fn speech_wav() -> Vec<u8> {
    encode_wav(&vec![0.1; 1600], 16000, 1).unwrap()
}

#[tokio::test]
async fn test_full_interview_flow() {
    let (orchestrator, handle, mut server) = build(test_config());
    let session = orchestrator.start().await.unwrap();

    server.send("connection_established", serde_json::json!({}));
    assert_eq!(server.expect().await.0, "load_config");
    assert_eq!(server.expect().await.0, "start_interview");

    server.send(
        "interview_start",
        serde_json::json!({
            "participants": [{ "id": "ada", "name": "Ada" }],
            "openingRemarks": "Welcome to the interview.",
            "voice": "alloy"
        }),
    );
    server.to_client.send(Frame::Binary(speech_wav())).unwrap();
    server.send("audio_streaming_completed", serde_json::json!({}));

    assert_eq!(server.expect().await.0, "audio_playback_completed");

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::InProgress);
    assert_eq!(snapshot.participants.len(), 2);
    assert!(snapshot.active_speaker.is_none());
    assert!(handle
        .transcript()
        .iter()
        .any(|m| m.content == "Welcome to the interview."));

    server.send(
        "next_speaker_info",
        serde_json::json!({ "speaker": "Ada", "requiresHumanInput": false }),
    );
    server.send(
        "interview_data",
        serde_json::json!({
            "speaker": "Casey",
            "content": "",
            "topic": "Background",
            "requiresHumanInput": true
        }),
    );

    wait_until(&handle, |s| s.is_my_turn).await;
    let snapshot = handle.snapshot();
    let casey = snapshot
        .participants
        .iter()
        .find(|p| p.name == "Casey")
        .unwrap();
    assert_eq!(casey.turn, TurnState::Speaking);
    assert_eq!(snapshot.topic.as_deref(), Some("Background"));

    server.send(
        "interview_end",
        serde_json::json!({ "closingRemarks": "Thanks for your time." }),
    );

    let ended = wait_for(&handle, |n| matches!(n, Notification::SessionEnded { .. })).await;
    assert_eq!(
        ended,
        Notification::SessionEnded {
            closing_remarks: Some("Thanks for your time.".to_string())
        }
    );
    assert!(handle.is_ended());
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);

    handle.shutdown();
    timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_speaker_reported() {
    let (orchestrator, handle, server) = build(test_config());
    let session = orchestrator.start().await.unwrap();

    server.send(
        "interview_start",
        serde_json::json!({ "participants": [{ "id": "ada", "name": "Ada" }] }),
    );
    server.send(
        "interview_data",
        serde_json::json!({ "speaker": "Mallory", "content": "hi", "topic": "Live Coding" }),
    );

    let error = wait_for(&handle, |n| matches!(n, Notification::Error(_))).await;
    assert!(matches!(
        error,
        Notification::Error(SessionError::UnknownParticipant(_))
    ));

    let snapshot = handle.snapshot();
    assert!(!snapshot.live_coding);
    assert!(snapshot.active_speaker.is_none());

    handle.shutdown();
    timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_end_interview_notifies_server() {
    let (orchestrator, handle, mut server) = build(test_config());
    let session = orchestrator.start().await.unwrap();

    handle.send_action(UserAction::EndInterview).unwrap();

    assert_eq!(server.expect().await.0, "interview_end");
    wait_for(&handle, |n| matches!(n, Notification::SessionEnded { .. })).await;

    // Input after the end is ignored
    handle.send_action(UserAction::AcknowledgeInstructions).unwrap();
    handle.shutdown();
    timeout(Duration::from_secs(5), session).await.unwrap().unwrap();

    assert!(server.from_client.try_recv().is_err());
}

#[tokio::test]
async fn test_microphone_refused_outside_turn() {
    let (orchestrator, handle, _server) = build(test_config());
    let session = orchestrator.start().await.unwrap();

    handle.send_action(UserAction::ToggleMicrophone).unwrap();

    let error = wait_for(&handle, |n| matches!(n, Notification::Error(_))).await;
    assert_eq!(error, Notification::Error(SessionError::TurnNotHeld));

    handle.shutdown();
    timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_failure_ends_session() {
    let connector = Arc::new(OneShotConnector {
        link: Mutex::new(None),
    });
    let config = test_config().with_transport(TransportConfig {
        max_retries: 1,
        reconnect_backoff_ms: 10,
    });

    let (orchestrator, handle) = OrchestratorBuilder::new()
        .with_config(config)
        .with_connector(connector)
        .with_sink_factory(NullSink::factory())
        .build()
        .unwrap();
    let session = orchestrator.start().await.unwrap();

    wait_for(&handle, |n| {
        matches!(n, Notification::Error(SessionError::ConnectionFailed(_)))
    })
    .await;
    wait_for(&handle, |n| matches!(n, Notification::SessionEnded { .. })).await;
    assert!(handle.is_ended());

    handle.shutdown();
    timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
}
