//! Inbound frame parsing and dispatch.
//!
//! Clients send one JSON object per text frame:
//! `{"type": "join", "name": ...}` or `{"type": "message", "content": ...}`.
//! Nothing is ever sent back as an error; bad frames are logged and dropped.

use serde_json::Value;

use crate::state::AppState;
use crate::ws::broadcast::{broadcast_except, format_line, send_line};
use crate::ws::{ConnectionId, ConnectionSender, RegistryError};

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Join { name: String },
    Message { content: String },
    /// Any other (or missing) `type`. Ignored.
    Unknown { kind: Option<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("`{kind}` frame has no string field `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

impl FrameError {
    /// True for frames that could not be decoded at all, as opposed to
    /// well-formed frames missing a required field.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::NotAnObject)
    }
}

/// Decode one text frame.
///
/// `name` and `content` must be JSON strings; `null`, numbers and other
/// types count as missing.
pub fn parse_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(fields) = value else {
        return Err(FrameError::NotAnObject);
    };

    let string_field = |kind: &'static str, field: &'static str| {
        fields
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(FrameError::MissingField { kind, field })
    };

    match fields.get("type").and_then(Value::as_str) {
        Some("join") => Ok(ClientFrame::Join {
            name: string_field("join", "name")?,
        }),
        Some("message") => Ok(ClientFrame::Message {
            content: string_field("message", "content")?,
        }),
        other => Ok(ClientFrame::Unknown {
            kind: other.map(str::to_string),
        }),
    }
}

/// Handle an incoming text frame from `connection_id`.
/// `tx` is that connection's own outbound queue (used for history replay).
pub async fn handle_text_message(
    text: &str,
    connection_id: ConnectionId,
    tx: &ConnectionSender,
    state: &AppState,
) {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(err) if err.is_malformed() => {
            tracing::warn!(
                connection_id = %connection_id,
                error = %err,
                payload = %text,
                "Invalid message received"
            );
            return;
        }
        Err(err) => {
            tracing::debug!(
                connection_id = %connection_id,
                error = %err,
                "Dropping incomplete frame"
            );
            return;
        }
    };

    dispatch_frame(frame, connection_id, tx, state).await;
}

async fn dispatch_frame(
    frame: ClientFrame,
    connection_id: ConnectionId,
    tx: &ConnectionSender,
    state: &AppState,
) {
    match frame {
        ClientFrame::Join { name } => {
            handle_join(&name, connection_id, tx, state).await;
        }
        ClientFrame::Message { content } => {
            handle_chat_message(&content, connection_id, state).await;
        }
        ClientFrame::Unknown { kind } => {
            tracing::debug!(
                connection_id = %connection_id,
                kind = ?kind,
                "Ignoring frame with unknown type"
            );
        }
    }
}

/// Name the session, then replay the full history to it.
///
/// Runs under the exclusive delivery gate, so no message can be appended
/// between loading the history and queueing it. Every later message is
/// broadcast after the replay lines are already queued.
async fn handle_join(
    name: &str,
    connection_id: ConnectionId,
    tx: &ConnectionSender,
    state: &AppState,
) {
    let _gate = state.delivery_gate.write().await;

    match state.sessions.set_name(connection_id, name) {
        Ok(()) => {
            tracing::info!(
                connection_id = %connection_id,
                name = %name,
                "Client joined"
            );
        }
        Err(RegistryError::NotFound(_)) => {
            // Closed while this frame was in flight.
            return;
        }
        Err(err @ RegistryError::AlreadyNamed { .. }) => {
            tracing::debug!(
                connection_id = %connection_id,
                error = %err,
                "Ignoring repeated join"
            );
            return;
        }
    }

    let history = match state.log.load_all().await {
        Ok(history) => history,
        Err(err) => {
            tracing::error!(
                connection_id = %connection_id,
                error = %err,
                "Failed to load chat history, replaying nothing"
            );
            Vec::new()
        }
    };

    let mut replayed = 0usize;
    for record in &history {
        if !send_line(tx, &format_line(&record.name, &record.content)) {
            break;
        }
        replayed += 1;
    }

    tracing::debug!(
        connection_id = %connection_id,
        replayed,
        "History replayed"
    );
}

/// Persist a chat message, then fan it out to every other connection.
///
/// Frames from sessions that have not joined are dropped. A failed append is
/// logged and the broadcast still goes out.
async fn handle_chat_message(content: &str, connection_id: ConnectionId, state: &AppState) {
    let Some(name) = state.sessions.name_of(connection_id) else {
        tracing::debug!(
            connection_id = %connection_id,
            "Dropping message from session that has not joined"
        );
        return;
    };

    let _gate = state.delivery_gate.read().await;

    if let Err(err) = state.log.append(&name, content).await {
        tracing::error!(
            connection_id = %connection_id,
            error = %err,
            "Error writing to chat log"
        );
    }

    let line = format_line(&name, content);
    let delivered = broadcast_except(&state.sessions, connection_id, &line);

    tracing::debug!(
        connection_id = %connection_id,
        delivered,
        "Message broadcast"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageLog;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct TestConn {
        id: ConnectionId,
        tx: ConnectionSender,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl TestConn {
        fn open(state: &AppState) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = Uuid::now_v7();
            state.sessions.register(id, tx.clone());
            Self { id, tx, rx }
        }

        async fn send(&self, state: &AppState, frame: &str) {
            handle_text_message(frame, self.id, &self.tx, state).await;
        }

        fn drain(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    Message::Text(text) => lines.push(text.as_str().to_string()),
                    other => panic!("Expected text message, got: {:?}", other),
                }
            }
            lines
        }
    }

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let state = AppState::new(MessageLog::new(dir.path().join("chat.log")));
        (dir, state)
    }

    #[test]
    fn test_parse_join_and_message() {
        assert_eq!(
            parse_frame(r#"{"type":"join","name":"Alice"}"#).unwrap(),
            ClientFrame::Join {
                name: "Alice".to_string()
            }
        );
        assert_eq!(
            parse_frame(r#"{"type":"message","content":"hi","extra":1}"#).unwrap(),
            ClientFrame::Message {
                content: "hi".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unknown_or_missing_type() {
        assert_eq!(
            parse_frame(r#"{"type":"typing"}"#).unwrap(),
            ClientFrame::Unknown {
                kind: Some("typing".to_string())
            }
        );
        assert_eq!(
            parse_frame(r#"{"name":"Alice"}"#).unwrap(),
            ClientFrame::Unknown { kind: None }
        );
        assert_eq!(
            parse_frame(r#"{"type":7}"#).unwrap(),
            ClientFrame::Unknown { kind: None }
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_frame("not json").unwrap_err().is_malformed());
        assert!(parse_frame("{\"type\":").unwrap_err().is_malformed());
        assert!(parse_frame("[1,2,3]").unwrap_err().is_malformed());
        assert!(parse_frame("\"join\"").unwrap_err().is_malformed());
    }

    #[test]
    fn test_parse_requires_string_fields() {
        for frame in [
            r#"{"type":"join"}"#,
            r#"{"type":"join","name":null}"#,
            r#"{"type":"join","name":42}"#,
        ] {
            let err = parse_frame(frame).unwrap_err();
            assert!(!err.is_malformed());
            assert!(matches!(
                err,
                FrameError::MissingField {
                    kind: "join",
                    field: "name"
                }
            ));
        }
        assert!(matches!(
            parse_frame(r#"{"type":"message","content":["hi"]}"#),
            Err(FrameError::MissingField {
                kind: "message",
                field: "content"
            })
        ));
    }

    #[tokio::test]
    async fn test_message_before_join_is_dropped() {
        let (_dir, state) = test_state();
        let sender = TestConn::open(&state);
        let mut other = TestConn::open(&state);

        sender
            .send(&state, r#"{"type":"message","content":"too early"}"#)
            .await;

        assert!(other.drain().is_empty());
        assert!(state.log.load_all().await.unwrap().is_empty());
        assert_eq!(state.sessions.name_of(sender.id), None);
    }

    #[tokio::test]
    async fn test_message_is_persisted_and_broadcast_to_others_only() {
        let (_dir, state) = test_state();
        let mut alice = TestConn::open(&state);
        let mut bob = TestConn::open(&state);
        let mut lurker = TestConn::open(&state);

        alice.send(&state, r#"{"type":"join","name":"Alice"}"#).await;
        bob.send(&state, r#"{"type":"join","name":"Bob"}"#).await;
        alice
            .send(&state, r#"{"type":"message","content":"hi"}"#)
            .await;

        assert!(alice.drain().is_empty());
        assert_eq!(bob.drain(), vec!["Alice: hi"]);
        // Not-yet-joined connections still receive live broadcasts.
        assert_eq!(lurker.drain(), vec!["Alice: hi"]);

        let history = state.log.load_all().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].name, "Alice");
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn test_join_replays_full_history_in_order() {
        let (_dir, state) = test_state();
        state.log.append("Alice", "one").await.unwrap();
        state.log.append("Bob", "two").await.unwrap();
        state.log.append("Alice", "three").await.unwrap();

        let mut carol = TestConn::open(&state);
        carol.send(&state, r#"{"type":"join","name":"Carol"}"#).await;

        assert_eq!(
            carol.drain(),
            vec!["Alice: one", "Bob: two", "Alice: three"]
        );
        assert_eq!(state.sessions.name_of(carol.id).as_deref(), Some("Carol"));
    }

    #[tokio::test]
    async fn test_second_join_neither_renames_nor_replays() {
        let (_dir, state) = test_state();
        state.log.append("Old", "history").await.unwrap();

        let mut alice = TestConn::open(&state);
        alice.send(&state, r#"{"type":"join","name":"Alice"}"#).await;
        assert_eq!(alice.drain(), vec!["Old: history"]);

        alice.send(&state, r#"{"type":"join","name":"Mallory"}"#).await;
        assert!(alice.drain().is_empty());
        assert_eq!(state.sessions.name_of(alice.id).as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_join_without_string_name_leaves_session_unnamed() {
        let (_dir, state) = test_state();
        let alice = TestConn::open(&state);
        let mut bob = TestConn::open(&state);

        alice.send(&state, r#"{"type":"join","name":42}"#).await;
        alice
            .send(&state, r#"{"type":"message","content":"hi"}"#)
            .await;

        assert_eq!(state.sessions.name_of(alice.id), None);
        assert!(bob.drain().is_empty());
        assert!(state.log.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_changes_nothing() {
        let (_dir, state) = test_state();
        let mut alice = TestConn::open(&state);
        let mut bob = TestConn::open(&state);

        alice.send(&state, "{definitely not json").await;
        alice.send(&state, r#"{"type":"unknown"}"#).await;
        assert_eq!(state.sessions.name_of(alice.id), None);
        assert!(alice.drain().is_empty());
        assert!(bob.drain().is_empty());

        // Still usable afterwards.
        alice.send(&state, r#"{"type":"join","name":"Alice"}"#).await;
        alice
            .send(&state, r#"{"type":"message","content":"still here"}"#)
            .await;
        assert_eq!(bob.drain(), vec!["Alice: still here"]);
    }

    #[tokio::test]
    async fn test_broadcast_survives_persistence_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for append.
        let state = AppState::new(MessageLog::new(dir.path()));
        let alice = TestConn::open(&state);
        let mut bob = TestConn::open(&state);

        alice.send(&state, r#"{"type":"join","name":"Alice"}"#).await;
        alice
            .send(&state, r#"{"type":"message","content":"hi"}"#)
            .await;

        assert_eq!(bob.drain(), vec!["Alice: hi"]);
    }

    #[tokio::test]
    async fn test_closed_connection_is_skipped() {
        let (_dir, state) = test_state();
        let alice = TestConn::open(&state);
        let gone = TestConn::open(&state);
        let mut bob = TestConn::open(&state);
        alice.send(&state, r#"{"type":"join","name":"Alice"}"#).await;

        state.sessions.unregister(gone.id);
        drop(gone);

        alice
            .send(&state, r#"{"type":"message","content":"hi"}"#)
            .await;
        assert_eq!(bob.drain(), vec!["Alice: hi"]);
        assert_eq!(state.sessions.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_during_message_stream_sees_every_message_once() {
        const TOTAL: usize = 300;
        const JOIN_AFTER: usize = 20;

        let (_dir, state) = test_state();
        let alice = TestConn::open(&state);
        alice.send(&state, r#"{"type":"join","name":"Alice"}"#).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let sender_state = state.clone();
        let sender = tokio::spawn(async move {
            let mut started_tx = Some(started_tx);
            for i in 0..TOTAL {
                let frame = format!(r#"{{"type":"message","content":"m{}"}}"#, i);
                alice.send(&sender_state, &frame).await;
                if i + 1 == JOIN_AFTER {
                    if let Some(tx) = started_tx.take() {
                        let _ = tx.send(());
                    }
                }
                tokio::task::yield_now().await;
            }
        });

        // Connect and join while Alice is still sending.
        started_rx.await.unwrap();
        let mut carol = TestConn::open(&state);
        carol.send(&state, r#"{"type":"join","name":"Carol"}"#).await;
        sender.await.unwrap();

        let expected: Vec<String> = (0..TOTAL).map(|i| format!("Alice: m{}", i)).collect();
        let received = carol.drain();

        // Lines before the replay are live traffic Carol got while unnamed;
        // from the replay on she sees the whole log exactly once, in order.
        let replay_start = received
            .iter()
            .position(|line| line == "Alice: m0")
            .expect("Replay should start with the first message");
        assert_eq!(&received[replay_start..], &expected[..]);
        for line in &received[..replay_start] {
            assert!(expected[JOIN_AFTER..].contains(line), "Unexpected line: {}", line);
        }

        assert_eq!(state.log.load_all().await.unwrap().len(), TOTAL);
    }
}
