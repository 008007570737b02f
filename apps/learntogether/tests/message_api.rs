use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use conversation_id::CounterpartBook;
use learntogether_core::call::mock::MockRelayConnector;
use learntogether_core::call::relay::RelayConnector;
use learntogether_core::chat::{ChatError, ConversationRoom, MessageApi};
use relay_proto::{ChatMessage, ClientEvent, NewMessage};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;

const TOKEN: &str = "secret-token";

#[derive(Clone, Default)]
struct Store {
    messages: Arc<AsyncMutex<Vec<ChatMessage>>>,
    raw_paths: Arc<AsyncMutex<Vec<String>>>,
    bodies: Arc<AsyncMutex<Vec<Value>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
}

async fn list_messages(
    State(store): State<Store>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatMessage>>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    store.raw_paths.lock().await.push(uri.path().to_string());
    let messages = store.messages.lock().await;
    Ok(Json(
        messages
            .iter()
            .filter(|m| m.conversation_id == id)
            .cloned()
            .collect(),
    ))
}

async fn create_message(
    State(store): State<Store>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<ChatMessage>), StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    store.bodies.lock().await.push(body.clone());
    let new: NewMessage =
        serde_json::from_value(body).map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;
    let mut messages = store.messages.lock().await;
    let stored = ChatMessage {
        id: Some(format!("m{}", messages.len() + 1)),
        conversation_id: new.conversation_id,
        sender_id: new.sender_id,
        sender_name: new.sender_name,
        text: new.text,
        timestamp: Utc::now(),
    };
    messages.push(stored.clone());
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn spawn_api() -> (String, Store) {
    let store = Store::default();
    let router = Router::new()
        .route("/api/messages", post(create_message))
        .route("/api/messages/:id", get(list_messages))
        .with_state(store.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (format!("http://{addr}"), store)
}

fn new_message(conversation_id: &str, text: &str) -> NewMessage {
    NewMessage {
        conversation_id: conversation_id.into(),
        sender_id: "u1".into(),
        sender_name: "Ada".into(),
        recipient_id: "u2".into(),
        text: text.into(),
    }
}

#[tokio::test]
async fn posts_and_lists_messages() {
    let (base, store) = spawn_api().await;
    let api = MessageApi::new(&base, Some(TOKEN.into())).unwrap();

    let stored = api.post(&new_message("u1:u2", "first")).await.unwrap();
    assert_eq!(stored.id.as_deref(), Some("m1"));
    api.post(&new_message("u1:u3", "elsewhere")).await.unwrap();

    let history = api.history("u1:u2").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "first");

    let bodies = store.bodies.lock().await;
    assert_eq!(bodies[0]["conversationId"], "u1:u2");
    assert_eq!(bodies[0]["recipientId"], "u2");
}

#[tokio::test]
async fn history_path_keeps_the_id_in_one_segment() {
    let (base, store) = spawn_api().await;
    let api = MessageApi::new(&base, Some(TOKEN.into())).unwrap();
    let id = "shelf/7|u1:u2";
    api.post(&new_message(id, "scoped")).await.unwrap();

    let history = api.history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        store.raw_paths.lock().await.as_slice(),
        ["/api/messages/shelf%2F7|u1:u2".to_string()]
    );
}

#[tokio::test]
async fn rejected_requests_report_status() {
    let (base, _store) = spawn_api().await;
    let api = MessageApi::new(&base, None).unwrap();

    match api.history("u1:u2").await {
        Err(ChatError::UnexpectedStatus { status, .. }) => {
            assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED)
        }
        other => panic!("expected unauthorized, got {other:?}"),
    }
}

#[tokio::test]
async fn room_persists_then_broadcasts() {
    let (base, store) = spawn_api().await;
    let api = MessageApi::new(&base, Some(TOKEN.into())).unwrap();
    let relay = MockRelayConnector::new();
    let (link, _events) = relay.connect("ws://relay").await.unwrap();
    let mut book = CounterpartBook::new();

    let room = ConversationRoom::open("book-3|u2:u1", "u1", "Ada", link, api, &mut book);
    assert_eq!(book.all("book-3"), ["u2".to_string()]);
    room.join().unwrap();

    let stored = room.send("is the book still available?").await.unwrap();
    assert_eq!(stored.conversation_id, "book-3|u1:u2");
    assert_eq!(store.messages.lock().await.len(), 1);
    assert_eq!(store.bodies.lock().await[0]["recipientId"], "u2");

    let sent = relay.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[0],
        ClientEvent::ChatJoin {
            conversation_id: "book-3|u1:u2".into()
        }
    );
    assert_eq!(sent[1], ClientEvent::ChatBroadcast(stored.clone()));

    let history = room.history().await.unwrap();
    assert_eq!(history, vec![stored]);
}
