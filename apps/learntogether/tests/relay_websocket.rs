use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use learntogether_core::CallConfig;
use learntogether_core::call::CallSession;
use learntogether_core::call::mock::{LinkCall, MockMedia, MockPeerFactory};
use learntogether_core::call::phase::{CallCommand, CallPhase, SessionEvent};
use learntogether_core::call::relay::{
    RelayConnector, RelayEvents, WebSocketRelayConnector, websocket_url,
};
use learntogether_core::call::retry::RetryPolicy;
use relay_proto::{ClientEvent, RelayEvent, SdpKind, SessionDescription};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{sleep, timeout};

#[derive(Default)]
struct RelayState {
    waiting: Option<String>,
    clients: HashMap<String, mpsc::UnboundedSender<RelayEvent>>,
    partners: HashMap<String, String>,
}

type SharedRelay = Arc<AsyncMutex<RelayState>>;

/// Pairs clients in arrival order and forwards addressed frames by name.
async fn spawn_relay() -> String {
    let state = SharedRelay::default();
    let router = Router::new()
        .route("/relay", get(ws_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}/relay")
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedRelay>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedRelay) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayEvent>();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = event.to_frame().expect("encode relay frame");
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut me: Option<String> = None;
    while let Some(Ok(msg)) = receiver.next().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let Ok(event) = ClientEvent::from_frame(&text) else {
            let _ = tx.send(RelayEvent::Error {
                message: "malformed frame".into(),
            });
            continue;
        };
        let mut relay = state.lock().await;
        let from = me.clone().unwrap_or_default();
        match event {
            ClientEvent::Register { name } => {
                relay.clients.insert(name.clone(), tx.clone());
                me = Some(name.clone());
                match relay.waiting.take() {
                    Some(other) if other != name => {
                        if let Some(peer) = relay.clients.get(&other) {
                            let _ = peer.send(RelayEvent::PeerJoined {
                                peer_id: format!("sock-{name}"),
                                peer_name: name.clone(),
                            });
                        }
                        let _ = tx.send(RelayEvent::PeerReady {
                            peer_id: format!("sock-{other}"),
                            peer_name: other.clone(),
                        });
                        relay.partners.insert(name.clone(), other.clone());
                        relay.partners.insert(other, name);
                    }
                    _ => {
                        relay.waiting = Some(name);
                        let _ = tx.send(RelayEvent::Waiting);
                    }
                }
            }
            ClientEvent::Offer { offer, to } => {
                forward(&relay, &to, RelayEvent::OfferReceived { offer, from });
            }
            ClientEvent::Answer { answer, to } => {
                forward(&relay, &to, RelayEvent::AnswerReceived { answer });
            }
            ClientEvent::IceCandidate { candidate, to } => {
                forward(&relay, &to, RelayEvent::IceCandidateReceived { candidate });
            }
            ClientEvent::ChatMessage { sender, text } => {
                if let Some(partner) = relay.partners.get(&from) {
                    forward(&relay, partner, RelayEvent::ChatMessage { sender, text });
                }
            }
            _ => {}
        }
    }

    if let Some(name) = me {
        let mut relay = state.lock().await;
        relay.clients.remove(&name);
        if relay.waiting.as_deref() == Some(name.as_str()) {
            relay.waiting = None;
        }
        if let Some(partner) = relay.partners.remove(&name) {
            relay.partners.remove(&partner);
            forward(&relay, &partner, RelayEvent::PeerDisconnected);
        }
    }
    writer.abort();
}

fn forward(relay: &RelayState, to: &str, event: RelayEvent) {
    if let Some(peer) = relay.clients.get(to) {
        let _ = peer.send(event);
    }
}

async fn next_event(events: &mut RelayEvents) -> RelayEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("relay event in time")
        .expect("relay stream open")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn relay_urls_accept_http_forms() {
    assert_eq!(
        websocket_url("https://relay.example.com/relay").unwrap().scheme(),
        "wss"
    );
}

#[tokio::test]
async fn websocket_client_speaks_event_frames() {
    let url = spawn_relay().await;
    let connector = WebSocketRelayConnector;

    let (ada, mut ada_events) = connector.connect(&url).await.expect("ada connects");
    ada.send(ClientEvent::Register { name: "Ada".into() }).unwrap();
    assert_eq!(next_event(&mut ada_events).await, RelayEvent::Waiting);

    let (bo, mut bo_events) = connector.connect(&url).await.expect("bo connects");
    bo.send(ClientEvent::Register { name: "Bo".into() }).unwrap();
    assert_eq!(
        next_event(&mut bo_events).await,
        RelayEvent::PeerReady {
            peer_id: "sock-Ada".into(),
            peer_name: "Ada".into()
        }
    );
    assert_eq!(
        next_event(&mut ada_events).await,
        RelayEvent::PeerJoined {
            peer_id: "sock-Bo".into(),
            peer_name: "Bo".into()
        }
    );

    let offer = SessionDescription::offer("v=0\r\n");
    ada.send(ClientEvent::Offer {
        offer: offer.clone(),
        to: "Bo".into(),
    })
    .unwrap();
    assert_eq!(
        next_event(&mut bo_events).await,
        RelayEvent::OfferReceived {
            offer,
            from: "Ada".into()
        }
    );

    bo.close().await;
    assert_eq!(next_event(&mut ada_events).await, RelayEvent::PeerDisconnected);
    ada.close().await;
}

#[tokio::test]
async fn connecting_to_a_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = WebSocketRelayConnector
        .connect(&format!("ws://{addr}/relay"))
        .await;
    assert!(result.is_err());
}

struct Caller {
    commands: mpsc::UnboundedSender<CallCommand>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    peers: Arc<MockPeerFactory>,
    task: tokio::task::JoinHandle<()>,
}

fn start_caller(label: &str, relay_url: &str) -> Caller {
    let peers = Arc::new(MockPeerFactory::new(label));
    let config = CallConfig {
        relay_url: relay_url.to_string(),
        relay_retry: RetryPolicy::once(),
        ..CallConfig::default()
    };
    let (session, events) = CallSession::new(
        config,
        Arc::new(MockMedia::granting()),
        peers.clone(),
        Arc::new(WebSocketRelayConnector),
    );
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(session.run(commands_rx));
    Caller {
        commands,
        events,
        peers,
        task,
    }
}

async fn wait_for(caller: &mut Caller, mut want: impl FnMut(&SessionEvent) -> bool) {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = caller.events.recv().await {
            if want(&event) {
                return;
            }
        }
        panic!("session ended early");
    })
    .await
    .expect("session event in time");
}

fn negotiated(peers: &MockPeerFactory, kind: SdpKind) -> bool {
    peers
        .latest()
        .is_some_and(|link| link.count(&LinkCall::SetRemote(kind)) == 1)
}

#[tokio::test]
async fn two_sessions_negotiate_through_the_relay() {
    let url = spawn_relay().await;

    let mut ada = start_caller("ada", &url);
    ada.commands
        .send(CallCommand::Join { name: "Ada".into() })
        .unwrap();
    wait_for(&mut ada, |e| {
        *e == SessionEvent::PhaseChanged(CallPhase::WaitingForPeer)
    })
    .await;

    let mut bo = start_caller("bo", &url);
    bo.commands
        .send(CallCommand::Join { name: "Bo".into() })
        .unwrap();

    // Whoever registered first offers; the other answers.
    eventually("offer/answer exchange", || {
        (negotiated(&ada.peers, SdpKind::Answer) && negotiated(&bo.peers, SdpKind::Offer))
            || (negotiated(&ada.peers, SdpKind::Offer) && negotiated(&bo.peers, SdpKind::Answer))
    })
    .await;

    ada.commands
        .send(CallCommand::SendChat {
            text: "hello over the relay".into(),
        })
        .unwrap();
    wait_for(&mut bo, |e| {
        matches!(e, SessionEvent::Chat(entry) if !entry.local && entry.text == "hello over the relay")
    })
    .await;

    ada.commands.send(CallCommand::Shutdown).unwrap();
    timeout(Duration::from_secs(5), ada.task)
        .await
        .expect("ada stops")
        .unwrap();

    // The relay reports the departure and Bo goes back to waiting.
    wait_for(&mut bo, |e| {
        *e == SessionEvent::PhaseChanged(CallPhase::WaitingForPeer)
    })
    .await;
    assert_eq!(bo.peers.latest().unwrap().close_count(), 1);

    bo.commands.send(CallCommand::Shutdown).unwrap();
    timeout(Duration::from_secs(5), bo.task)
        .await
        .expect("bo stops")
        .unwrap();
}
