//! WebSocket transport: clients join and leave scope rooms with control frames.

use anyhow::Result;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use smsdesk::protocol::{Event, Scope, SocketClientFrame, SocketServerFrame, User};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{RealtimeError, RealtimeTransport, Rooms, Subscription, TransportKind, authorize_scope};
use crate::auth::AuthUser;
use crate::state::AppState;

/// Outbound frames buffered per connection before the writer applies backpressure.
const OUTBOUND_BUFFER: usize = 256;

/// Room map without history. A client that reconnects re-fetches instead of replaying.
pub struct SocketHub {
    rooms: Rooms,
}

impl SocketHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Rooms::new(capacity, 0),
        }
    }
}

impl RealtimeTransport for SocketHub {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn publish(&self, scope: &Scope, event: Event) -> Result<u64, RealtimeError> {
        self.rooms.publish(scope, event)
    }

    fn subscribe(&self, scope: &Scope, _resume_after: Option<u64>) -> Subscription {
        self.rooms.subscribe(scope, None)
    }

    fn close(&self) {
        self.rooms.close();
    }
}

/// GET /realtime/socket
pub async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket_task(socket, state, user))
}

async fn socket_task(socket: WebSocket, state: Arc<AppState>, user: User) {
    tracing::debug!(user = %user.id, "socket connected");
    if let Err(err) = socket_inner(socket, state, &user).await {
        tracing::warn!(user = %user.id, "socket closed with error: {err}");
    } else {
        tracing::debug!(user = %user.id, "socket closed");
    }
}

async fn socket_inner(socket: WebSocket, state: Arc<AppState>, user: &User) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<SocketServerFrame>(OUTBOUND_BUFFER);
    let mut subscriptions: HashMap<Scope, JoinHandle<()>> = HashMap::new();
    let mut shutdown = state.shutdown_signal();

    let result = async {
        loop {
            tokio::select! {
                Some(frame) = out_rx.recv() => {
                    ws_tx.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;
                }
                maybe_msg = ws_rx.next() => {
                    let Some(msg) = maybe_msg else {
                        break;
                    };
                    match msg? {
                        Message::Text(text) => {
                            let reply = match serde_json::from_str::<SocketClientFrame>(&text) {
                                Ok(frame) => {
                                    handle_frame(&state, user, frame, &mut subscriptions, &out_tx).await
                                }
                                Err(e) => SocketServerFrame::Error {
                                    message: format!("invalid frame: {e}"),
                                    scope: None,
                                },
                            };
                            ws_tx.send(Message::Text(serde_json::to_string(&reply)?.into())).await?;
                        }
                        Message::Close(_) => break,
                        Message::Ping(v) => ws_tx.send(Message::Pong(v)).await?,
                        Message::Pong(_) | Message::Binary(_) => {}
                    }
                }
                _ = shutdown.changed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        anyhow::Ok(())
    }
    .await;

    for (_, handle) in subscriptions.drain() {
        handle.abort();
    }
    result
}

async fn handle_frame(
    state: &Arc<AppState>,
    user: &User,
    frame: SocketClientFrame,
    subscriptions: &mut HashMap<Scope, JoinHandle<()>>,
    out_tx: &mpsc::Sender<SocketServerFrame>,
) -> SocketServerFrame {
    match frame {
        SocketClientFrame::Subscribe { scope } => {
            if subscriptions.contains_key(&scope) {
                return SocketServerFrame::Subscribed { scope };
            }
            if let Err(e) = authorize_scope(&state.store, user, &scope).await {
                return SocketServerFrame::Error {
                    message: e.to_string(),
                    scope: Some(scope),
                };
            }
            let mut events = state.fanout.transport().subscribe(&scope, None).into_stream();
            let tx = out_tx.clone();
            let handle = tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if tx.send(SocketServerFrame::Event { event }).await.is_err() {
                        break;
                    }
                }
            });
            tracing::debug!(user = %user.id, %scope, "subscribed");
            subscriptions.insert(scope.clone(), handle);
            SocketServerFrame::Subscribed { scope }
        }
        SocketClientFrame::Unsubscribe { scope } => {
            if let Some(handle) = subscriptions.remove(&scope) {
                handle.abort();
                tracing::debug!(user = %user.id, %scope, "unsubscribed");
            }
            SocketServerFrame::Unsubscribed { scope }
        }
        SocketClientFrame::Ping => SocketServerFrame::Pong,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smsdesk::protocol::{Direction, Message as SmsMessage};

    fn message_event() -> Event {
        Event::NewMessage {
            message: SmsMessage {
                id: "m1".into(),
                phone_number_id: "pn-1".into(),
                from: "+15551230001".into(),
                to: "+15550000001".into(),
                body: "hi".into(),
                direction: Direction::Inbound,
                timestamp: chrono::Utc::now(),
                sid: Some("SM1".into()),
            },
        }
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber_of_a_scope() {
        let hub = SocketHub::new(8);
        let scope = Scope::Phone("+15550000001".into());
        let mut a = hub.subscribe(&scope, None).into_stream();
        let mut b = hub.subscribe(&scope, None).into_stream();
        assert_eq!(hub.rooms.subscriber_count(&scope), 2);

        let serial = hub.publish(&scope, message_event()).unwrap();
        assert_eq!(a.next().await.unwrap().serial, serial);
        assert_eq!(b.next().await.unwrap().serial, serial);
    }

    #[tokio::test]
    async fn no_replay_without_history() {
        let hub = SocketHub::new(8);
        let scope = Scope::User("u1".into());
        let _keep = hub.subscribe(&scope, None);
        hub.publish(&scope, message_event()).unwrap();

        let (backlog, _) = hub.subscribe(&scope, Some(0)).into_parts();
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let hub = SocketHub::new(8);
        let mine = Scope::User("u1".into());
        let theirs = Scope::User("u2".into());
        let mut stream = hub.subscribe(&mine, None).into_stream();
        hub.publish(&theirs, message_event()).unwrap();
        let serial = hub.publish(&mine, message_event()).unwrap();
        assert_eq!(stream.next().await.unwrap().serial, serial);
    }
}
