//! WebSocket connector: subscribe to each scope, then forward event frames.

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use smsdesk::protocol::{Scope, SocketClientFrame, SocketServerFrame};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{EventStream, RealtimeConnector, RealtimeError};

/// Keep-alive ping cadence while the socket is idle.
const PING_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Clone)]
pub struct SocketConnector {
    base_url: String,
    token: String,
}

impl SocketConnector {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// `http(s)://host` becomes `ws(s)://host/realtime/socket?token=...`.
    pub fn socket_url(&self) -> Result<Url, RealtimeError> {
        let mut url = Url::parse(&format!("{}/realtime/socket", self.base_url))
            .map_err(|e| RealtimeError::Connect(format!("invalid server url: {e}")))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| RealtimeError::Connect("cannot build websocket url".into()))?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }
}

impl RealtimeConnector for SocketConnector {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn connect(
        &self,
        scopes: &[Scope],
        _resume_after: Option<u64>,
    ) -> impl Future<Output = Result<EventStream, RealtimeError>> + Send {
        let url = self.socket_url();
        let scopes = scopes.to_vec();
        async move {
            let url = url?;
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| RealtimeError::Connect(e.to_string()))?;
            let (mut sink, mut source) = ws.split();

            for scope in &scopes {
                let frame = serde_json::to_string(&SocketClientFrame::Subscribe {
                    scope: scope.clone(),
                })
                .map_err(|e| RealtimeError::Stream(e.to_string()))?;
                sink.send(WsMessage::Text(frame.into()))
                    .await
                    .map_err(|e| RealtimeError::Connect(e.to_string()))?;
            }

            // Wait for every subscription to be acknowledged; events that
            // arrive meanwhile are kept.
            let mut pending: HashSet<Scope> = scopes.iter().cloned().collect();
            let mut early = Vec::new();
            while !pending.is_empty() {
                let Some(msg) = source.next().await else {
                    return Err(RealtimeError::Connect("closed during subscribe".into()));
                };
                let msg = msg.map_err(|e| RealtimeError::Connect(e.to_string()))?;
                let WsMessage::Text(text) = msg else {
                    continue;
                };
                match serde_json::from_str::<SocketServerFrame>(&text) {
                    Ok(SocketServerFrame::Subscribed { scope }) => {
                        pending.remove(&scope);
                    }
                    Ok(SocketServerFrame::Error { message, scope }) => {
                        let scope = scope.map(|s| s.to_string()).unwrap_or_default();
                        return Err(RealtimeError::Rejected(format!("{scope} {message}").trim().to_string()));
                    }
                    Ok(SocketServerFrame::Event { event }) => early.push(event),
                    Ok(_) => {}
                    Err(e) => return Err(RealtimeError::Decode(e.to_string())),
                }
            }
            tracing::debug!(scopes = scopes.len(), "socket subscriptions acknowledged");

            let stream = async_stream::stream! {
                for event in early {
                    yield Ok(event);
                }
                let mut ping = tokio::time::interval(PING_INTERVAL);
                ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ping.tick().await;
                loop {
                    tokio::select! {
                        msg = source.next() => {
                            let msg = match msg {
                                Some(Ok(msg)) => msg,
                                Some(Err(e)) => {
                                    yield Err(RealtimeError::Stream(e.to_string()));
                                    break;
                                }
                                None => break,
                            };
                            match msg {
                                WsMessage::Text(text) => match serde_json::from_str::<SocketServerFrame>(&text) {
                                    Ok(SocketServerFrame::Event { event }) => yield Ok(event),
                                    Ok(SocketServerFrame::Error { message, .. }) => {
                                        tracing::warn!("socket error frame: {message}");
                                    }
                                    Ok(_) => {}
                                    Err(e) => tracing::warn!("undecodable socket frame: {e}"),
                                },
                                WsMessage::Close(_) => break,
                                _ => {}
                            }
                        }
                        _ = ping.tick() => {
                            let Ok(frame) = serde_json::to_string(&SocketClientFrame::Ping) else {
                                continue;
                            };
                            if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                                yield Err(RealtimeError::Stream(e.to_string()));
                                break;
                            }
                        }
                    }
                }
            };
            let stream: EventStream = Box::pin(stream);
            Ok(stream)
        }
    }
}
