//! Server-sent events transport with per-scope replay.
//!
//! Every event is written with `id: <serial>`, so a reconnecting client that
//! sends `Last-Event-ID` gets the retained events it missed.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use smsdesk::protocol::{Event, RealtimeEvent, Scope};
use std::convert::Infallible;
use std::sync::Arc;

use super::{
    RealtimeError, RealtimeTransport, Rooms, Subscription, TransportKind, authorize_scope,
    parse_scopes,
};
use crate::auth::AuthUser;
use crate::error::ApiFailure;
use crate::state::AppState;

pub struct ChannelHub {
    rooms: Rooms,
}

impl ChannelHub {
    pub fn new(capacity: usize, history: usize) -> Self {
        Self {
            rooms: Rooms::new(capacity, history.max(1)),
        }
    }
}

impl RealtimeTransport for ChannelHub {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn publish(&self, scope: &Scope, event: Event) -> Result<u64, RealtimeError> {
        self.rooms.publish(scope, event)
    }

    fn subscribe(&self, scope: &Scope, resume_after: Option<u64>) -> Subscription {
        self.rooms.subscribe(scope, resume_after)
    }

    fn close(&self) {
        self.rooms.close();
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelQuery {
    scopes: String,
    /// Fallback for clients that cannot send `Last-Event-ID`.
    resume_after: Option<u64>,
}

/// GET /realtime/channel?scopes=a,b
pub async fn channel_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<ChannelQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiFailure> {
    let scopes = parse_scopes(&query.scopes)?;
    for scope in &scopes {
        authorize_scope(&state.store, &user, scope).await?;
    }
    let resume_after = last_event_id(&headers).or(query.resume_after);

    let mut backlog = Vec::new();
    let mut live = Vec::with_capacity(scopes.len());
    for scope in &scopes {
        let (replayed, stream) = state
            .fanout
            .transport()
            .subscribe(scope, resume_after)
            .into_parts();
        backlog.extend(replayed);
        live.push(stream);
    }
    backlog.sort_by_key(|e| e.serial);
    tracing::debug!(
        user = %user.id,
        scopes = scopes.len(),
        replayed = backlog.len(),
        ?resume_after,
        "channel opened"
    );

    let mut shutdown = state.shutdown_signal();
    let stream = async_stream::stream! {
        for event in backlog {
            yield Ok(sse_event(&event));
        }
        let mut live = futures_util::stream::select_all(live);
        loop {
            let next = tokio::select! {
                next = live.next() => next,
                _ = shutdown.changed() => None,
            };
            let Some(event) = next else {
                break;
            };
            yield Ok(sse_event(&event));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn sse_event(event: &RealtimeEvent) -> SseEvent {
    let frame = SseEvent::default()
        .id(event.serial.to_string())
        .event(event.event.name().as_str());
    match frame.json_data(event) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(serial = event.serial, "failed to encode event: {e}");
            SseEvent::default().comment("unencodable event")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use smsdesk::protocol::{Category, Contact};

    fn contact_event(unread: u32) -> Event {
        Event::ContactUpdated {
            contact: Contact {
                id: "c1".into(),
                phone_number_id: "pn-1".into(),
                phone_number: "+15551230001".into(),
                name: None,
                last_message: Some("hi".into()),
                last_message_time: None,
                unread_count: unread,
                is_pinned: false,
                category: Category::General,
            },
        }
    }

    #[tokio::test]
    async fn replays_events_after_resume_point() {
        let hub = ChannelHub::new(8, 4);
        let scope = Scope::Phone("+15550000001".into());
        let first = hub.publish(&scope, contact_event(1)).unwrap();
        let second = hub.publish(&scope, contact_event(2)).unwrap();

        let (backlog, _) = hub.subscribe(&scope, Some(first)).into_parts();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].serial, second);

        let (fresh, _) = hub.subscribe(&scope, None).into_parts();
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let hub = ChannelHub::new(8, 2);
        let scope = Scope::User("u1".into());
        for unread in 0..5 {
            hub.publish(&scope, contact_event(unread)).unwrap();
        }
        let (backlog, _) = hub.subscribe(&scope, Some(0)).into_parts();
        assert_eq!(backlog.len(), 2);
        assert!(backlog[0].serial < backlog[1].serial);
    }

    #[tokio::test]
    async fn live_stream_skips_replayed_serials() {
        let hub = ChannelHub::new(8, 4);
        let scope = Scope::User("u1".into());
        hub.publish(&scope, contact_event(1)).unwrap();
        let mut stream = hub.subscribe(&scope, Some(0)).into_stream();
        let replayed = stream.next().await.unwrap();
        let live = hub.publish(&scope, contact_event(2)).unwrap();
        let next = stream.next().await.unwrap();
        assert!(next.serial > replayed.serial);
        assert_eq!(next.serial, live);
    }

    #[test]
    fn last_event_id_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_event_id(&headers), None);
        headers.insert("last-event-id", HeaderValue::from_static(" 42"));
        assert_eq!(last_event_id(&headers), Some(42));
        headers.insert("last-event-id", HeaderValue::from_static("abc"));
        assert_eq!(last_event_id(&headers), None);
    }
}
