//! Real-time fan-out: change hints pushed to connected clients, scoped by user,
//! admin or phone number.
//!
//! Two transports implement [`RealtimeTransport`]; a deployment mounts exactly
//! one. Delivery is at-least-once and best effort. Clients treat every event
//! as a reason to re-fetch, never as state.

pub mod channel;
pub mod socket;

use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use smsdesk::protocol::{Event, PhoneNumber, RealtimeEvent, Role, Scope, User};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::ApiFailure;
use crate::state::Store;

pub use channel::ChannelHub;
pub use socket::SocketHub;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bidirectional WebSocket with subscribe/unsubscribe frames.
    Socket,
    /// Server-sent events with per-scope replay.
    Channel,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Socket => "socket",
            TransportKind::Channel => "channel",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socket" => Ok(TransportKind::Socket),
            "channel" => Ok(TransportKind::Channel),
            other => Err(format!("unknown transport: {other} (expected socket or channel)")),
        }
    }
}

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("real-time transport is closed")]
    Closed,
}

/// Publish/subscribe seam shared by both transports.
pub trait RealtimeTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Publish to one scope. Returns the serial assigned to the event.
    fn publish(&self, scope: &Scope, event: Event) -> Result<u64, RealtimeError>;

    /// Subscribe to one scope, replaying retained events newer than `resume_after`.
    fn subscribe(&self, scope: &Scope, resume_after: Option<u64>) -> Subscription;

    /// Drop every room so open streams end.
    fn close(&self);
}

pub type LiveStream = Pin<Box<dyn Stream<Item = RealtimeEvent> + Send>>;

/// Replayed backlog plus the live feed for one scope.
pub struct Subscription {
    scope: Scope,
    backlog: Vec<RealtimeEvent>,
    live: broadcast::Receiver<RealtimeEvent>,
}

impl Subscription {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Split into the replayed events and a live stream that skips anything
    /// already covered by the backlog.
    pub fn into_parts(self) -> (Vec<RealtimeEvent>, LiveStream) {
        let Subscription {
            scope,
            backlog,
            mut live,
        } = self;
        let mut last = backlog.last().map(|e| e.serial).unwrap_or(0);
        let stream = async_stream::stream! {
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if event.serial <= last {
                            continue;
                        }
                        last = event.serial;
                        yield event;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(%scope, skipped, "subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        (backlog, Box::pin(stream))
    }

    pub fn into_stream(self) -> LiveStream {
        let (backlog, live) = self.into_parts();
        Box::pin(futures_util::stream::iter(backlog).chain(live))
    }
}

// ---------------------------------------------------------------------------
// Room map shared by both hubs
// ---------------------------------------------------------------------------

struct Room {
    tx: broadcast::Sender<RealtimeEvent>,
    history: VecDeque<RealtimeEvent>,
}

/// Per-scope broadcast rooms with optional bounded history.
pub(crate) struct Rooms {
    rooms: DashMap<Scope, Room>,
    capacity: usize,
    history_limit: usize,
    next_serial: AtomicU64,
    closed: AtomicBool,
}

impl Rooms {
    pub(crate) fn new(capacity: usize, history_limit: usize) -> Self {
        // Serials start at the wall clock so they keep increasing across restarts
        // and a client's Last-Event-ID never masks fresh events.
        let start = chrono::Utc::now().timestamp_micros().max(0) as u64;
        Self {
            rooms: DashMap::new(),
            capacity: capacity.max(1),
            history_limit,
            next_serial: AtomicU64::new(start),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn publish(&self, scope: &Scope, event: Event) -> Result<u64, RealtimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RealtimeError::Closed);
        }
        if self.history_limit == 0 && !self.rooms.contains_key(scope) {
            // nobody listening and nothing to retain
            return Ok(self.next_serial.fetch_add(1, Ordering::SeqCst) + 1);
        }

        let mut room = self
            .rooms
            .entry(scope.clone())
            .or_insert_with(|| self.new_room());
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        let event = RealtimeEvent {
            serial,
            scope: scope.clone(),
            published_at: chrono::Utc::now(),
            event,
        };
        if self.history_limit > 0 {
            if room.history.len() == self.history_limit {
                room.history.pop_front();
            }
            room.history.push_back(event.clone());
        }
        // no receivers is not an error for a hint
        let delivered = room.tx.send(event).unwrap_or(0);
        let prune = delivered == 0 && self.history_limit == 0;
        drop(room);
        if prune {
            self.rooms
                .remove_if(scope, |_, room| room.tx.receiver_count() == 0);
        }
        tracing::trace!(%scope, serial, delivered, "published");
        Ok(serial)
    }

    pub(crate) fn subscribe(&self, scope: &Scope, resume_after: Option<u64>) -> Subscription {
        let room = self
            .rooms
            .entry(scope.clone())
            .or_insert_with(|| self.new_room());
        let live = room.tx.subscribe();
        let backlog = match resume_after {
            Some(after) => room
                .history
                .iter()
                .filter(|e| e.serial > after)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        drop(room);
        if self.closed.load(Ordering::Acquire) {
            self.rooms.remove(scope);
        }
        Subscription {
            scope: scope.clone(),
            backlog,
            live,
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.rooms.clear();
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, scope: &Scope) -> usize {
        self.rooms
            .get(scope)
            .map(|room| room.tx.receiver_count())
            .unwrap_or(0)
    }

    fn new_room(&self) -> Room {
        let (tx, _) = broadcast::channel(self.capacity);
        Room {
            tx,
            history: VecDeque::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out facade used by handlers
// ---------------------------------------------------------------------------

/// Fire-and-forget publisher. Errors are logged and swallowed so a failed
/// push never fails the request that caused it.
#[derive(Clone)]
pub struct Fanout {
    transport: Arc<dyn RealtimeTransport>,
}

impl Fanout {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn RealtimeTransport> {
        &self.transport
    }

    pub fn publish(&self, scopes: &[Scope], event: &Event) {
        for scope in scopes {
            match self.transport.publish(scope, event.clone()) {
                Ok(serial) => {
                    tracing::debug!(%scope, event = %event.name(), serial, "fan-out");
                }
                Err(e) => {
                    tracing::warn!(%scope, event = %event.name(), "publish failed: {e}");
                }
            }
        }
    }
}

/// Scopes notified about inbound traffic: the assignee if there is one,
/// otherwise the owning admin, plus the number itself.
pub fn inbound_scopes(phone: &PhoneNumber) -> Vec<Scope> {
    let owner = match &phone.assigned_to {
        Some(member) => Scope::User(member.clone()),
        None => Scope::Admin(phone.admin_id.clone()),
    };
    vec![owner, Scope::Phone(phone.phone_number.clone())]
}

/// Scopes notified about changes made through the API, so other sessions
/// of the admin and the assignee converge.
pub fn activity_scopes(phone: &PhoneNumber) -> Vec<Scope> {
    let mut scopes = vec![Scope::Admin(phone.admin_id.clone())];
    if let Some(member) = &phone.assigned_to {
        scopes.push(Scope::User(member.clone()));
    }
    scopes.push(Scope::Phone(phone.phone_number.clone()));
    scopes
}

/// Whether `user` may listen on `scope`.
pub async fn authorize_scope(store: &Store, user: &User, scope: &Scope) -> Result<(), ApiFailure> {
    let allowed = match scope {
        Scope::User(id) => *id == user.id,
        Scope::Admin(id) => user.role == Role::Admin && *id == user.id,
        Scope::Phone(number) => {
            let number = number.clone();
            store
                .call(move |s| s.phone_number_by_e164(&number))
                .await?
                .is_some_and(|phone| phone.accessible_by(user))
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(ApiFailure::Forbidden(format!("not allowed to subscribe to {scope}")))
    }
}

/// Parse a comma-separated scope list, ignoring blanks.
pub fn parse_scopes(raw: &str) -> Result<Vec<Scope>, ApiFailure> {
    let scopes = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Scope>().map_err(ApiFailure::Invalid))
        .collect::<Result<Vec<_>, _>>()?;
    if scopes.is_empty() {
        return Err(ApiFailure::Invalid("at least one scope is required".into()));
    }
    Ok(scopes)
}
