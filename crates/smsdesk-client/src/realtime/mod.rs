//! Real-time subscriber with reconnect.
//!
//! A [`RealtimeConnector`] opens one stream of events for a set of scopes. The
//! supervisor spawned by [`spawn_subscriber`] keeps it connected: each attempt
//! is bounded by a timeout, failures back off exponentially, and once the
//! attempts are exhausted it reports [`RealtimeSignal::Degraded`] and stops.
//! The controller then carries on with polling alone.

pub mod channel;
pub mod socket;

use futures_util::{Stream, StreamExt};
use smsdesk::protocol::{EventName, RealtimeEvent, Scope};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use channel::ChannelConnector;
pub use socket::SocketConnector;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("server refused subscription: {0}")]
    Rejected(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("invalid event: {0}")]
    Decode(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<RealtimeEvent, RealtimeError>> + Send>>;

/// Opens a live event stream for a set of scopes.
pub trait RealtimeConnector: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Connect and subscribe. `resume_after` is the last serial seen, for
    /// transports that can replay.
    fn connect(
        &self,
        scopes: &[Scope],
        resume_after: Option<u64>,
    ) -> impl Future<Output = Result<EventStream, RealtimeError>> + Send;
}

/// Events of interest on one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub scope: Scope,
    pub events: Vec<EventName>,
}

impl Interest {
    pub fn all(scope: Scope) -> Self {
        Self {
            scope,
            events: EventName::ALL.to_vec(),
        }
    }

    fn matches(&self, event: &RealtimeEvent) -> bool {
        self.scope == event.scope && self.events.contains(&event.event.name())
    }
}

/// What the supervisor reports to the controller.
#[derive(Debug, Clone)]
pub enum RealtimeSignal {
    /// First connection for the current scope set.
    Connected,
    /// Connection restored after a drop; events may have been missed.
    Reconnected,
    Event(RealtimeEvent),
    /// Reconnect attempts exhausted. Polling keeps the view converging.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    /// A stream that lives at least this long resets the attempt counter.
    /// Shorter-lived streams count as failed attempts.
    pub stable_after: Duration,
    /// Serials remembered to suppress redelivery after a reconnect.
    pub seen_capacity: usize,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_attempts: 6,
            stable_after: Duration::from_secs(30),
            seen_capacity: 1024,
        }
    }
}

impl RealtimeOptions {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Bounded set of recently delivered serials.
#[derive(Debug)]
pub struct SeenSerials {
    order: VecDeque<u64>,
    set: HashSet<u64>,
    capacity: usize,
}

impl SeenSerials {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns false when `serial` was already seen.
    pub fn insert(&mut self, serial: u64) -> bool {
        if !self.set.insert(serial) {
            return false;
        }
        self.order.push_back(serial);
        if self.order.len() > self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.set.remove(&oldest);
        }
        true
    }
}

/// Run the supervisor in the background. Interests are read from the watch
/// channel and changes trigger a resubscribe. The task ends when the signal
/// receiver is dropped, the interest sender is dropped, or after `Degraded`.
pub fn spawn_subscriber<C: RealtimeConnector>(
    connector: C,
    interests: watch::Receiver<Vec<Interest>>,
    options: RealtimeOptions,
    signals: mpsc::UnboundedSender<RealtimeSignal>,
) -> JoinHandle<()> {
    tokio::spawn(supervise(connector, interests, options, signals))
}

enum StreamEnd {
    Dropped,
    InterestsChanged,
    Shutdown,
}

async fn supervise<C: RealtimeConnector>(
    connector: C,
    mut interests: watch::Receiver<Vec<Interest>>,
    options: RealtimeOptions,
    signals: mpsc::UnboundedSender<RealtimeSignal>,
) {
    let mut seen = SeenSerials::new(options.seen_capacity);
    let mut last_serial: Option<u64> = None;
    let mut attempts = 0u32;
    let mut was_connected = false;

    loop {
        let current = interests.borrow_and_update().clone();
        if current.is_empty() {
            if interests.changed().await.is_err() {
                return;
            }
            continue;
        }
        let scopes: Vec<Scope> = current.iter().map(|i| i.scope.clone()).collect();

        let attempt =
            tokio::time::timeout(options.connect_timeout, connector.connect(&scopes, last_serial))
                .await;
        match attempt {
            Ok(Ok(stream)) => {
                let signal = if was_connected {
                    RealtimeSignal::Reconnected
                } else {
                    RealtimeSignal::Connected
                };
                tracing::info!(transport = connector.name(), scopes = scopes.len(), "real-time connected");
                if signals.send(signal).is_err() {
                    return;
                }
                was_connected = true;
                let connected_at = Instant::now();

                let end = pump(
                    stream,
                    &current,
                    &mut interests,
                    &mut seen,
                    &mut last_serial,
                    &signals,
                )
                .await;
                match end {
                    StreamEnd::Shutdown => return,
                    StreamEnd::InterestsChanged => {
                        // fresh scope set: the controller already re-fetched
                        attempts = 0;
                        was_connected = false;
                        continue;
                    }
                    StreamEnd::Dropped if connected_at.elapsed() >= options.stable_after => {
                        tracing::warn!(transport = connector.name(), "real-time stream dropped");
                        attempts = 0;
                        if !pause(options.backoff_base, &mut interests).await {
                            return;
                        }
                        continue;
                    }
                    StreamEnd::Dropped => {
                        tracing::warn!(
                            transport = connector.name(),
                            lived_ms = connected_at.elapsed().as_millis() as u64,
                            "real-time stream dropped right after connecting"
                        );
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(transport = connector.name(), "real-time connect failed: {e}");
            }
            Err(_) => {
                tracing::warn!(
                    transport = connector.name(),
                    timeout_secs = options.connect_timeout.as_secs(),
                    "real-time connect timed out"
                );
            }
        }

        attempts += 1;
        if attempts >= options.max_attempts {
            tracing::warn!(attempts, "real-time unavailable, continuing on polling");
            let _ = signals.send(RealtimeSignal::Degraded);
            return;
        }
        let delay = options.backoff(attempts);
        tracing::debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
        if !pause(delay, &mut interests).await {
            return;
        }
    }
}

/// Sleep before a reconnect, cut short by an interest change. Returns false
/// once the interest sender is gone.
async fn pause(delay: Duration, interests: &mut watch::Receiver<Vec<Interest>>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = interests.changed() => changed.is_ok(),
    }
}

async fn pump(
    mut stream: EventStream,
    current: &[Interest],
    interests: &mut watch::Receiver<Vec<Interest>>,
    seen: &mut SeenSerials,
    last_serial: &mut Option<u64>,
    signals: &mpsc::UnboundedSender<RealtimeSignal>,
) -> StreamEnd {
    loop {
        tokio::select! {
            item = stream.next() => {
                let event = match item {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        tracing::warn!("real-time stream error: {e}");
                        return StreamEnd::Dropped;
                    }
                    None => return StreamEnd::Dropped,
                };
                if !seen.insert(event.serial) {
                    tracing::trace!(serial = event.serial, "duplicate event suppressed");
                    continue;
                }
                *last_serial = Some(last_serial.map_or(event.serial, |s| s.max(event.serial)));
                if !current.iter().any(|i| i.matches(&event)) {
                    continue;
                }
                if signals.send(RealtimeSignal::Event(event)).is_err() {
                    return StreamEnd::Shutdown;
                }
            }
            changed = interests.changed() => {
                if changed.is_err() {
                    return StreamEnd::Shutdown;
                }
                return StreamEnd::InterestsChanged;
            }
            _ = signals.closed() => return StreamEnd::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use smsdesk::protocol::{Category, Contact, Event};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn event(serial: u64, scope: Scope) -> RealtimeEvent {
        RealtimeEvent {
            serial,
            scope,
            published_at: Utc::now(),
            event: Event::ContactUpdated {
                contact: Contact {
                    id: "c1".into(),
                    phone_number_id: "pn-1".into(),
                    phone_number: "+15551230001".into(),
                    name: None,
                    last_message: None,
                    last_message_time: None,
                    unread_count: 1,
                    is_pinned: false,
                    category: Category::General,
                },
            },
        }
    }

    /// Hands out scripted streams, failing once the script runs out.
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        streams: Arc<Mutex<VecDeque<Vec<RealtimeEvent>>>>,
        connects: Arc<AtomicUsize>,
        resumes: Arc<Mutex<Vec<Option<u64>>>>,
    }

    impl RealtimeConnector for ScriptedConnector {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn connect(
            &self,
            _scopes: &[Scope],
            resume_after: Option<u64>,
        ) -> impl Future<Output = Result<EventStream, RealtimeError>> + Send {
            let this = self.clone();
            async move {
                this.connects.fetch_add(1, Ordering::SeqCst);
                this.resumes.lock().await.push(resume_after);
                match this.streams.lock().await.pop_front() {
                    Some(events) => {
                        let stream: EventStream =
                            Box::pin(futures_util::stream::iter(events.into_iter().map(Ok)));
                        Ok(stream)
                    }
                    None => Err(RealtimeError::Connect("refused".into())),
                }
            }
        }
    }

    fn user_scope() -> Scope {
        Scope::User("u1".into())
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let options = RealtimeOptions::default();
        assert_eq!(options.backoff(1), Duration::from_secs(1));
        assert_eq!(options.backoff(2), Duration::from_secs(2));
        assert_eq!(options.backoff(5), Duration::from_secs(16));
        assert_eq!(options.backoff(6), Duration::from_secs(30));
        assert_eq!(options.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn seen_serials_are_bounded() {
        let mut seen = SeenSerials::new(2);
        assert!(seen.insert(1));
        assert!(!seen.insert(1));
        assert!(seen.insert(2));
        assert!(seen.insert(3));
        // 1 was evicted
        assert!(seen.insert(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_then_degrades() {
        let connector = ScriptedConnector::default();
        connector
            .streams
            .lock()
            .await
            .push_back(vec![event(10, user_scope()), event(11, user_scope())]);
        connector
            .streams
            .lock()
            .await
            .push_back(vec![event(11, user_scope()), event(12, user_scope())]);

        let (_interest_tx, interest_rx) = watch::channel(vec![Interest::all(user_scope())]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_subscriber(connector.clone(), interest_rx, RealtimeOptions::default(), tx);

        let mut serials = Vec::new();
        let mut saw_reconnect = false;
        loop {
            match rx.recv().await.unwrap() {
                RealtimeSignal::Connected => {}
                RealtimeSignal::Reconnected => saw_reconnect = true,
                RealtimeSignal::Event(e) => serials.push(e.serial),
                RealtimeSignal::Degraded => break,
            }
        }
        handle.await.unwrap();

        assert!(saw_reconnect);
        // 11 was redelivered on the second stream and suppressed
        assert_eq!(serials, vec![10, 11, 12]);
        // both streams ended at once, so they count towards the six attempts
        assert_eq!(connector.connects.load(Ordering::SeqCst), 6);
        let resumes = connector.resumes.lock().await.clone();
        assert_eq!(resumes[0], None);
        assert_eq!(resumes[1], Some(11));
    }

    #[tokio::test(start_paused = true)]
    async fn filters_uninteresting_events() {
        let connector = ScriptedConnector::default();
        connector.streams.lock().await.push_back(vec![
            event(1, Scope::Admin("a1".into())),
            event(2, user_scope()),
        ]);
        let (_interest_tx, interest_rx) = watch::channel(vec![Interest::all(user_scope())]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_subscriber(connector, interest_rx, RealtimeOptions::default(), tx);

        assert!(matches!(rx.recv().await, Some(RealtimeSignal::Connected)));
        match rx.recv().await {
            Some(RealtimeSignal::Event(e)) => assert_eq!(e.serial, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_counts_as_attempt() {
        #[derive(Clone)]
        struct Hanging;
        impl RealtimeConnector for Hanging {
            fn name(&self) -> &'static str {
                "hanging"
            }
            fn connect(
                &self,
                _scopes: &[Scope],
                _resume_after: Option<u64>,
            ) -> impl Future<Output = Result<EventStream, RealtimeError>> + Send {
                std::future::pending()
            }
        }

        let options = RealtimeOptions {
            max_attempts: 2,
            ..Default::default()
        };
        let (_interest_tx, interest_rx) = watch::channel(vec![Interest::all(user_scope())]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = tokio::time::Instant::now();
        spawn_subscriber(Hanging, interest_rx, options, tx);
        assert!(matches!(rx.recv().await, Some(RealtimeSignal::Degraded)));
        // two 15s timeouts plus one 1s backoff
        assert!(started.elapsed() >= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_interests() {
        let connector = ScriptedConnector::default();
        connector.streams.lock().await.push_back(vec![]);
        let (interest_tx, interest_rx) = watch::channel(Vec::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_subscriber(connector.clone(), interest_rx, RealtimeOptions::default(), tx);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);

        interest_tx.send_replace(vec![Interest::all(user_scope())]);
        assert!(matches!(rx.recv().await, Some(RealtimeSignal::Connected)));
    }

    /// Accepts every connect and ends the stream after `hold`.
    #[derive(Clone)]
    struct Flapping {
        hold: Duration,
        connects: Arc<AtomicUsize>,
    }

    impl RealtimeConnector for Flapping {
        fn name(&self) -> &'static str {
            "flapping"
        }

        fn connect(
            &self,
            _scopes: &[Scope],
            _resume_after: Option<u64>,
        ) -> impl Future<Output = Result<EventStream, RealtimeError>> + Send {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let hold = self.hold;
            async move {
                let stream: EventStream = Box::pin(
                    futures_util::stream::once(tokio::time::sleep(hold))
                        .filter_map(|()| async { None::<Result<RealtimeEvent, RealtimeError>> }),
                );
                Ok(stream)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn instant_drops_exhaust_attempts() {
        let connector = Flapping {
            hold: Duration::ZERO,
            connects: Arc::default(),
        };
        let (_interest_tx, interest_rx) = watch::channel(vec![Interest::all(user_scope())]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_subscriber(connector.clone(), interest_rx, RealtimeOptions::default(), tx);

        let mut reconnects = 0;
        loop {
            match rx.recv().await.unwrap() {
                RealtimeSignal::Reconnected => reconnects += 1,
                RealtimeSignal::Degraded => break,
                _ => {}
            }
        }
        handle.await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 6);
        assert_eq!(reconnects, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_streams_reset_attempts() {
        let connector = Flapping {
            hold: Duration::from_secs(60),
            connects: Arc::default(),
        };
        let options = RealtimeOptions {
            max_attempts: 2,
            ..Default::default()
        };
        let (_interest_tx, interest_rx) = watch::channel(vec![Interest::all(user_scope())]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_subscriber(connector.clone(), interest_rx, options, tx);

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert!(connector.connects.load(Ordering::SeqCst) >= 5);
        while let Ok(signal) = rx.try_recv() {
            assert!(!matches!(signal, RealtimeSignal::Degraded));
        }
    }
}
