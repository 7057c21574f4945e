use smsdesk_store::{MessageStore, StoreError};
use std::sync::Arc;
use tokio::sync::watch;

use crate::carrier::Carrier;
use crate::error::ApiFailure;
use crate::realtime::{Fanout, RealtimeTransport};
use crate::webhook::InboundProcessor;

/// Async handle to the message store. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct Store {
    inner: Arc<MessageStore>,
}

impl Store {
    pub fn new(inner: Arc<MessageStore>) -> Self {
        Self { inner }
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T, ApiFailure>
    where
        F: FnOnce(&MessageStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| ApiFailure::Internal(format!("store task failed: {e}")))?
            .map_err(ApiFailure::from)
    }
}

/// Shared state behind every route.
pub struct AppState {
    pub store: Store,
    pub fanout: Fanout,
    pub carrier: Carrier,
    pub inbound: InboundProcessor,
    shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(
        store: Arc<MessageStore>,
        transport: Arc<dyn RealtimeTransport>,
        carrier: Carrier,
    ) -> Arc<Self> {
        let store = Store::new(store);
        let fanout = Fanout::new(transport);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            inbound: InboundProcessor::new(store.clone(), fanout.clone()),
            store,
            fanout,
            carrier,
            shutdown_tx,
        })
    }

    /// Receiver that flips to `true` once shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// End real-time streams so graceful shutdown is not held open by them.
    pub fn shutdown(&self) {
        tracing::info!("closing real-time connections");
        self.fanout.transport().close();
        self.shutdown_tx.send_replace(true);
    }
}
