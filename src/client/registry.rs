//! Request correlation registry.
//!
//! Translates "call this method" / "subscribe to this method" intents
//! into correlation ids and pending entries, and translates wire
//! responses back into deliveries. One-shot calls resolve a oneshot
//! channel and are removed on delivery; subscriptions feed an event
//! channel and persist until unsubscribed — they are the set resubmitted
//! verbatim on every successful (re)connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::RpcError;
use crate::proto::{Envelope, Params, ResponseEnvelope};

/// Prefix for one-shot call correlation ids.
const CALL_PREFIX: &str = "callback";
/// Prefix for subscription correlation ids.
const SUBSCRIPTION_PREFIX: &str = "client";
/// Buffered events per subscription before slow consumers start losing
/// pushes.
const EVENT_BUFFER: usize = 64;

/// Outcome delivered for one response: the `"data"` payload or the
/// `"error"` message as an application error.
pub type Delivery = Result<Value, RpcError>;

/// A registered request awaiting one or more responses.
#[derive(Debug)]
enum Pending {
    /// One-shot call: resolved exactly once, then removed.
    Call {
        method: String,
        tx: oneshot::Sender<Delivery>,
    },
    /// Persistent subscription: keeps receiving until unsubscribed.
    Subscription {
        method: String,
        params: Option<Params>,
        events: mpsc::Sender<Delivery>,
    },
}

/// Pending-request map for one client instance.
///
/// Ids are allocated from a single monotonically increasing counter,
/// never reused within the instance's lifetime — not even across
/// reconnects. The `callback-N` / `client-N` prefixes are purely for
/// debuggability; the protocol only cares about uniqueness.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<String, Pending>>,
    counter: AtomicU64,
}

impl CorrelationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a one-shot call and returns its id plus the receiver
    /// that resolves with exactly one outcome.
    pub async fn register_call(&self, method: &str) -> (String, oneshot::Receiver<Delivery>) {
        let id = self.next_id(CALL_PREFIX);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id.clone(),
            Pending::Call {
                method: method.to_string(),
                tx,
            },
        );
        (id, rx)
    }

    /// Registers (or updates) a persistent subscription and returns its
    /// id plus the event receiver.
    ///
    /// Passing an existing `client-…` id updates that subscription's
    /// stored method and parameters; passing an id of the wrong kind is
    /// dropped with a warning and a fresh id generated, since a
    /// subscription must never carry a callback id.
    pub async fn register_subscription(
        &self,
        id: Option<String>,
        method: &str,
        params: Option<Params>,
    ) -> (String, mpsc::Receiver<Delivery>) {
        let id = match id {
            Some(id) if id.starts_with(SUBSCRIPTION_PREFIX) => id,
            Some(wrong) => {
                tracing::warn!(id = wrong, "not a subscription id, generating a new one");
                self.next_id(SUBSCRIPTION_PREFIX)
            }
            None => self.next_id(SUBSCRIPTION_PREFIX),
        };
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        self.pending.lock().await.insert(
            id.clone(),
            Pending::Subscription {
                method: method.to_string(),
                params,
                events,
            },
        );
        (id, rx)
    }

    /// Returns `true` while `id` names a live subscription entry.
    pub async fn is_subscribed(&self, id: &str) -> bool {
        matches!(
            self.pending.lock().await.get(id),
            Some(Pending::Subscription { .. })
        )
    }

    /// Removes a pending entry, if present. Used by the timeout path of
    /// one-shot calls; a response arriving afterwards finds nothing and
    /// is dropped as a correlation error.
    pub async fn remove(&self, id: &str) -> bool {
        self.pending.lock().await.remove(id).is_some()
    }

    /// Removes the named subscriptions and returns the ids actually
    /// removed. Safe to call twice; the second call removes nothing.
    pub async fn unsubscribe(&self, ids: &[String]) -> Vec<String> {
        let mut pending = self.pending.lock().await;
        ids.iter()
            .filter(|id| {
                matches!(pending.get(id.as_str()), Some(Pending::Subscription { .. }))
                    && pending.remove(id.as_str()).is_some()
            })
            .cloned()
            .collect()
    }

    /// Routes one inbound response to its pending entry.
    ///
    /// Unknown ids are logged and dropped — a stale response must not
    /// invoke any handler. One-shot entries are removed the instant
    /// their outcome is delivered; subscriptions stay registered, and a
    /// failing event delivery cannot poison the registry. Returns the
    /// id of a subscription whose consumer is gone, so the caller can
    /// batch an unsubscribe for it.
    pub async fn dispatch(&self, response: ResponseEnvelope) -> Option<String> {
        let Some(id) = response.correlation_id().map(str::to_string) else {
            tracing::error!("response without correlation id dropped");
            return None;
        };
        let delivery: Delivery = match (response.data, response.error) {
            (_, Some(error)) => Err(RpcError::Application(error)),
            (data, None) => Ok(data.unwrap_or(Value::Null)),
        };

        let mut pending = self.pending.lock().await;
        match pending.get(&id) {
            Some(Pending::Call { .. }) => {
                if let Some(Pending::Call { method, tx }) = pending.remove(&id) {
                    tracing::debug!(id, method, "resolving call");
                    if tx.send(delivery).is_err() {
                        // Receiver already gave up (timed out); the
                        // outcome was delivered by the timeout instead.
                        tracing::debug!(id, "call receiver gone, outcome dropped");
                    }
                }
                None
            }
            Some(Pending::Subscription { method, events, .. }) => {
                match events.try_send(delivery) {
                    Ok(()) => None,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(id, method, "subscriber lagging, event dropped");
                        None
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::debug!(id, method, "subscriber gone, reaping subscription");
                        pending.remove(&id);
                        Some(id)
                    }
                }
            }
            None => {
                let stale = RpcError::Correlation(id);
                tracing::error!(error = %stale, "dropping response");
                None
            }
        }
    }

    /// The verbatim subscribe envelopes for every persistent entry.
    ///
    /// This is the only path that resends a subscription after its
    /// initial request; the lifecycle manager invokes it once per
    /// successful (re)connect. Entries unsubscribed before the snapshot
    /// is taken are absent — an unsubscribe always wins that race.
    pub async fn resubmissions(&self) -> Vec<Envelope> {
        self.pending
            .lock()
            .await
            .iter()
            .filter_map(|(id, entry)| match entry {
                Pending::Subscription { method, params, .. } => {
                    Some(Envelope::subscribe(method, params.clone(), id))
                }
                Pending::Call { .. } => None,
            })
            .collect()
    }

    /// Rejects every pending one-shot call with [`RpcError::Closed`].
    /// Invoked when the owning connection is explicitly closed;
    /// subscriptions are left in place (their event streams simply end
    /// when the caller drops the client).
    pub async fn fail_all_calls(&self) {
        let mut pending = self.pending.lock().await;
        let call_ids: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| matches!(entry, Pending::Call { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        for id in call_ids {
            if let Some(Pending::Call { tx, .. }) = pending.remove(&id) {
                let _ = tx.send(Err(RpcError::Closed));
            }
        }
    }

    /// Number of pending entries of both kinds.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Returns `true` if nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}
