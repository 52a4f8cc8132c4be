//! Channel broker: subscription records, channel index, and
//! diff-suppressed notification fan-out.
//!
//! The broker owns the only shared mutable state on the server: the
//! channel-to-subscriptions index and the per-subscription result
//! cache. Locking follows the fine-grained registry pattern — an outer
//! `RwLock<HashMap>` guards membership, a per-record `Mutex` guards the
//! cached result — and no lock is ever held across a handler
//! re-evaluation, so one slow method cannot serialize unrelated
//! clients' notifications.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};

use super::ConnectionId;
use super::dispatch::{CallContext, DispatchTable};
use crate::proto::{Params, ResponseEnvelope, fingerprint};

/// A subscription is keyed by its owning connection and the
/// client-chosen correlation id: at most one record per pair.
pub type SubscriptionKey = (ConnectionId, String);

/// Outbound queue handle for one connection. The broker pushes through
/// this; the connection actor owns the receiving end and the socket.
pub type PushSender = mpsc::UnboundedSender<ResponseEnvelope>;

/// One server-side subscription: the stored invocation plus the cache
/// used for diffing.
#[derive(Debug)]
struct SubscriptionRecord {
    method: String,
    params: Option<Params>,
    channels: Vec<String>,
    /// Canonical serialization of the last result delivered (or cached
    /// at subscribe time). `None` only before the first evaluation.
    last: Option<String>,
    push: PushSender,
}

/// Channel-to-subscriptions index with diff-suppressed fan-out.
#[derive(Debug)]
pub struct ChannelBroker {
    dispatch: Arc<DispatchTable>,
    records: RwLock<HashMap<SubscriptionKey, Arc<Mutex<SubscriptionRecord>>>>,
    channels: RwLock<HashMap<String, HashSet<SubscriptionKey>>>,
}

impl ChannelBroker {
    /// Creates an empty broker over the given dispatch table.
    #[must_use]
    pub fn new(dispatch: Arc<DispatchTable>) -> Self {
        Self {
            dispatch,
            records: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Creates or refreshes the subscription record for
    /// `(conn, client)` after a subscribe-bound method invocation.
    ///
    /// A second subscribe with the same id silently replaces the stored
    /// method, parameters, and channel bindings; the result cache is
    /// seeded from the invocation result so the next notify diffs
    /// against what the subscriber has already seen.
    pub async fn subscribe(
        &self,
        conn: ConnectionId,
        client: &str,
        method: &str,
        params: Option<Params>,
        channels: &[String],
        push: PushSender,
        result: &Value,
    ) {
        let key: SubscriptionKey = (conn, client.to_string());
        let record = SubscriptionRecord {
            method: method.to_string(),
            params,
            channels: channels.to_vec(),
            last: Some(fingerprint(result)),
            push,
        };

        let mut records = self.records.write().await;
        let mut index = self.channels.write().await;
        if let Some(existing) = records.get(&key) {
            let old = existing.lock().await;
            unindex(&mut index, &key, &old.channels);
        }
        records.insert(key.clone(), Arc::new(Mutex::new(record)));
        for channel in channels {
            index.entry(channel.clone()).or_default().insert(key.clone());
        }
        tracing::debug!(%conn, client, method, ?channels, "subscription registered");
    }

    /// Re-evaluates every subscription bound to any of the given
    /// channels and pushes the new result to its owner — but only when
    /// the result differs from the cached one.
    ///
    /// Records are re-evaluated concurrently and outside every index
    /// lock. The future completes only after all triggered records have
    /// been evaluated, so a notifying call's reply is ordered after its
    /// own pushes. Handler errors during re-evaluation are logged and
    /// skipped; they never tear down a subscription or a connection.
    pub async fn notify(&self, channels: &[String]) {
        let keys: HashSet<SubscriptionKey> = {
            let index = self.channels.read().await;
            channels
                .iter()
                .filter_map(|c| index.get(c))
                .flatten()
                .cloned()
                .collect()
        };
        if keys.is_empty() {
            return;
        }

        let triggered: Vec<(SubscriptionKey, Arc<Mutex<SubscriptionRecord>>)> = {
            let records = self.records.read().await;
            keys.into_iter()
                .filter_map(|k| records.get(&k).map(|r| (k.clone(), Arc::clone(r))))
                .collect()
        };

        join_all(
            triggered
                .into_iter()
                .map(|(key, record)| self.reevaluate(key, record)),
        )
        .await;
    }

    /// Re-runs one stored subscription and pushes on change.
    async fn reevaluate(&self, key: SubscriptionKey, record: Arc<Mutex<SubscriptionRecord>>) {
        let (conn, client) = key;
        let (method, params) = {
            let record = record.lock().await;
            (record.method.clone(), record.params.clone())
        };

        let spec = match self.dispatch.resolve(&method) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(%conn, client, method, error = %e, "stale subscription method");
                return;
            }
        };
        let ctx = CallContext::internal(conn, Some(client.clone()));
        let result = match spec.invoke(ctx, params).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(%conn, client, method, error = %e, "ignoring re-evaluation error");
                return;
            }
        };

        let print = fingerprint(&result);
        let mut record = record.lock().await;
        if record.last.as_deref() == Some(print.as_str()) {
            tracing::trace!(%conn, client, method, "push suppressed, result unchanged");
            return;
        }
        record.last = Some(print);
        if record
            .push
            .send(ResponseEnvelope::client_data(&client, result))
            .is_err()
        {
            tracing::debug!(%conn, client, "push target gone, connection cleanup pending");
        }
    }

    /// Removes the named subscriptions for one connection. Unknown ids
    /// are a no-op, so unsubscribing twice is safe.
    pub async fn unsubscribe(&self, conn: ConnectionId, clients: &[String]) {
        let mut records = self.records.write().await;
        let mut index = self.channels.write().await;
        for client in clients {
            let key: SubscriptionKey = (conn, client.clone());
            if let Some(record) = records.remove(&key) {
                let record = record.lock().await;
                unindex(&mut index, &key, &record.channels);
                tracing::debug!(%conn, client, "subscription removed");
            }
        }
    }

    /// Drops every subscription owned by a destroyed connection from
    /// every channel index it participates in.
    pub async fn remove_connection(&self, conn: ConnectionId) {
        let mut records = self.records.write().await;
        let mut index = self.channels.write().await;
        let keys: Vec<SubscriptionKey> = records
            .keys()
            .filter(|(owner, _)| *owner == conn)
            .cloned()
            .collect();
        for key in keys {
            if let Some(record) = records.remove(&key) {
                let record = record.lock().await;
                unindex(&mut index, &key, &record.channels);
            }
        }
        tracing::debug!(%conn, "connection subscriptions cleaned up");
    }

    /// Number of live subscription records.
    pub async fn subscription_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Number of channels with at least one subscription.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

/// Removes a key from every listed channel set, dropping emptied sets.
fn unindex(
    index: &mut HashMap<String, HashSet<SubscriptionKey>>,
    key: &SubscriptionKey,
    channels: &[String],
) {
    for channel in channels {
        if let Some(set) = index.get_mut(channel) {
            set.remove(key);
            if set.is_empty() {
                index.remove(channel);
            }
        }
    }
}
