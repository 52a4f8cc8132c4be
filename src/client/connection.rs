//! Connection lifecycle manager.
//!
//! [`RpcClient`] owns a background supervisor task that drives the
//! socket state machine: connect, heartbeat, detect dead peers,
//! reconnect with exponential backoff, and resubmit every persistent
//! subscription after each successful (re)connect. No operation here
//! ever propagates a transport error to application code; failures are
//! logged and converted into a scheduled retry or a rejected pending
//! request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::registry::{CorrelationRegistry, Delivery};
use crate::config::ClientConfig;
use crate::error::RpcError;
use crate::proto::envelope::ClientRef;
use crate::proto::{Envelope, Params, ResponseEnvelope};
use crate::server::dispatch::POLL_METHOD;

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

/// Socket lifecycle states, observable through [`RpcClient::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connection attempt is in flight.
    Connecting,
    /// The socket is open and heartbeating.
    Open,
    /// An explicit close is in progress.
    Closing,
    /// No socket. Initial state, and the state between reconnect
    /// attempts; terminal once [`RpcClient::close`] has been called.
    Closed,
}

/// Control messages from the public API (and the heartbeat task) to the
/// supervisor.
#[derive(Debug)]
enum Control {
    /// Explicit close; terminal for this instance.
    Shutdown,
    /// The heartbeat declared the socket for this epoch dead.
    Dead {
        epoch: u64,
    },
}

/// Why the open-connection loop ended.
enum Exit {
    Disconnected,
    ShuttingDown,
}

#[derive(Debug)]
struct ClientInner {
    url: String,
    config: ClientConfig,
    registry: CorrelationRegistry,
    out_tx: mpsc::UnboundedSender<Envelope>,
    ctl_tx: mpsc::UnboundedSender<Control>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: AtomicBool,
}

/// Client endpoint of the publish/subscribe RPC protocol.
///
/// Cheaply cloneable; all clones share one socket, one correlation
/// registry, and one id counter. Connecting starts immediately on
/// construction and concurrent open-waits collapse onto the single
/// supervisor task — there is never more than one underlying
/// socket-open attempt in flight.
///
/// An explicit [`close`](Self::close) is terminal: the instance never
/// reconnects afterwards, and a fresh client is required to reach the
/// same server again.
#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Creates a client and starts connecting to `url` in the
    /// background. The returned handle is usable immediately; requests
    /// issued before the socket opens are queued and sent once
    /// connectivity is established.
    #[must_use]
    pub fn connect(url: &str, config: ClientConfig) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);

        let inner = Arc::new(ClientInner {
            url: url.to_string(),
            config,
            registry: CorrelationRegistry::new(),
            out_tx,
            ctl_tx,
            state_rx,
            shutdown: AtomicBool::new(false),
        });

        tokio::spawn(supervise(Arc::clone(&inner), out_rx, ctl_rx, state_tx));
        Self { inner }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Waits until the socket is open.
    ///
    /// Returns immediately when already open; otherwise queues on the
    /// supervisor's state changes, riding out any in-flight connect or
    /// reconnect cycle.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] once the client has been explicitly
    /// closed, and [`RpcError::Timeout`] when the socket does not open
    /// within `max_wait`.
    pub async fn wait_until_open(&self, max_wait: Duration) -> Result<(), RpcError> {
        let mut state_rx = self.inner.state_rx.clone();
        let wait = async move {
            loop {
                if self.inner.shutdown.load(Ordering::SeqCst) {
                    return Err(RpcError::Closed);
                }
                if *state_rx.borrow_and_update() == ConnectionState::Open {
                    return Ok(());
                }
                if state_rx.changed().await.is_err() {
                    return Err(RpcError::Closed);
                }
            }
        };
        tokio::time::timeout(max_wait, wait)
            .await
            .map_err(|_| RpcError::Timeout {
                method: "connect".to_string(),
            })?
    }

    /// Issues a one-shot call with the configured default timeout.
    ///
    /// # Errors
    ///
    /// Exactly one of three outcomes occurs: the method's result, an
    /// [`RpcError::Application`] carried back on the wire, or an
    /// [`RpcError::Timeout`] when no response arrives in time. A
    /// response arriving after the timeout is dropped.
    pub async fn call(&self, method: &str, params: Option<Params>) -> Result<Value, RpcError> {
        issue_call(&self.inner, method, params, self.inner.config.call_timeout).await
    }

    /// Issues a one-shot call with an explicit timeout override.
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call).
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Params>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        issue_call(&self.inner, method, params, timeout).await
    }

    /// Subscribes to a method, returning the subscription id and the
    /// event stream.
    ///
    /// Every event is the method's latest result (`Ok`) or an error
    /// push (`Err`); an error never terminates the subscription. The
    /// subscription persists across reconnects — it is resubmitted
    /// verbatim after every successful (re)connect — until
    /// [`unsubscribe`](Self::unsubscribe) is called or the event
    /// receiver is dropped.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Option<Params>,
    ) -> (String, mpsc::Receiver<Delivery>) {
        self.subscribe_with_id(None, method, params).await
    }

    /// Subscribes, optionally reusing an existing subscription id to
    /// update that subscription's method and parameters in place.
    pub async fn subscribe_with_id(
        &self,
        id: Option<String>,
        method: &str,
        params: Option<Params>,
    ) -> (String, mpsc::Receiver<Delivery>) {
        let (id, rx) = self
            .inner
            .registry
            .register_subscription(id, method, params.clone())
            .await;
        if self.state() == ConnectionState::Open {
            let _ = self
                .inner
                .out_tx
                .send(Envelope::subscribe(method, params, &id));
        } else {
            tracing::debug!(method, id, "not connected, subscription sent on next connect");
        }
        (id, rx)
    }

    /// Cancels the named subscriptions.
    ///
    /// Entries are removed locally whether or not the socket is open;
    /// the batched unsubscribe message is queued unconditionally and
    /// delivered on the next connect, where the server treats unknown
    /// ids as a no-op. Unsubscribing twice is safe.
    pub async fn unsubscribe(&self, ids: &[String]) {
        let removed = self.inner.registry.unsubscribe(ids).await;
        if removed.is_empty() {
            return;
        }
        let _ = self.inner.out_tx.send(Envelope::unsubscribe(removed));
    }

    /// Closes the connection for good.
    ///
    /// Idempotent and safe on an already-closed client. Pending
    /// one-shot calls are rejected with [`RpcError::Closed`]; errors
    /// from the underlying close are swallowed and logged, and no
    /// further lifecycle activity happens on this instance.
    pub fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.ctl_tx.send(Control::Shutdown);
    }
}

/// Returns `true` for a queued subscribe frame whose subscription has
/// since been cancelled.
///
/// A frame enqueued on one socket can survive a disconnect and drain
/// into the next one. For calls and unsubscribes that is harmless, but
/// a subscribe frame outliving its registry entry would resurrect the
/// subscription on the server with nothing client-side to receive its
/// pushes, so it must be dropped instead of sent.
async fn stale_subscribe(inner: &ClientInner, envelope: &Envelope) -> bool {
    if envelope.action.is_some() {
        return false;
    }
    let Some(ClientRef::One(id)) = &envelope.client else {
        return false;
    };
    !inner.registry.is_subscribed(id).await
}

/// Sends one envelope as a text frame.
async fn send_envelope(sink: &mut WsSink, envelope: &Envelope) -> Result<(), RpcError> {
    let text = envelope.to_text()?;
    tracing::trace!(frame = text, "sending");
    sink.send(Message::text(text))
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))
}

/// Registers, sends, and awaits one one-shot call.
async fn issue_call(
    inner: &ClientInner,
    method: &str,
    params: Option<Params>,
    timeout: Duration,
) -> Result<Value, RpcError> {
    if inner.shutdown.load(Ordering::SeqCst) {
        return Err(RpcError::Closed);
    }
    let (id, rx) = inner.registry.register_call(method).await;
    if inner
        .out_tx
        .send(Envelope::call(method, params, &id))
        .is_err()
    {
        inner.registry.remove(&id).await;
        return Err(RpcError::Closed);
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(RpcError::Closed),
        Err(_) => {
            // Whoever removes the entry first wins; a response racing
            // this removal has already resolved the receiver we just
            // consumed, and a later one finds nothing to deliver to.
            inner.registry.remove(&id).await;
            tracing::error!(method, id, "one-shot call timed out");
            Err(RpcError::Timeout {
                method: method.to_string(),
            })
        }
    }
}

/// Background task owning the socket across its whole life.
async fn supervise(
    inner: Arc<ClientInner>,
    mut out_rx: mpsc::UnboundedReceiver<Envelope>,
    mut ctl_rx: mpsc::UnboundedReceiver<Control>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut backoff = inner.config.reconnect_floor;
    let mut epoch: u64 = 0;

    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let _ = state_tx.send(ConnectionState::Connecting);

        match connect_async(inner.url.as_str()).await {
            Ok((socket, _response)) => {
                epoch += 1;
                backoff = inner.config.reconnect_floor;
                tracing::info!(url = inner.url, epoch, "connected");
                let (mut ws_tx, mut ws_rx) = socket.split();
                let _ = state_tx.send(ConnectionState::Open);

                // Resubmit every persistent subscription verbatim. A
                // subscribe queued concurrently in the open window can
                // produce a duplicate frame; the server treats a
                // repeated client id as a replacement, so this is
                // harmless.
                let resent = inner.registry.resubmissions().await;
                let mut resubmit_failed = false;
                for envelope in &resent {
                    if let Err(e) = send_envelope(&mut ws_tx, envelope).await {
                        tracing::warn!(error = %e, "resubmission failed, reconnecting");
                        resubmit_failed = true;
                        break;
                    }
                }
                if !resent.is_empty() && !resubmit_failed {
                    tracing::info!(count = resent.len(), "subscriptions resubmitted");
                }

                let exit = if resubmit_failed {
                    Exit::Disconnected
                } else {
                    let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&inner), epoch));
                    let exit =
                        run_open(&inner, epoch, &mut ws_tx, &mut ws_rx, &mut out_rx, &mut ctl_rx)
                            .await;
                    heartbeat.abort();
                    exit
                };

                if matches!(exit, Exit::ShuttingDown) {
                    let _ = state_tx.send(ConnectionState::Closing);
                    if let Err(e) = ws_tx.send(Message::Close(None)).await {
                        tracing::debug!(error = %e, "error closing socket, ignored");
                    }
                    break;
                }
                tracing::warn!(url = inner.url, "connection lost");
            }
            Err(e) => {
                tracing::warn!(url = inner.url, error = %e, "failed to connect");
            }
        }

        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let _ = state_tx.send(ConnectionState::Closed);
        tracing::debug!(delay_ms = backoff.as_millis() as u64, "reconnect scheduled");
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            ctl = ctl_rx.recv() => {
                if matches!(ctl, Some(Control::Shutdown) | None) {
                    break;
                }
            }
        }
        backoff = (backoff * 2).min(inner.config.reconnect_ceiling);
    }

    let _ = state_tx.send(ConnectionState::Closed);
    inner.registry.fail_all_calls().await;
    tracing::info!(url = inner.url, "client closed");
}

/// Serves one open socket until it dies or the client shuts down.
async fn run_open(
    inner: &ClientInner,
    epoch: u64,
    ws_tx: &mut WsSink,
    ws_rx: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    out_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    ctl_rx: &mut mpsc::UnboundedReceiver<Control>,
) -> Exit {
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ResponseEnvelope::parse(text.as_str()) {
                            Ok(response) => {
                                if let Some(dead) = inner.registry.dispatch(response).await {
                                    let _ = inner.out_tx.send(Envelope::unsubscribe(vec![dead]));
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Disconnected,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "read error");
                        return Exit::Disconnected;
                    }
                    _ => {}
                }
            }
            out = out_rx.recv() => {
                if let Some(envelope) = out {
                    if stale_subscribe(inner, &envelope).await {
                        tracing::debug!("dropping subscribe frame for cancelled subscription");
                        continue;
                    }
                    if send_envelope(ws_tx, &envelope).await.is_err() {
                        return Exit::Disconnected;
                    }
                }
            }
            ctl = ctl_rx.recv() => {
                match ctl {
                    Some(Control::Shutdown) | None => return Exit::ShuttingDown,
                    Some(Control::Dead { epoch: dead_epoch }) if dead_epoch == epoch => {
                        tracing::warn!("heartbeat missed, treating connection as dead");
                        return Exit::Disconnected;
                    }
                    Some(Control::Dead { .. }) => {
                        // Verdict about a socket we already replaced.
                    }
                }
            }
        }
    }
}

/// Periodic liveness probe: an ordinary one-shot call to the reserved
/// poll method, with a timeout shorter than the interval. A miss
/// detects half-open sockets the transport never reports as closed.
async fn heartbeat_loop(inner: Arc<ClientInner>, epoch: u64) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        ticker.tick().await;
        match issue_call(&inner, POLL_METHOD, None, inner.config.heartbeat_timeout).await {
            Ok(_) => tracing::trace!("heartbeat ok"),
            Err(e) => {
                tracing::error!(error = %e, "heartbeat failed, closing connection");
                let _ = inner.ctl_tx.send(Control::Dead { epoch });
                return;
            }
        }
    }
}
