//! WebSocket connection actor.
//!
//! Runs the read/write loop for a single client connection. All
//! outbound traffic — direct replies and broker pushes alike — flows
//! through one per-connection queue, so the wire order matches
//! evaluation order: a notifying call's own pushes are enqueued before
//! its reply.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::ConnectionId;
use super::broker::{ChannelBroker, PushSender};
use super::dispatch::{CallContext, DispatchTable};
use crate::proto::{Envelope, Inbound, ResponseEnvelope};

/// Runs the read/write loop for one upgraded WebSocket connection.
///
/// The actor exits when the peer closes or the transport fails; either
/// way every subscription owned by this connection is removed from the
/// broker before the task ends.
pub async fn run_connection(
    socket: WebSocket,
    dispatch: Arc<DispatchTable>,
    broker: Arc<ChannelBroker>,
) {
    let conn = ConnectionId::new();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<ResponseEnvelope>();
    tracing::debug!(%conn, "connection opened");

    loop {
        tokio::select! {
            // Incoming frame from the client.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, conn, &dispatch, &broker, &push_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%conn, error = %e, "transport error, closing");
                        break;
                    }
                    _ => {}
                }
            }
            // Outbound reply or broker push.
            out = push_rx.recv() => {
                if let Some(envelope) = out {
                    match envelope.to_text() {
                        Ok(text) => {
                            if ws_tx.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(%conn, error = %e, "dropping unserializable response");
                        }
                    }
                }
            }
        }
    }

    broker.remove_connection(conn).await;
    tracing::debug!(%conn, "connection closed");
}

/// Handles one text frame: unsubscribe actions and method invocations.
///
/// Protocol errors drop the frame and leave the connection open.
/// Application errors and unknown methods become `"error"` responses
/// echoing the request's correlation id; a request that carried no id
/// gets no reply of any kind.
async fn handle_text(
    text: &str,
    conn: ConnectionId,
    dispatch: &DispatchTable,
    broker: &ChannelBroker,
    push: &PushSender,
) {
    let inbound = match Envelope::parse(text).and_then(Envelope::classify) {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::warn!(%conn, error = %e, "dropping malformed message");
            return;
        }
    };

    match inbound {
        Inbound::Unsubscribe { clients } => {
            broker.unsubscribe(conn, &clients).await;
        }
        Inbound::Invoke {
            method,
            client,
            callback,
            params,
        } => {
            let outcome = match dispatch.resolve(&method) {
                Ok(spec) => {
                    let ctx = CallContext {
                        connection: conn,
                        client: client.clone(),
                        callback: callback.clone(),
                    };
                    let result = spec.invoke(ctx, params.clone()).await;
                    if let (Ok(value), Some(client_id)) = (&result, &client)
                        && !spec.subscribed_channels().is_empty()
                    {
                        broker
                            .subscribe(
                                conn,
                                client_id,
                                &method,
                                params,
                                spec.subscribed_channels(),
                                push.clone(),
                                value,
                            )
                            .await;
                    }
                    // Notification fires even when the method errored:
                    // a partial mutation still has to reach subscribers.
                    if !spec.notified_channels().is_empty() {
                        broker.notify(spec.notified_channels()).await;
                    }
                    result
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(result) => {
                    if let Some(callback) = &callback {
                        let _ = push.send(ResponseEnvelope::call_data(callback, result));
                    } else if let Some(client) = &client {
                        let _ = push.send(ResponseEnvelope::client_data(client, result));
                    }
                }
                Err(e) => {
                    tracing::warn!(%conn, method, error = %e, "method invocation failed");
                    if callback.is_some() || client.is_some() {
                        let _ = push.send(ResponseEnvelope::error(
                            client.as_deref(),
                            callback.as_deref(),
                            &e,
                        ));
                    }
                }
            }
        }
    }
}
