//! End-to-end protocol tests: a real Axum server on an ephemeral port,
//! exercised through [`RpcClient`] over a live socket.

#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use wsrpc::app_state::AppState;
use wsrpc::client::{ConnectionState, RpcClient};
use wsrpc::config::ClientConfig;
use wsrpc::error::RpcError;
use wsrpc::proto::Params;
use wsrpc::server::dispatch::{DispatchTable, MethodSpec};
use wsrpc::server::handler::ws_handler;

/// Shared fixture state behind the `greeting` namespace.
#[derive(Debug, Clone)]
struct GreetingState {
    name: Arc<Mutex<String>>,
    reads: Arc<AtomicUsize>,
}

impl GreetingState {
    fn new() -> Self {
        Self {
            name: Arc::new(Mutex::new("World".to_string())),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

/// Builds the test dispatch table.
///
/// `greeting.get` is subscribable on the `greeting` channel and takes
/// an optional prefix argument; `greeting.set_name` notifies that
/// channel; `greeting.slow` stalls to exercise call timeouts.
fn greeting_table(state: &GreetingState) -> DispatchTable {
    let mut table = DispatchTable::with_builtins();

    let read_state = state.clone();
    table.register(
        "greeting",
        "get",
        MethodSpec::new(move |_ctx, params: Option<Params>| {
            let state = read_state.clone();
            async move {
                state.reads.fetch_add(1, Ordering::SeqCst);
                let prefix = params
                    .as_ref()
                    .and_then(Params::single)
                    .and_then(Value::as_str)
                    .unwrap_or("Hello")
                    .to_string();
                Ok(json!(format!("{prefix} {}", state.name.lock().await)))
            }
        })
        .subscribes(["greeting"]),
    );

    let write_state = state.clone();
    table.register(
        "greeting",
        "set_name",
        MethodSpec::new(move |_ctx, params: Option<Params>| {
            let state = write_state.clone();
            async move {
                let name = params
                    .as_ref()
                    .and_then(Params::single)
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::Application("expected a name".to_string()))?
                    .to_string();
                state.name.lock().await.clone_from(&name);
                Ok(json!(name))
            }
        })
        .notifies(["greeting"]),
    );

    table.register(
        "greeting",
        "slow",
        MethodSpec::new(|_ctx, _params| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!("done"))
        }),
    );

    table
}

/// A real server on a local port, serving connections as individually
/// abortable tasks so [`stop`](TestServer::stop) can sever live
/// sockets (plain `axum::serve` leaves accepted connections running).
struct TestServer {
    addr: SocketAddr,
    accept: JoinHandle<()>,
    conns: Arc<std::sync::Mutex<Vec<(JoinHandle<()>, std::net::TcpStream)>>>,
}

impl TestServer {
    /// Spawns a server on an ephemeral port (or a specific address,
    /// for restart-on-the-same-port tests).
    async fn spawn(dispatch: DispatchTable, addr: Option<SocketAddr>) -> Self {
        let app = Router::new()
            .route("/wsrpc", get(ws_handler))
            .with_state(AppState::new(dispatch));

        let Ok(fallback) = "127.0.0.1:0".parse() else {
            panic!("static addr should parse");
        };
        let bind_to = addr.unwrap_or(fallback);
        let mut listener = tokio::net::TcpListener::bind(bind_to).await;
        // Rebinding a just-freed port can transiently fail.
        for _ in 0..20 {
            if listener.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            listener = tokio::net::TcpListener::bind(bind_to).await;
        }
        let Ok(listener) = listener else {
            panic!("could not bind test server");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("listener has no local addr");
        };

        let conns = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conns);
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                // Keep an OS-level handle to the socket: the upgraded
                // WebSocket future is spawned internally by axum, out
                // of reach of our task handles, so severing the
                // connection requires shutting the socket itself down.
                let Ok(std_stream) = stream.into_std() else {
                    continue;
                };
                let Ok(raw) = std_stream.try_clone() else {
                    continue;
                };
                let Ok(stream) = tokio::net::TcpStream::from_std(std_stream) else {
                    continue;
                };
                let service = TowerToHyperService::new(app.clone());
                let conn = tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
                if let Ok(mut conns) = tracked.lock() {
                    conns.push((conn, raw));
                }
            }
        });
        Self {
            addr,
            accept,
            conns,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/wsrpc", self.addr)
    }

    /// Kills the server abruptly, dropping every open connection.
    fn stop(&self) {
        self.accept.abort();
        if let Ok(conns) = self.conns.lock() {
            for (conn, raw) in conns.iter() {
                conn.abort();
                let _ = raw.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        reconnect_floor: Duration::from_millis(50),
        reconnect_ceiling: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_secs(2),
    }
}

async fn open_client(server: &TestServer) -> RpcClient {
    let client = RpcClient::connect(&server.url(), fast_config());
    let Ok(()) = client.wait_until_open(Duration::from_secs(5)).await else {
        panic!("client should connect");
    };
    client
}

async fn next_event(
    rx: &mut tokio::sync::mpsc::Receiver<Result<Value, RpcError>>,
) -> Result<Value, RpcError> {
    let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await else {
        panic!("expected a subscription event");
    };
    event
}

#[tokio::test]
async fn call_resolves_with_result() {
    let state = GreetingState::new();
    let server = TestServer::spawn(greeting_table(&state), None).await;
    let client = open_client(&server).await;

    let Ok(result) = client
        .call("greeting.get", Some(Params::Single(json!("Hi"))))
        .await
    else {
        panic!("call should succeed");
    };
    assert_eq!(result, json!("Hi World"));

    client.close();
    server.stop();
}

#[tokio::test]
async fn unknown_method_rejects_the_call() {
    let state = GreetingState::new();
    let server = TestServer::spawn(greeting_table(&state), None).await;
    let client = open_client(&server).await;

    let result = client.call("greeting.missing", None).await;
    assert!(matches!(result, Err(RpcError::Application(_))));
    // The connection survives a rejected call.
    let Ok(result) = client.call("system.poll", None).await else {
        panic!("connection should still work");
    };
    assert_eq!(result, Value::Null);

    client.close();
    server.stop();
}

#[tokio::test]
async fn application_error_rejects_without_closing() {
    let state = GreetingState::new();
    let server = TestServer::spawn(greeting_table(&state), None).await;
    let client = open_client(&server).await;

    // set_name without arguments errors inside the handler.
    let result = client.call("greeting.set_name", None).await;
    assert!(matches!(result, Err(RpcError::Application(_))));
    assert_eq!(client.state(), ConnectionState::Open);

    client.close();
    server.stop();
}

#[tokio::test]
async fn slow_call_times_out_and_late_response_is_dropped() {
    let state = GreetingState::new();
    let server = TestServer::spawn(greeting_table(&state), None).await;
    let client = open_client(&server).await;

    let result = client
        .call_with_timeout("greeting.slow", None, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(RpcError::Timeout { .. })));

    // The late response arrives while this call is in flight; it must
    // not leak into the wrong pending entry.
    let Ok(result) = client.call("greeting.get", None).await else {
        panic!("subsequent call should succeed");
    };
    assert_eq!(result, json!("Hello World"));

    client.close();
    server.stop();
}

#[tokio::test]
async fn subscription_pushes_on_change_and_suppresses_duplicates() {
    let state = GreetingState::new();
    let server = TestServer::spawn(greeting_table(&state), None).await;
    let client = open_client(&server).await;

    let (_id, mut events) = client.subscribe("greeting.get", None).await;
    let Ok(initial) = next_event(&mut events).await else {
        panic!("initial evaluation should succeed");
    };
    assert_eq!(initial, json!("Hello World"));

    let Ok(_) = client
        .call("greeting.set_name", Some(Params::Single(json!("Rust"))))
        .await
    else {
        panic!("set_name should succeed");
    };
    let Ok(changed) = next_event(&mut events).await else {
        panic!("push should succeed");
    };
    assert_eq!(changed, json!("Hello Rust"));

    // Same value again: no push. The next event the stream sees must
    // be the one for the following, genuinely different value.
    let Ok(_) = client
        .call("greeting.set_name", Some(Params::Single(json!("Rust"))))
        .await
    else {
        panic!("set_name should succeed");
    };
    let Ok(_) = client
        .call("greeting.set_name", Some(Params::Single(json!("Go"))))
        .await
    else {
        panic!("set_name should succeed");
    };
    let Ok(next) = next_event(&mut events).await else {
        panic!("push should succeed");
    };
    assert_eq!(next, json!("Hello Go"));

    client.close();
    server.stop();
}

#[tokio::test]
async fn subscriptions_with_different_params_push_independently() {
    let state = GreetingState::new();
    let server = TestServer::spawn(greeting_table(&state), None).await;
    let client = open_client(&server).await;

    let (_id_a, mut events_a) = client
        .subscribe("greeting.get", Some(Params::Single(json!("Hello"))))
        .await;
    let (_id_b, mut events_b) = client
        .subscribe("greeting.get", Some(Params::Single(json!("Howdy"))))
        .await;
    let Ok(a) = next_event(&mut events_a).await else {
        panic!("initial evaluation should succeed");
    };
    let Ok(b) = next_event(&mut events_b).await else {
        panic!("initial evaluation should succeed");
    };
    assert_eq!(a, json!("Hello World"));
    assert_eq!(b, json!("Howdy World"));

    let Ok(_) = client
        .call("greeting.set_name", Some(Params::Single(json!("Crew"))))
        .await
    else {
        panic!("set_name should succeed");
    };
    let Ok(a) = next_event(&mut events_a).await else {
        panic!("push should succeed");
    };
    let Ok(b) = next_event(&mut events_b).await else {
        panic!("push should succeed");
    };
    assert_eq!(a, json!("Hello Crew"));
    assert_eq!(b, json!("Howdy Crew"));

    client.close();
    server.stop();
}

#[tokio::test]
async fn unsubscribe_stops_pushes() {
    let state = GreetingState::new();
    let server = TestServer::spawn(greeting_table(&state), None).await;
    let client = open_client(&server).await;

    let (id, mut events) = client.subscribe("greeting.get", None).await;
    let Ok(_) = next_event(&mut events).await else {
        panic!("initial evaluation should succeed");
    };

    client.unsubscribe(&[id.clone()]).await;
    // Unsubscribing again is a no-op.
    client.unsubscribe(&[id]).await;

    let Ok(_) = client
        .call("greeting.set_name", Some(Params::Single(json!("Nobody"))))
        .await
    else {
        panic!("set_name should succeed");
    };
    let quiet = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(matches!(quiet, Ok(None) | Err(_)));

    client.close();
    server.stop();
}

#[tokio::test]
async fn call_issued_while_disconnected_sends_after_connect() {
    let state = GreetingState::new();
    // Reserve a port, then free it so the client has nowhere to
    // connect yet.
    let probe = TestServer::spawn(greeting_table(&state), None).await;
    let addr = probe.addr;
    probe.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = RpcClient::connect(&format!("ws://{addr}/wsrpc"), fast_config());
    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .call_with_timeout("greeting.get", None, Duration::from_secs(5))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let server = TestServer::spawn(greeting_table(&state), Some(addr)).await;

    let Ok(Ok(result)) = call.await else {
        panic!("queued call should resolve after connect");
    };
    assert_eq!(result, json!("Hello World"));

    client.close();
    server.stop();
}

#[tokio::test]
async fn reconnect_resubmits_subscriptions_exactly_once() {
    let state = GreetingState::new();
    let server = TestServer::spawn(greeting_table(&state), None).await;
    let addr = server.addr;
    let client = open_client(&server).await;

    let (_id, mut events) = client.subscribe("greeting.get", None).await;
    let Ok(initial) = next_event(&mut events).await else {
        panic!("initial evaluation should succeed");
    };
    assert_eq!(initial, json!("Hello World"));
    assert_eq!(state.reads(), 1);

    server.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let server = TestServer::spawn(greeting_table(&state), Some(addr)).await;

    // The resubmitted subscription is evaluated afresh by the new
    // server and its reply reaches the same event stream.
    let Ok(after) = next_event(&mut events).await else {
        panic!("resubmitted evaluation should succeed");
    };
    assert_eq!(after, json!("Hello World"));
    assert_eq!(state.reads(), 2);

    client.close();
    server.stop();
}

#[tokio::test]
async fn heartbeat_miss_forces_a_reconnect() {
    let state = GreetingState::new();
    let mut table = greeting_table(&state);
    // Replace the builtin poll with one that never answers.
    table.register(
        "system",
        "poll",
        MethodSpec::new(|_ctx, _params| futures_util::future::pending()),
    );
    let server = TestServer::spawn(table, None).await;

    let config = ClientConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let client = RpcClient::connect(&server.url(), config);
    let Ok(()) = client.wait_until_open(Duration::from_secs(5)).await else {
        panic!("client should connect");
    };

    let (_id, mut events) = client.subscribe("greeting.get", None).await;
    let Ok(_) = next_event(&mut events).await else {
        panic!("initial evaluation should succeed");
    };

    // The dead heartbeat tears the connection down; the reconnect
    // resubmits the subscription, producing another event without any
    // mutation on the server.
    let Ok(_) = next_event(&mut events).await else {
        panic!("resubmitted evaluation should succeed");
    };
    assert!(state.reads() >= 2);

    client.close();
    server.stop();
}

#[tokio::test]
async fn close_rejects_pending_calls() {
    let state = GreetingState::new();
    let server = TestServer::spawn(greeting_table(&state), None).await;
    let client = open_client(&server).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .call_with_timeout("greeting.slow", None, Duration::from_secs(5))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close();

    let Ok(result) = pending.await else {
        panic!("call task should not panic");
    };
    assert!(matches!(result, Err(RpcError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);

    server.stop();
}
