//! wsrpc server entry point.
//!
//! Starts the Axum server with the RPC WebSocket endpoint and a small
//! demo namespace so the protocol is exercisable out of the box.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use wsrpc::app_state::AppState;
use wsrpc::config::RpcConfig;
use wsrpc::error::RpcError;
use wsrpc::proto::Params;
use wsrpc::server::dispatch::{DispatchTable, MethodSpec};
use wsrpc::server::handler::ws_handler;

/// Registers the `demo` namespace: a subscribable greeting plus the
/// mutator that notifies it.
fn register_demo(table: &mut DispatchTable) {
    let name = Arc::new(Mutex::new("World".to_string()));

    let read_name = Arc::clone(&name);
    table.register(
        "demo",
        "greeting",
        MethodSpec::new(move |_ctx, _params| {
            let name = Arc::clone(&read_name);
            async move { Ok(json!(format!("Hello {}!", name.lock().await))) }
        })
        .subscribes(["greeting"]),
    );

    table.register(
        "demo",
        "set_name",
        MethodSpec::new(move |_ctx, params: Option<Params>| {
            let name = Arc::clone(&name);
            async move {
                let new_name = params
                    .as_ref()
                    .and_then(Params::single)
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::Application("expected a name".to_string()))?
                    .to_string();
                name.lock().await.clone_from(&new_name);
                Ok(json!(new_name))
            }
        })
        .notifies(["greeting"]),
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = RpcConfig::from_env()?;
    tracing::info!(addr = %config.listen_addr, "starting wsrpc");

    // Build dispatch table
    let mut dispatch = DispatchTable::with_builtins();
    register_demo(&mut dispatch);
    tracing::info!(methods = dispatch.len(), "dispatch table ready");

    // Build application state
    let app_state = AppState::new(dispatch);

    // Build router
    let app = Router::new()
        .route("/wsrpc", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
