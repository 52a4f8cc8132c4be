//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::server::broker::ChannelBroker;
use crate::server::dispatch::DispatchTable;

/// Shared server state available to handlers via Axum's `State`
/// extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Immutable method dispatch table.
    pub dispatch: Arc<DispatchTable>,
    /// Channel broker for subscription fan-out.
    pub broker: Arc<ChannelBroker>,
}

impl AppState {
    /// Builds state from a finished dispatch table.
    #[must_use]
    pub fn new(dispatch: DispatchTable) -> Self {
        let dispatch = Arc::new(dispatch);
        let broker = Arc::new(ChannelBroker::new(Arc::clone(&dispatch)));
        Self { dispatch, broker }
    }
}
