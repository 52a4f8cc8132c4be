//! Function exposure and dispatch table.
//!
//! [`DispatchTable`] maps an external `"<namespace>.<name>"` method
//! string to an invokable handler plus its declared channel bindings.
//! Registration is an explicit call made before the server starts; the
//! table is immutable afterwards, so lookups need no locking. Channel
//! metadata is an explicit record on [`MethodSpec`], never introspected
//! from the handler.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::ConnectionId;
use crate::error::RpcError;
use crate::proto::Params;

/// Reserved heartbeat method. Clients invoke it as an ordinary
/// one-shot call; any successful response keeps the connection alive.
pub const POLL_METHOD: &str = "system.poll";

/// Per-request context passed explicitly into every handler.
///
/// There is no ambient request state; everything a handler may need to
/// know about its caller is here.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The invoking connection.
    pub connection: ConnectionId,
    /// Subscription correlation id, when the request is a subscribe.
    pub client: Option<String>,
    /// One-shot correlation id, when the request is a call.
    pub callback: Option<String>,
}

impl CallContext {
    /// Context for an internal (non-protocol) invocation, e.g. the
    /// broker re-evaluating a stored subscription.
    #[must_use]
    pub fn internal(connection: ConnectionId, client: Option<String>) -> Self {
        Self {
            connection,
            client,
            callback: None,
        }
    }
}

/// Boxed async handler: `(context, params) -> result`.
pub type Handler =
    Arc<dyn Fn(CallContext, Option<Params>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// An invokable function plus its declared channel metadata.
///
/// `subscribes` means: invoking this method over the protocol with a
/// client id creates/refreshes a subscription bound to those channels.
/// `notifies` means: after a protocol invocation of this method
/// returns, those channels' subscriptions are re-evaluated.
#[derive(Clone)]
pub struct MethodSpec {
    handler: Handler,
    subscribes: Vec<String>,
    notifies: Vec<String>,
}

impl MethodSpec {
    /// Wraps an async function as a method with no channel bindings.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CallContext, Option<Params>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |ctx, params| Box::pin(f(ctx, params))),
            subscribes: Vec::new(),
            notifies: Vec::new(),
        }
    }

    /// Declares the channels a subscription to this method binds to.
    #[must_use]
    pub fn subscribes<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.subscribes = normalize_channels(channels);
        self
    }

    /// Declares the channels this method notifies after it returns.
    #[must_use]
    pub fn notifies<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.notifies = normalize_channels(channels);
        self
    }

    /// Channels a subscription to this method binds to.
    #[must_use]
    pub fn subscribed_channels(&self) -> &[String] {
        &self.subscribes
    }

    /// Channels this method notifies.
    #[must_use]
    pub fn notified_channels(&self) -> &[String] {
        &self.notifies
    }

    /// Invokes the raw handler. Channel side effects (subscription
    /// registration, notification fan-out) are the broker's job, not
    /// the handler's.
    pub async fn invoke(
        &self,
        ctx: CallContext,
        params: Option<Params>,
    ) -> Result<Value, RpcError> {
        (self.handler)(ctx, params).await
    }
}

impl fmt::Debug for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSpec")
            .field("subscribes", &self.subscribes)
            .field("notifies", &self.notifies)
            .finish_non_exhaustive()
    }
}

/// Normalizes a channel list: trims whitespace, drops empties, and
/// de-duplicates. The result is sorted so metadata compares stably.
pub fn normalize_channels<I, S>(channels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = channels
        .into_iter()
        .map(|c| c.as_ref().trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    set.into_iter().collect()
}

/// Immutable name-to-method mapping for one server.
#[derive(Debug, Default)]
pub struct DispatchTable {
    methods: HashMap<String, MethodSpec>,
}

impl DispatchTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table pre-populated with the built-in `system`
    /// namespace (currently only the heartbeat method).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register(
            "system",
            "poll",
            MethodSpec::new(|ctx: CallContext, _params| async move {
                tracing::debug!(conn = %ctx.connection, "heartbeat poll");
                Ok(Value::Null)
            }),
        );
        table
    }

    /// Binds a method under `<namespace>.<name>`.
    ///
    /// Names with a leading underscore are private by convention and
    /// skipped with a warning, as are namespaces or names containing a
    /// dot (the wire format reserves the dot as separator). Duplicate
    /// registration replaces the previous binding with a warning.
    pub fn register(&mut self, namespace: &str, name: &str, spec: MethodSpec) {
        if name.starts_with('_') {
            tracing::warn!(namespace, name, "skipping private method registration");
            return;
        }
        if namespace.contains('.') || name.contains('.') {
            tracing::warn!(namespace, name, "skipping method with dotted name");
            return;
        }
        let key = format!("{namespace}.{name}");
        if self.methods.insert(key.clone(), spec).is_some() {
            tracing::warn!(method = key, "replacing existing method registration");
        }
    }

    /// Resolves an inbound method name to its spec.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::UnknownMethod`] when nothing is bound under
    /// the given name, including malformed names such as
    /// `"too.many.dots"` or a bare name without a namespace.
    pub fn resolve(&self, method: &str) -> Result<&MethodSpec, RpcError> {
        self.methods
            .get(method)
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` if no methods are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> CallContext {
        CallContext::internal(ConnectionId::new(), None)
    }

    fn echo_spec() -> MethodSpec {
        MethodSpec::new(|_ctx, params: Option<Params>| async move {
            let value = params
                .as_ref()
                .and_then(Params::single)
                .cloned()
                .ok_or_else(|| RpcError::Application("expected one argument".to_string()))?;
            Ok(value)
        })
    }

    #[tokio::test]
    async fn resolves_and_invokes() {
        let mut table = DispatchTable::new();
        table.register("test", "echo", echo_spec());

        let Ok(spec) = table.resolve("test.echo") else {
            panic!("method should resolve");
        };
        let Ok(result) = spec
            .invoke(ctx(), Some(Params::Single(json!("hello"))))
            .await
        else {
            panic!("echo should succeed");
        };
        assert_eq!(result, json!("hello"));
    }

    #[test]
    fn unknown_names_error_without_panicking() {
        let table = DispatchTable::with_builtins();
        for name in ["missing", "crud.missing", "too.many.dots", "system.poll.extra"] {
            assert!(matches!(
                table.resolve(name),
                Err(RpcError::UnknownMethod(_))
            ));
        }
    }

    #[test]
    fn private_and_dotted_names_are_skipped() {
        let mut table = DispatchTable::new();
        table.register("test", "_hidden", echo_spec());
        table.register("test", "bad.name", echo_spec());
        table.register("bad.ns", "name", echo_spec());
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_registration_replaces() {
        let mut table = DispatchTable::new();
        table.register("test", "echo", echo_spec());
        table.register("test", "echo", echo_spec().notifies(["x"]));
        assert_eq!(table.len(), 1);
        let Ok(spec) = table.resolve("test.echo") else {
            panic!("method should resolve");
        };
        assert_eq!(spec.notified_channels(), ["x"]);
    }

    #[test]
    fn channel_normalization() {
        assert!(normalize_channels(Vec::<&str>::new()).is_empty());
        assert!(normalize_channels(["", "   "]).is_empty());
        assert_eq!(
            normalize_channels(["topic-one", "topic-two"]),
            ["topic-one", "topic-two"]
        );
        assert_eq!(
            normalize_channels(["repeated-topic", "repeated-topic"]),
            ["repeated-topic"]
        );
        assert_eq!(
            normalize_channels(["   topic-padded-left", "topic-padded-right   "]),
            ["topic-padded-left", "topic-padded-right"]
        );
    }

    #[tokio::test]
    async fn builtin_poll_returns_null() {
        let table = DispatchTable::with_builtins();
        let Ok(spec) = table.resolve(POLL_METHOD) else {
            panic!("poll should be registered");
        };
        let Ok(result) = spec.invoke(ctx(), None).await else {
            panic!("poll should succeed");
        };
        assert_eq!(result, Value::Null);
    }
}
