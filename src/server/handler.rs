use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::cache::BoxFuture;
use crate::ErrorBody;

/// What a handler resolves to: a result body, or an error payload that
/// becomes the response subject and body.
pub type HandlerResult = std::result::Result<Value, ErrorBody>;

/// Type-erased async handler.
///
/// Takes the request body and resolves to a [`HandlerResult`]. Wrapped in
/// `Arc` for cheap cloning out of the registry.
pub(super) type BoxedHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap a callback-style (async, fallible) handler.
pub(super) fn wrap<F, Fut>(handler: F) -> BoxedHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    // ---
    Arc::new(move |args: Value| {
        let fut = handler(args);
        Box::pin(fut) as BoxFuture<'static, HandlerResult>
    })
}

/// Wrap a pure function as an always-success handler.
///
/// The function runs before the returned future is polled; panics inside it
/// are not caught and propagate to the ambient fault handling, in which case
/// no response is sent.
pub(super) fn wrap_sync<F>(handler: F) -> BoxedHandler
where
    F: Fn(Value) -> Value + Send + Sync + 'static,
{
    // ---
    Arc::new(move |args: Value| {
        let result = handler(args);
        Box::pin(async move { Ok(result) }) as BoxFuture<'static, HandlerResult>
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn wrap_sync_always_succeeds() {
        // ---
        let handler = wrap_sync(|args| json!(args["n"].as_i64().unwrap_or(0) + 1));

        let result = handler(json!({"n": 41})).await;
        assert_eq!(result.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn wrap_preserves_handler_errors() {
        // ---
        let handler = wrap(|_args| async { Err(ErrorBody::named("nope", "not today")) });

        let error = handler(json!(null)).await.unwrap_err();
        assert_eq!(error.subject(), "nope");
        assert_eq!(error.message, "not today");
    }
}
