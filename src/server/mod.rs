// src/server/mod.rs
//! RPC server implementation.
//!
//! The server receives requests on a fixed-address receiving link, dispatches
//! each by subject to a bound handler, and sends back a correlated response.
//!
//! # Reply routing
//!
//! Sending a reply needs an outbound link, and which kind depends on the
//! peer: a peer advertising the relay capability routes arbitrary
//! destinations through one anonymous sending link, while other peers need a
//! dedicated link per reply address, pooled in a TTL [`LinkCache`]. That
//! choice can only be made once the connection open handshake reports the
//! peer's capabilities, so routing is an explicit two-state value: responses
//! produced earlier are buffered and drained, in order, exactly once when
//! the route is established.
//!
//! # Dispatch
//!
//! Requests are handled strictly in arrival order, each to completion before
//! the next is picked up. Handler panics are not caught; the caller of a
//! panicked handler never receives a response.

mod handler;

pub use handler::HandlerResult;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;
use tokio::task::JoinHandle;

use handler::BoxedHandler;

use crate::cache::lock_ignore_poison;
use crate::link_cache::{LinkCache, SenderFactory, RELAY_CAPABILITY};
use crate::macros::{log_debug, log_error, log_warn};
use crate::{
    // ---
    ConnectionPtr,
    ContainerPtr,
    Error,
    ErrorBody,
    Message,
    ReceiverHandle,
    ReceiverPtr,
    ReceiverSpec,
    Result,
    RpcConfig,
    SenderPtr,
    SUBJECT_BAD_METHOD,
    SUBJECT_OK,
};

/// How replies leave the server once capability negotiation is done.
enum SendStrategy {
    /// One shared anonymous link; the peer routes by the message's `to`.
    Relay(SenderPtr),

    /// A dedicated link per destination, pooled with TTL expiry.
    PerDestination(LinkCache),
}

impl SendStrategy {
    // ---
    async fn send(&self, message: Message) -> Result<()> {
        // ---
        match self {
            SendStrategy::Relay(sender) => sender.send(message).await,
            SendStrategy::PerDestination(cache) => {
                let to = message
                    .properties
                    .to
                    .clone()
                    .ok_or(Error::MalformedMessage("response missing destination"))?;

                // Re-fetched for every send: a cached link may have been
                // closed by eviction since the last use.
                let sender = cache.get(&to).await?;
                sender.send(message).await
            }
        }
    }
}

/// Reply-route state machine: buffer until negotiation, then route.
enum ReplyRoute {
    Buffering(Vec<Message>),
    Routing(SendStrategy),
}

/// Running RPC server instance.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    connection: ConnectionPtr,
    receiver: ReceiverPtr,

    handlers: Mutex<HashMap<String, BoxedHandler>>,

    /// Held across each response send; serializes the buffered drain against
    /// dispatch.
    route: tokio::sync::Mutex<ReplyRoute>,

    /// Background task handles, set once right after construction.
    negotiate_task: OnceLock<JoinHandle<()>>,
    rx_task: OnceLock<JoinHandle<()>>,
}

impl RpcServer {
    // ---
    /// Connect through the container and attach the request receiving link.
    ///
    /// Handlers may be bound before or after requests start arriving;
    /// responses produced before capability negotiation completes are
    /// buffered.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the receiver attach fails.
    pub async fn connect(container: ContainerPtr, config: &RpcConfig) -> Result<Self> {
        // ---
        let connection = container.connect(&config.host, config.port).await?;

        let ReceiverHandle {
            opened,
            mut inbox,
            link,
        } = connection
            .attach_receiver(ReceiverSpec::Named(config.address.clone()))
            .await?;

        // The request link's own open carries no information we need.
        drop(opened);

        let reply_ttl = config.reply_ttl;

        let inner = Arc::new(Inner {
            // ---
            connection: connection.clone(),
            receiver: link,
            handlers: Mutex::new(HashMap::new()),
            route: tokio::sync::Mutex::new(ReplyRoute::Buffering(Vec::new())),
            negotiate_task: OnceLock::new(),
            rx_task: OnceLock::new(),
        });

        // Spawned only after the Arc exists: the tasks' first upgrade can
        // never observe a zero strong count mid-construction.
        let negotiate_weak = Arc::downgrade(&inner);
        let negotiate_connection = connection;

        let negotiate_task = tokio::spawn(async move {
            // ---
            let capabilities = match negotiate_connection.opened().await {
                Ok(capabilities) => capabilities,
                Err(err) => {
                    log_error!("connection open failed: {err}");
                    return;
                }
            };

            let strategy = if capabilities.contains(RELAY_CAPABILITY) {
                log_debug!("peer offers {RELAY_CAPABILITY}; using one shared reply link");
                match negotiate_connection.attach_sender(None).await {
                    Ok(sender) => SendStrategy::Relay(sender),
                    Err(err) => {
                        log_error!("failed to attach relay sender: {err}");
                        return;
                    }
                }
            } else {
                log_debug!("peer offers no relay; caching reply links per destination");
                let factory_connection = negotiate_connection.clone();
                let factory: SenderFactory = Arc::new(move |address| {
                    let connection = factory_connection.clone();
                    Box::pin(async move { connection.attach_sender(Some(address)).await })
                });
                SendStrategy::PerDestination(LinkCache::new(reply_ttl, factory))
            };

            let Some(inner) = negotiate_weak.upgrade() else {
                return;
            };

            // Drain while holding the route lock so dispatch cannot
            // interleave ahead of buffered responses.
            let mut route = inner.route.lock().await;
            let buffered = match std::mem::replace(&mut *route, ReplyRoute::Routing(strategy)) {
                ReplyRoute::Buffering(queue) => queue,
                ReplyRoute::Routing(_) => Vec::new(),
            };

            if let ReplyRoute::Routing(strategy) = &*route {
                for message in buffered {
                    if let Err(_err) = strategy.send(message).await {
                        log_warn!("failed to send buffered response: {_err}");
                    }
                }
            }
        });

        let rx_weak = Arc::downgrade(&inner);

        let rx_task = tokio::spawn(async move {
            // ---
            while let Some(request) = inbox.recv().await {
                match rx_weak.upgrade() {
                    Some(inner) => {
                        let server = RpcServer { inner };
                        // Handled to completion before the next request.
                        server.dispatch(request).await;
                    }
                    None => {
                        // Inner was dropped, exit loop
                        break;
                    }
                }
            }

            log_debug!("request link inbox closed");
        });

        let _ = inner.negotiate_task.set(negotiate_task);
        let _ = inner.rx_task.set(rx_task);

        Ok(Self { inner })
    }

    /// Bind a callback-style handler under `name`.
    ///
    /// The handler receives the request body and resolves to a
    /// [`HandlerResult`]: `Ok` produces an `"ok"` response, `Err` a response
    /// whose subject is the error's name (or `"error"`).
    pub fn bind<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        // ---
        let mut handlers = lock_ignore_poison(&self.inner.handlers);
        handlers.insert(name.into(), handler::wrap(handler));
    }

    /// Bind a pure function under `name` as an always-success handler.
    pub fn bind_sync<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        // ---
        let mut handlers = lock_ignore_poison(&self.inner.handlers);
        handlers.insert(name.into(), handler::wrap_sync(handler));
    }

    /// Close the receiving link then the connection.
    ///
    /// Cached per-destination reply links are not closed here; the pool's
    /// own TTL sweep takes care of them.
    ///
    /// # Errors
    ///
    /// Returns the first close error encountered.
    pub async fn close(&self) -> Result<()> {
        // ---
        self.inner.receiver.close().await?;
        self.inner.connection.close().await
    }

    /// Handle one inbound request: run the bound handler (or synthesize a
    /// `bad-method` response) and route the correlated reply.
    async fn dispatch(&self, request: Message) {
        // ---
        let Some(reply_to) = request.properties.reply_to.clone() else {
            log_warn!("request missing reply_to; dropping");
            return;
        };
        let correlation_id = request.properties.message_id;
        let subject = request.properties.subject.clone().unwrap_or_default();

        let handler = {
            let handlers = lock_ignore_poison(&self.inner.handlers);
            handlers.get(&subject).cloned()
        };

        let (response_subject, body) = match handler {
            Some(handler) => match handler(request.body).await {
                Ok(result) => (SUBJECT_OK.to_string(), result),
                Err(error) => (error.subject().to_string(), error_payload(&error)),
            },
            None => {
                // Never invokes user code.
                log_debug!("no handler bound for {subject:?}");
                (
                    SUBJECT_BAD_METHOD.to_string(),
                    Value::String(format!("Unrecognised method {subject}")),
                )
            }
        };

        let response = Message::response(reply_to, correlation_id, &response_subject, body);
        self.deliver(response).await;
    }

    /// Hand a response to the current route: buffered while negotiating,
    /// sent via the established strategy afterwards.
    async fn deliver(&self, message: Message) {
        // ---
        let mut route = self.inner.route.lock().await;
        match &mut *route {
            ReplyRoute::Buffering(queue) => {
                log_debug!("buffering response until capability negotiation completes");
                queue.push(message);
            }
            ReplyRoute::Routing(strategy) => {
                if let Err(_err) = strategy.send(message).await {
                    log_warn!("failed to send response: {_err}");
                }
            }
        }
    }
}

/// Serialize a handler error for the response body.
fn error_payload(error: &ErrorBody) -> Value {
    // ErrorBody is plain strings; serialization cannot fail in practice.
    serde_json::to_value(error).unwrap_or(Value::Null)
}
