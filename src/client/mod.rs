// src/client/mod.rs
//! RPC client implementation.
//!
//! This module contains the core [`RpcClient`] type which issues correlated
//! requests over a fixed-address sending link and receives responses on a
//! dynamically-addressed receiving link.
//!
//! # Architecture
//!
//! The client attaches one sending link at the configured request address and
//! one receiving link with a remote-assigned (dynamic) address, then runs a
//! background receive task. The task first waits for the receiving link to
//! open — only then is the reply address known — flushes every request
//! buffered in the meantime, and from then on matches inbound responses to
//! waiting callers by correlation id.
//!
//! # Concurrency
//!
//! Multiple requests can be in flight simultaneously. Client state (pending
//! buffer vs. ready) lives behind an async mutex held across each send, so a
//! call racing the pending flush cannot interleave ahead of buffered
//! requests. The outstanding map is a plain mutex; operations on it are just
//! HashMap insert/remove.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::lock_ignore_poison;
use crate::macros::{log_debug, log_warn};
use crate::{
    // ---
    protocol,
    Address,
    ContainerPtr,
    Error,
    Message,
    ReceiverHandle,
    ReceiverPtr,
    ReceiverSpec,
    Result,
    RpcConfig,
    SenderPtr,
};

/// A call buffered before the reply address is known.
///
/// Created by `call()` while connecting, consumed exactly once by the flush
/// that runs when the receiving link opens, in original insertion order.
struct PendingRequest {
    id: u64,
    name: String,
    args: Value,
    tx: oneshot::Sender<Value>,
}

/// Client lifecycle: `Connecting` until the dynamic reply address is
/// assigned, `Ready` afterwards.
enum ClientState {
    Connecting { pending: Vec<PendingRequest> },
    Ready { reply_to: Address },
}

/// Response callbacks keyed by request id; entries are removed when the
/// matching response arrives.
type OutstandingMap = HashMap<u64, oneshot::Sender<Value>>;

/// A reply that has been requested but not yet received.
///
/// Awaiting it blocks until the matching response arrives; there is no
/// timeout at this layer (see [`RpcClient::call_with_timeout`] for the
/// opt-in wrapper).
pub struct PendingReply {
    rx: oneshot::Receiver<Value>,
}

impl PendingReply {
    /// Wait for the correlated response body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResponseDropped`] if the client was torn down before
    /// a response arrived.
    pub async fn response(self) -> Result<Value> {
        self.rx.await.map_err(|_| Error::ResponseDropped)
    }
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    connection: crate::ConnectionPtr,
    sender: SenderPtr,
    receiver: ReceiverPtr,

    /// Held across sends; serializes the pending flush against new calls.
    state: tokio::sync::Mutex<ClientState>,

    outstanding: Mutex<OutstandingMap>,

    /// Receive task handle, set once right after construction.
    rx_task: OnceLock<JoinHandle<()>>,
}

impl RpcClient {
    // ---
    /// Connect through the container and attach the request/reply links.
    ///
    /// The returned client is usable immediately: calls made before the
    /// reply link opens are buffered and flushed, in order, at open.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or either link attach fails.
    pub async fn connect(container: ContainerPtr, config: &RpcConfig) -> Result<Self> {
        // ---
        let connection = container.connect(&config.host, config.port).await?;
        let sender = connection.attach_sender(Some(config.address.clone())).await?;

        let ReceiverHandle {
            opened,
            mut inbox,
            link,
        } = connection.attach_receiver(ReceiverSpec::Dynamic).await?;

        let inner = Arc::new(Inner {
            // ---
            connection,
            sender,
            receiver: link,
            state: tokio::sync::Mutex::new(ClientState::Connecting {
                pending: Vec::new(),
            }),
            outstanding: Mutex::new(OutstandingMap::new()),
            rx_task: OnceLock::new(),
        });

        // Spawned only after the Arc exists: the task's first upgrade can
        // never observe a zero strong count mid-construction.
        let weak = Arc::downgrade(&inner);

        let rx_task = tokio::spawn(async move {
            // ---
            // The reply address is only known once the link opens.
            let reply_to = match opened.await {
                Ok(address) => address,
                Err(_) => {
                    log_debug!("reply link closed before opening");
                    return;
                }
            };

            if let Some(inner) = weak.upgrade() {
                let client = RpcClient { inner };
                client.flush_pending(reply_to).await;
            } else {
                return;
            }

            while let Some(message) = inbox.recv().await {
                match weak.upgrade() {
                    Some(inner) => {
                        let client = RpcClient { inner };
                        client.handle_response(message);
                    }
                    None => {
                        // Inner was dropped, exit loop
                        break;
                    }
                }
            }

            log_debug!("reply link inbox closed");
        });

        let _ = inner.rx_task.set(rx_task);

        Ok(Self { inner })
    }

    /// Issue a request and wait for the correlated response body.
    ///
    /// `args` is opaque to this layer and travels as the message body. There
    /// is no timeout: a request with no matching response waits forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be transmitted, or
    /// [`Error::ResponseDropped`] if the client is torn down while waiting.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        // ---
        self.submit(name, args).await?.response().await
    }

    /// Issue a request without waiting for its response.
    ///
    /// If the reply link has not opened yet the request is buffered and
    /// transmitted, in submission order, once it does.
    ///
    /// # Errors
    ///
    /// Returns an error if an immediate transmit fails. Buffered requests
    /// that later fail to transmit are logged and their replies abandoned.
    pub async fn submit(&self, name: &str, args: Value) -> Result<PendingReply> {
        // ---
        let id = protocol::next_request_id();
        let (tx, rx) = oneshot::channel();

        let mut state = self.inner.state.lock().await;
        match &mut *state {
            ClientState::Ready { reply_to } => {
                let reply_to = reply_to.clone();
                self.transmit(id, name, args, reply_to, tx).await?;
            }
            ClientState::Connecting { pending } => {
                log_debug!("buffering request {id} ({name}) until the reply link opens");
                pending.push(PendingRequest {
                    id,
                    name: name.to_string(),
                    args,
                    tx,
                });
            }
        }

        Ok(PendingReply { rx })
    }

    /// Issue a request with an overall timeout.
    ///
    /// Convenience wrapper layering a deadline over [`call`](Self::call);
    /// the correlation core itself remains timeout-free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no response arrives within `timeout`.
    pub async fn call_with_timeout(
        &self,
        name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        // ---
        time::timeout(timeout, self.call(name, args))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Create a named method handle forwarding to [`call`](Self::call).
    ///
    /// Pure ergonomic sugar, no additional semantics.
    pub fn define(&self, name: impl Into<String>) -> Method {
        // ---
        Method {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// Close the receiving link, the sending link, then the connection, in
    /// that order.
    ///
    /// Pending and outstanding requests are not drained or failed: callers
    /// that close with work in flight silently lose those replies.
    ///
    /// # Errors
    ///
    /// Returns the first close error encountered.
    pub async fn close(&self) -> Result<()> {
        // ---
        self.inner.receiver.close().await?;
        self.inner.sender.close().await?;
        self.inner.connection.close().await
    }

    /// Record the callback and transmit the request message.
    ///
    /// On a send failure the outstanding entry is removed again and the
    /// callback dropped; the waiting reply resolves to
    /// [`Error::ResponseDropped`] instead of hanging.
    async fn transmit(
        &self,
        id: u64,
        name: &str,
        args: Value,
        reply_to: Address,
        tx: oneshot::Sender<Value>,
    ) -> Result<()> {
        // ---
        {
            let mut outstanding = lock_ignore_poison(&self.inner.outstanding);
            outstanding.insert(id, tx);
        }

        let message = Message::request(name, args, id, reply_to);
        if let Err(err) = self.inner.sender.send(message).await {
            let mut outstanding = lock_ignore_poison(&self.inner.outstanding);
            outstanding.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    /// Transition to `Ready` and replay every buffered request through the
    /// regular send path, in arrival order.
    ///
    /// Runs at most once, on the single receiver-open event. The state lock
    /// is held for the whole flush so new calls cannot jump the queue.
    async fn flush_pending(&self, reply_to: Address) {
        // ---
        let mut state = self.inner.state.lock().await;

        let previous = std::mem::replace(
            &mut *state,
            ClientState::Ready {
                reply_to: reply_to.clone(),
            },
        );

        let pending = match previous {
            ClientState::Connecting { pending } => pending,
            ClientState::Ready { .. } => return,
        };

        log_debug!("reply link open at {reply_to}; flushing {} request(s)", pending.len());

        for request in pending {
            if let Err(_err) = self
                .transmit(request.id, &request.name, request.args, reply_to.clone(), request.tx)
                .await
            {
                log_warn!("failed to flush buffered request {}: {_err}", request.id);
            }
        }
    }

    /// Match an inbound response to its outstanding callback.
    ///
    /// Unmatched responses are dropped; that is not an error condition
    /// (e.g. late delivery after a peer restart).
    fn handle_response(&self, message: Message) {
        // ---
        let Some(correlation_id) = message.properties.correlation_id else {
            log_warn!("response missing correlation id; dropping");
            return;
        };

        let tx = {
            let mut outstanding = lock_ignore_poison(&self.inner.outstanding);
            outstanding.remove(&correlation_id)
        };

        match tx {
            Some(tx) => {
                if tx.send(message.body).is_err() {
                    log_debug!("response arrived after request abandoned (id {correlation_id})");
                }
            }
            None => {
                log_debug!("no outstanding request for correlation id {correlation_id}; dropping");
            }
        }
    }
}

/// Named method handle created by [`RpcClient::define`].
#[derive(Clone)]
pub struct Method {
    client: RpcClient,
    name: String,
}

impl Method {
    /// Invoke the method; forwards to [`RpcClient::call`].
    pub async fn call(&self, args: Value) -> Result<Value> {
        self.client.call(&self.name, args).await
    }

    /// The bound method name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
