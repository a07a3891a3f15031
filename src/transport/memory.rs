//! In-memory link substrate.
//!
//! A pure in-process implementation of the domain link traits, intended for
//! testing, local execution, and as a reference for substrate semantics.
//!
//! ## Reference Semantics
//!
//! - A receiving link's route is registered at attach time; messages sent to
//!   its address after attach are deliverable. Messages to an address with
//!   no route are dropped (logged, not an error), as on a real substrate.
//! - Open notifications (connection open, receiver open) fire once the hub's
//!   gate is open. [`MemoryHub::new`] opens immediately; [`MemoryHub::gated`]
//!   holds every open until [`MemoryHub::open`] is called, letting tests
//!   exercise the buffering windows deterministically.
//! - Dynamic receivers get a hub-generated address, reported through the
//!   handle's `opened` channel.
//!
//! ## Non-Goals
//!
//! No emulation of broker failure modes, persistence, or flow control. This
//! substrate exists to provide a deterministic baseline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, RwLock};

use crate::cache::lock_ignore_poison;
use crate::macros::{log_debug, log_info};
use crate::{
    // ---
    Address,
    Capabilities,
    Connection,
    ConnectionPtr,
    Container,
    ContainerPtr,
    Error,
    Message,
    ReceiverHandle,
    ReceiverLink,
    ReceiverSpec,
    Result,
    Sender,
    SenderPtr,
};

/// Shared message bus for the in-memory substrate.
///
/// Simulates a remote container within a single process: every connection
/// made through the same hub can reach every receiving link attached through
/// it. Construct one hub per test for isolation.
pub struct MemoryHub {
    // ---
    routes: RwLock<HashMap<Address, mpsc::Sender<Message>>>,

    /// Capabilities this hub advertises to connecting peers at open.
    offered: Mutex<Capabilities>,

    /// Open gate: connection and receiver opens complete once this is true.
    gate: watch::Sender<bool>,

    next_dynamic: AtomicU64,
    senders_attached: AtomicUsize,
}

impl MemoryHub {
    // ---
    /// Create a hub whose opens complete immediately.
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// Create a hub that holds every open notification until [`open`](Self::open).
    ///
    /// Lets tests observe the window before the open handshake: client-side
    /// request buffering and server-side response buffering.
    pub fn gated() -> Arc<Self> {
        Self::build(false)
    }

    fn build(open: bool) -> Arc<Self> {
        // ---
        let (gate, _) = watch::channel(open);

        Arc::new(Self {
            routes: RwLock::new(HashMap::new()),
            offered: Mutex::new(Capabilities::None),
            gate,
            next_dynamic: AtomicU64::new(1),
            senders_attached: AtomicUsize::new(0),
        })
    }

    /// Set the capabilities advertised at connection open.
    ///
    /// Takes effect for opens that have not completed yet; call before
    /// connecting (or before [`open`](Self::open) on a gated hub).
    pub fn offer(&self, capabilities: Capabilities) {
        // ---
        *lock_ignore_poison(&self.offered) = capabilities;
    }

    /// Release every held open notification.
    ///
    /// Also takes effect for opens requested later: the gate stores the
    /// value even when nobody is currently waiting on it.
    pub fn open(&self) {
        // ---
        self.gate.send_replace(true);
    }

    /// Number of sending links attached through this hub so far.
    ///
    /// Counts attaches, not live links; used by tests to observe reply-link
    /// reuse.
    pub fn senders_attached(&self) -> usize {
        self.senders_attached.load(Ordering::SeqCst)
    }

    fn offered_capabilities(&self) -> Capabilities {
        lock_ignore_poison(&self.offered).clone()
    }

    async fn wait_open(&self) -> Result<()> {
        // ---
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| Error::Connection("memory hub dropped".into()))
    }

    async fn register(&self, address: Address, tx: mpsc::Sender<Message>) {
        // ---
        log_debug!("memory hub: route registered for {address}");
        self.routes.write().await.insert(address, tx);
    }

    async fn unregister(&self, address: &Address) {
        // ---
        self.routes.write().await.remove(address);
    }

    async fn deliver(&self, address: &Address, message: Message) {
        // ---
        let tx = self.routes.read().await.get(address).cloned();

        match tx {
            Some(tx) => {
                // A closed channel means the receiving link was dropped;
                // best-effort delivery, as on a real substrate.
                if let Err(_err) = tx.send(message).await {
                    log_info!("memory hub: delivery to {address} failed: {_err}");
                }
            }
            None => {
                log_debug!("memory hub: no route for {address}; dropping message");
            }
        }
    }

    fn next_dynamic_address(&self) -> Address {
        // ---
        let n = self.next_dynamic.fetch_add(1, Ordering::Relaxed);
        Address::from(format!("reply-{n}"))
    }
}

/// Create a container whose connections all route through `hub`.
pub fn memory_container(hub: Arc<MemoryHub>) -> ContainerPtr {
    // ---
    Arc::new(MemoryContainer { hub })
}

struct MemoryContainer {
    hub: Arc<MemoryHub>,
}

#[async_trait]
impl Container for MemoryContainer {
    // ---
    async fn connect(&self, _host: &str, _port: u16) -> Result<ConnectionPtr> {
        // ---
        log_debug!("memory container: connect ({_host}:{_port} ignored)");
        Ok(Arc::new(MemoryConnection {
            hub: self.hub.clone(),
        }))
    }
}

struct MemoryConnection {
    hub: Arc<MemoryHub>,
}

#[async_trait]
impl Connection for MemoryConnection {
    // ---
    async fn attach_sender(&self, address: Option<Address>) -> Result<SenderPtr> {
        // ---
        self.hub.senders_attached.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemorySender {
            hub: self.hub.clone(),
            fixed: address,
            closed: AtomicBool::new(false),
        }))
    }

    async fn attach_receiver(&self, spec: ReceiverSpec) -> Result<ReceiverHandle> {
        // ---
        let address = match spec {
            ReceiverSpec::Named(address) => address,
            ReceiverSpec::Dynamic => self.hub.next_dynamic_address(),
        };

        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (open_tx, open_rx) = oneshot::channel();

        // The route exists as soon as the attach returns; only the open
        // notification waits on the hub gate.
        self.hub.register(address.clone(), msg_tx).await;

        let hub = self.hub.clone();
        let open_address = address.clone();
        tokio::spawn(async move {
            // ---
            if hub.wait_open().await.is_err() {
                return;
            }
            let _ = open_tx.send(open_address);
        });

        Ok(ReceiverHandle {
            opened: open_rx,
            inbox: msg_rx,
            link: Arc::new(MemoryReceiver {
                hub: self.hub.clone(),
                address,
            }),
        })
    }

    async fn opened(&self) -> Result<Capabilities> {
        // ---
        self.hub.wait_open().await?;
        Ok(self.hub.offered_capabilities())
    }

    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("memory connection: closed");
        Ok(())
    }
}

struct MemorySender {
    hub: Arc<MemoryHub>,
    /// Fixed destination, or `None` for an anonymous sender routing by the
    /// message's `to` property.
    fixed: Option<Address>,
    closed: AtomicBool,
}

#[async_trait]
impl Sender for MemorySender {
    // ---
    async fn send(&self, message: Message) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            let name = self
                .fixed
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "<anonymous>".to_string());
            return Err(Error::LinkClosed(name));
        }

        let destination = match &self.fixed {
            Some(address) => address.clone(),
            None => message
                .properties
                .to
                .clone()
                .ok_or(Error::MalformedMessage("anonymous send without `to`"))?,
        };

        self.hub.deliver(&destination, message).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryReceiver {
    hub: Arc<MemoryHub>,
    address: Address,
}

#[async_trait]
impl ReceiverLink for MemoryReceiver {
    // ---
    async fn close(&self) -> Result<()> {
        // ---
        self.hub.unregister(&self.address).await;
        Ok(())
    }
}
