// src/domain/link.rs

//! Link domain abstractions.
//!
//! The RPC layer is built on a connection that carries named, unidirectional
//! links: sending links push messages toward an address, receiving links
//! deliver messages arriving at an address. Links have their own open/close
//! lifecycle; in particular, a receiving link attached with a *dynamic*
//! address only learns its address from the remote peer once the attach
//! handshake completes.
//!
//! Everything here is interface: the traits are implemented by concrete
//! substrates (network I/O, TLS, framing live there, not in this crate).
//! The in-memory substrate under `src/transport/` provides the reference
//! semantics used by the test suite.

use crate::{Message, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A link address.
///
/// Interpretation is substrate-specific (queue name, node, topic); the RPC
/// layer treats it as an opaque identifier. Immutable, cheap to clone, safe
/// to share across threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a receiving link should be addressed at attach time.
#[derive(Clone, Debug)]
pub enum ReceiverSpec {
    /// Attach at a caller-chosen address.
    Named(Address),

    /// Let the remote peer assign an address; it is reported through
    /// [`ReceiverHandle::opened`] once the attach completes. Used for
    /// generated reply-to addresses.
    Dynamic,
}

/// Capabilities advertised by the remote peer at connection open.
///
/// Substrates may deliver these as a single scalar or as a list; both shapes
/// are preserved so the membership probe matches either.
#[derive(Clone, Debug, Default)]
pub enum Capabilities {
    /// Peer advertised nothing.
    #[default]
    None,

    /// Peer advertised a single capability.
    One(Arc<str>),

    /// Peer advertised a list of capabilities.
    Many(Vec<Arc<str>>),
}

impl Capabilities {
    /// Exact-match membership test against a capability token.
    pub fn contains(&self, name: &str) -> bool {
        // ---
        match self {
            Capabilities::None => false,
            Capabilities::One(cap) => &**cap == name,
            Capabilities::Many(caps) => caps.iter().any(|cap| &**cap == name),
        }
    }
}

/// An attached sending link.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Push a message down the link.
    ///
    /// For links attached without an address (anonymous senders), the
    /// substrate routes by the message's `to` property instead.
    async fn send(&self, message: Message) -> Result<()>;

    /// Close the link. Further sends fail with [`Error::LinkClosed`](crate::Error::LinkClosed).
    async fn close(&self) -> Result<()>;
}

/// Shared sending-link pointer.
pub type SenderPtr = Arc<dyn Sender>;

/// Control surface of an attached receiving link.
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    /// Close the link; the associated inbox channel ends.
    async fn close(&self) -> Result<()>;
}

/// Shared receiving-link pointer.
pub type ReceiverPtr = Arc<dyn ReceiverLink>;

/// Handle returned from a successful receiver attach.
///
/// The attach itself is asynchronous: `opened` resolves with the link's
/// address (remote-assigned for [`ReceiverSpec::Dynamic`]) once the handshake
/// completes. Messages arrive on `inbox` only after that point.
pub struct ReceiverHandle {
    /// Resolves to the link's source address at open.
    pub opened: oneshot::Receiver<Address>,

    /// Inbound messages delivered to this link.
    pub inbox: mpsc::Receiver<Message>,

    /// Control surface (close) for the link.
    pub link: ReceiverPtr,
}

/// An open connection to a remote container.
///
/// The connection multiplexes any number of links and reports the peer's
/// offered capabilities once the open handshake completes.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Attach a sending link. `None` attaches an anonymous sender that
    /// routes each message by its `to` property.
    async fn attach_sender(&self, address: Option<Address>) -> Result<SenderPtr>;

    /// Attach a receiving link per the given spec.
    async fn attach_receiver(&self, spec: ReceiverSpec) -> Result<ReceiverHandle>;

    /// Resolves when the connection open handshake completes, yielding the
    /// capabilities the peer advertised.
    async fn opened(&self) -> Result<Capabilities>;

    /// Close the connection and every link attached to it.
    async fn close(&self) -> Result<()>;
}

/// Shared connection pointer.
pub type ConnectionPtr = Arc<dyn Connection>;

/// Factory for connections: the process-level container object.
#[async_trait]
pub trait Container: Send + Sync {
    /// Establish a connection to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> Result<ConnectionPtr>;
}

/// Shared container pointer.
pub type ContainerPtr = Arc<dyn Container>;
