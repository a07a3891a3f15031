//! Request/reply RPC over an asynchronous, link-based messaging substrate.
//!
//! This library turns one-way, multiplexed, asynchronously-opened messaging
//! links into a call/response RPC abstraction. It handles correlation id
//! allocation, request/response matching, buffering of requests issued
//! before the dynamic reply address is known, and server-side reply routing
//! (shared relay link vs. a TTL-cached link per caller).
//!

// Import all sub modules once...
mod client;
mod domain;
mod server;
mod transport;

mod config;

mod cache;
mod error;
mod link_cache;
mod protocol;

mod macros;

// Re-export main types
pub use client::{Method, PendingReply, RpcClient};
pub use server::{HandlerResult, RpcServer};

pub use config::{RpcConfig, DEFAULT_PORT};

pub use cache::{BoxFuture, Cache, PurgeHook};
pub use error::{Error, Result};
pub use link_cache::{LinkCache, SenderFactory, RELAY_CAPABILITY, REPLY_LINK_TTL};
pub use protocol::{
    next_request_id, ErrorBody, Message, Properties, SUBJECT_BAD_METHOD, SUBJECT_ERROR, SUBJECT_OK,
};

pub use transport::{memory_container, MemoryHub};

// --- public re-exports
pub use domain::{
    //
    Address,
    Capabilities,
    Connection,
    ConnectionPtr,
    Container,
    ContainerPtr,
    ReceiverHandle,
    ReceiverLink,
    ReceiverPtr,
    ReceiverSpec,
    Sender,
    SenderPtr,
};

/// Connect an RPC client.
///
/// `url` has the form `scheme://[user[:password]@]host[:port]/path`; host and
/// port select the connection target, the path is the request address.
/// Scheme, user and password are currently unhandled.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] for an unusable URL, or any connection or
/// link-attach failure from the substrate.
pub async fn client(container: ContainerPtr, url: &str) -> Result<RpcClient> {
    // ---
    let config = RpcConfig::parse(url)?;
    RpcClient::connect(container, &config).await
}

/// Connect an RPC server listening at the URL's path address.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] for an unusable URL, or any connection or
/// link-attach failure from the substrate.
pub async fn server(container: ContainerPtr, url: &str) -> Result<RpcServer> {
    // ---
    let config = RpcConfig::parse(url)?;
    RpcServer::connect(container, &config).await
}
