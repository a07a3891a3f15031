//! Domain layer public interface.
//!
//! This module defines the abstractions through which the RPC layer talks to
//! the underlying messaging substrate (connections and unidirectional links).
//! It is independent of any concrete wire protocol or client library.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod link;

// --- Link domain re-exports ---

pub use link::{
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
