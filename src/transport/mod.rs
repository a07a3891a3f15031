//! Substrate implementations.
//!
//! This module provides concrete implementations of the domain-level link
//! traits. Only the in-memory substrate lives in this crate; it defines the
//! reference semantics against which RPC behavior is validated. Network
//! substrates (real connections, TLS, framing) are external collaborators
//! implementing the same traits.

mod memory;

pub use memory::{memory_container, MemoryHub};
