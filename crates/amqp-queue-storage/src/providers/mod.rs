//! Transport implementations.
//!
//! This module contains concrete implementations of the transport traits and
//! the [`crate::connection::Connector`] used to open them.

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryTransport};
