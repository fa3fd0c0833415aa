//! Cellguard Core - Platform-independent messaging and process abstractions
//!
//! This crate provides the line-delimited JSON-RPC channel (transport, dispatcher,
//! correlating client), the wire types, and the process and containment traits
//! implemented by the platform crates.

mod client;
mod config;
mod dispatcher;
mod error;
mod process;
pub mod protocol;
mod stdio;
mod transport;

use std::future::Future;
use std::pin::Pin;

pub use client::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use process::*;
pub use stdio::*;
pub use transport::*;

/// Boxed, sendable future used by every callback seam in the crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
