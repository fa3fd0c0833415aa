//! Cellguard - run untrusted processes inside a supervised sandbox worker.
//!
//! The orchestrator side launches a `cellguard-host` worker with [`WorkerLauncher`],
//! places it into an OS containment group and drives it through a [`WorkerClient`].
//! The worker side ([`host`]) serves the requests over its stdin/stdout.

mod factory;
pub mod host;
mod launcher;
pub mod logging;
mod worker_client;

pub use factory::PlatformFactory;
pub use launcher::WorkerLauncher;
pub use worker_client::{ProcessDataCallback, WorkerClient, WorkerExit};

// Re-export core functionality
pub use cellguard_core::*;
