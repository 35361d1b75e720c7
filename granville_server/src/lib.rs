//! `granville_server`
//!
//! Server-side systems:
//! - Embedder dispatch interface (`ActivationDispatcher`)
//! - Per-connection invocation engine with bounded concurrency
//! - Top-level server binding the datagram transport and running both

pub mod demo;
pub mod dispatcher;
pub mod engine;
pub mod server;

pub use server::RpcServer;
