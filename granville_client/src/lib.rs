//! `granville_client`
//!
//! Client-side systems built on top of `granville_transport`'s `Connection`:
//! - Typed grain references (C6)
//! - Zone-aware routing strategies (C8)
//! - The multiplexer owning one connection per registered server (C7)
//! - A pooled cross-server client for server-to-server fan-out (C9)

pub mod cross_server;
pub mod multiplexer;
pub mod reference;
pub mod routing;

pub use cross_server::{CrossServerClient, FanOutResult};
pub use multiplexer::ClientMultiplexer;
pub use reference::{CallDispatch, GrainRef, SharedRoutingContext};
pub use routing::{PrimaryRoutingStrategy, RoutingStrategy, ZoneRoutingStrategy};
