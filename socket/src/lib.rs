//! TCP peer framework: managed sessions, handler-chain pipelines, and
//! automatic reconnection.
//!
//! This crate wraps accepted or dialed TCP connections into sessions whose
//! inbound and outbound data flows through ordered, pluggable handler
//! chains before application code sees it. No wire format is imposed:
//! framing and codecs are ordinary handler stages installed by the
//! application.
//!
//! ## Features
//!
//! - **Handler chains**: ordered pipelines over [`Event`]s, with a result
//!   code controlling flow and a `NextChain` sentinel for early exit
//! - **Broadcast receive chains**: inbound events are cloned per registered
//!   chain, so chains never observe each other's mutations
//! - **Sessions**: one receive loop and one send loop per connection, with
//!   a race-free shutdown protocol and an exactly-once close callback
//! - **Acceptor**: non-blocking per-connection setup off the accept loop
//! - **Connector**: connect/retry state machine with configurable
//!   auto-reconnect and bounded failure reporting
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use peerline_socket::{
//!     Acceptor, Event, EventHandler, HandlerChain, RecvBroadcast,
//! };
//!
//! /// Decodes one inbound unit; real implementations read the socket
//! /// through `ev.session()` — see `examples/echo.rs`.
//! struct Decode;
//!
//! #[async_trait]
//! impl EventHandler for Decode {
//!     fn label(&self) -> &str {
//!         "Decode"
//!     }
//!
//!     async fn call(&self, ev: &mut Event) {
//!         # let _ = ev;
//!         // ...
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let acceptor = Acceptor::new();
//! acceptor.peer().chains().set_read_write_chain(
//!     Some(Arc::new(|| {
//!         HandlerChain::with_stages("read", vec![Arc::new(Decode), Arc::new(RecvBroadcast)])
//!     })),
//!     None,
//! );
//! acceptor.start("127.0.0.1:9000").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod chain_manager;
pub mod connector;
pub mod error;
pub mod event;
pub mod handler;
pub mod peer;
mod queue;
pub mod session;

#[cfg(test)]
pub(crate) mod testkit;

// Re-export main types
pub use acceptor::Acceptor;
pub use chain_manager::{ChainFactory, HandlerChainManager};
pub use connector::Connector;
pub use error::{error_to_result, PeerError};
pub use event::{Event, EventKind, EventResult, MsgValue, TagValue};
pub use handler::{EventHandler, HandlerChain, HandlerChainList, RecvBroadcast};
pub use peer::{Peer, Profile, SessionRegistry, SocketOptions};
pub use session::Session;
