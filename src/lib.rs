//! mixbridge - JSON-RPC over an anonymous mix network.
//!
//! Two halves talk to each other through a local mix-network client:
//!
//! - **Service provider** (relay side) - receives mix messages, keeps one
//!   downstream relay connection per anonymous sender tag, and replies
//!   through the sender's reply blocks.
//! - **Connection** (client side) - a duplex JSON-RPC connection façade
//!   whose traffic is framed into mix messages, with correlated
//!   request/response for HTTP relays.
//!
//! # Modules
//!
//! - [`protocol`] - framing carried inside mix messages
//! - [`mixnet`] - the local mix client boundary (WebSocket and in-memory)
//! - [`provider`] - session registry, dispatcher, relay connections
//! - [`client`] - pending-call correlator and connection façade
//! - [`config`] - configuration loading
//! - [`error`] - error types

pub mod client;
pub mod config;
pub mod error;
pub mod mixnet;
pub mod protocol;
pub mod provider;
pub mod ws;

// Re-export commonly used types
pub use client::{ConnectionEvent, ConnectionState, MixConnection};
pub use config::Config;
pub use error::{ClientError, CloseError, ForwardError, FrameError, OpenError};
pub use provider::ServiceProvider;
