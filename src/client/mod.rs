//! Client side of the bridge.
//!
//! - [`MixConnection`] - duplex JSON-RPC connection façade over the mix network
//! - [`Correlator`] - matches correlated replies to waiting calls

pub mod connection;
pub mod correlator;

pub use connection::{ConnectionEvent, ConnectionState, MixConnection};
pub use correlator::{Correlator, Waiter};
