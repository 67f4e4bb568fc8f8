//! # kvlink - Key-Value Client and Pooling Relay
//!
//! kvlink is a minimal client and local proxy for key-value servers speaking
//! a RESP-style line protocol: typed, length-prefixed responses over a byte
//! stream, with commands sent as plain inline text lines.
//!
//! ## Architecture Overview
//!
//! The system consists of a few tightly coupled components:
//! - **Response Decoder**: recursive-descent decoding of one complete typed
//!   response from the stream, bounded by a read timeout
//! - **Session**: one logical connection plus its settings, advisory lock,
//!   and keepalive timer
//! - **Command Executor**: the locked critical section that sends a command
//!   and decodes its answer, with a single transparent reconnect-and-retry
//! - **Keepalive Monitor**: a re-armed timer probing the connection through
//!   the same lock as the foreground caller
//! - **Pool Multiplexer**: a fixed set of supervised upstream sessions
//!   behind one public endpoint, relaying raw bytes with backpressure
//!
//! Two binaries sit on top: `kvlink`, the interactive console, and
//! `kvlink-pool`, the pooling relay.
//!
//! ## What this is not
//!
//! There is no request-array encoder (commands go inline), no pipelining
//! layer, and no typed publish/subscribe stream; push mode is an open-ended
//! read loop with an explicit interrupt.

pub mod config; // Configuration management
pub mod console; // Rendering contract and interactive loop
pub mod error; // Error taxonomy and exit codes
mod executor; // Locked command execution on a session
mod keepalive; // Connection liveness probing
pub mod pool; // Fixed-size connection-pool multiplexer
pub mod resp; // Response decoding
pub mod session; // Session lifecycle

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use pool::{Endpoint, Pool};
pub use resp::Response;
pub use session::{Session, SessionConfig};
