//! Core types for the realtime stream client
//!
//! Wire frames, connection state and the error taxonomy shared by the
//! client and its consumers. Nothing in this crate performs I/O.

pub mod error;
pub mod frame;
pub mod state;

pub use error::{CodecError, StreamError, StreamResult};
pub use frame::{ControlFrame, DispatchKey, Frame};
pub use state::ConnectionState;
