//! Wire protocol spoken between a farm and its worker units.
//!
//! Frames are length-delimited (4-byte big-endian length) MessagePack
//! encodings of [`ChildMessage`] (farm → worker) and [`ParentMessage`]
//! (worker → farm). Anything that does not decode into one of those is a
//! protocol violation.

pub mod bootstrap;
pub mod error;
pub mod frame;
pub mod message;
pub mod transport;

pub use bootstrap::{WorkerBootstrap, BOOTSTRAP_ENV};
pub use error::{ProtocolError, RemoteError};
pub use message::{encoded_len, ChildMessage, ParentMessage};
pub use transport::Endpoint;

/// Stable index of a worker inside one farm.
pub type WorkerId = u32;
