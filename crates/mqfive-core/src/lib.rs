//! mqfive-core - MQTT v5.0 wire codec.
//!
//! Wire primitives, the property system, the fifteen control packets and
//! topic validation. No I/O happens here; the client crate feeds bytes in and
//! takes encoded packets out.

pub mod error;
pub mod packet;
pub mod property;
pub mod topic;
pub mod varint;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use packet::*;
pub use property::{Properties, Property, PropertyId};
