//! Wire messages for sdexec pipeline↔manager and pipeline↔helper traffic.
//!
//! Messages are serialized with [`postcard`]. Stream transports (pipes) use a
//! 4-byte big-endian length prefix; datagram transports carry one bare
//! payload per datagram.

mod codec;
mod message;

pub use codec::{decode, decode_datagram, encode, encode_datagram};
pub use message::{HelperError, IdentityReport, MAX_DATAGRAM};
