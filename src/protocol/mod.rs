//! Wire formats shared by client, server and relay peer:
//! - [`address`] - connection-string encoding of tunnel targets
//! - [`CtrlMessage`] - JSON messages on the bridge ctrl channel

pub mod address;
mod messages;

pub use address::{decode, encode, Endpoint};
pub use messages::*;
