//! Tunnel client: carries many local connections over one multiplexed session.
//!
//! The server registers remote listeners through the control channel and hands
//! back a route id for each; every stream it later opens starts with that id
//! (4 bytes, little-endian) and is bridged to the matching local target.

pub mod bridge;
pub mod client;
pub mod control;
pub mod demux;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod transport;
