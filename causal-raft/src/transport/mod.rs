//! TCP transport: framed codec, outbound per-peer channels and the
//! inbound dispatcher.

pub mod codec;
pub mod inbound;
pub mod outbound;
