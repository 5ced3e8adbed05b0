pub mod client; // Upstream connection state machine + reconnect policy
pub mod protocol; // Wire-format structs and frame decoding

pub use client::{
    reconnect_delay_ms, ConnectionState, StreamClientConfig, StreamConnectionClient, StreamEvent,
};
pub use protocol::{DecodeError, DecodedFrame, SubscribeMessage};
