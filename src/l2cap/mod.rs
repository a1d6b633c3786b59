//! L2CAP command framing and the request/response channel built on it.

mod binary;
mod channel;
mod command;
mod server;

pub use self::channel::L2capChannel;
pub use self::command::{
    HEADER_LEN, L2capCodecError, L2capCommand, L2capCommandId, MAGIC, MAX_PAYLOAD_LEN,
};
pub use self::server::{EchoCommandHandler, L2capCommandHandler, L2capCommandServer};
