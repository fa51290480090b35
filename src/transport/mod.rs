//! Length-prefixed message transport over local stream sockets.

pub mod codec;
pub mod connection;
mod error;
pub mod listener;
pub mod message;

pub use codec::{EnvelopeCodec, FrameCodec, DEFAULT_MAX_FRAME_LEN};
pub use connection::{Connection, FrameReader, FrameSender};
pub use error::TransportError;
pub use listener::TransportListener;
pub use message::{Envelope, Message, PROTOCOL_VERSION};
