pub mod coap;
pub mod error;
pub mod framer;
pub mod messages;

pub use coap::{CoapMessage, CoapOption, CoapType};
pub use error::WireError;
pub use framer::{ChunkCodec, Conn, Transport, MAX_FRAME_LEN};
pub use messages::MessageName;
