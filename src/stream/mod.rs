pub mod buffer;
pub mod decoder;
pub mod message;

pub use buffer::RingBuffer;
pub use decoder::{consume, Decoder};
pub use message::{Flag, Message, Meta};
