//! NSQ v2 wire protocol: commands, frames, and the streaming decoder.

pub mod command;
pub mod frame;

pub use command::{Command, IdentifyBody, NegotiatedFeatures};
pub use frame::{Frame, FrameDecoder, RawMessage, MAGIC_V2};
