mod codec;
mod messages;
pub mod token;

pub use codec::{CodecError, Frame, FrameCodec, MessageReceiver, HEADER_LEN, MAX_PAYLOAD_SIZE};
pub use messages::{
    ChannelClose, EndData, HelloRequest, HelloResponse, Message, MessageError, MessageType,
    ServerOpen, CONTROL_CHANNEL, PROTOCOL_VERSION,
};
pub use token::{PackedToken, TokenError};
