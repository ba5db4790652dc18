//! The client schema: Anthropic Messages v1 request and reply shapes,
//! plus the neutral reply events used on the streaming path

mod request;
mod response;
mod stream;

pub use request::{
    ChatMessage, ChatRequest, ChatRole, ContentBlock, ImageSource, MessageContent, RequestMetadata, ToolChoice,
    ToolDefinition,
};
pub use response::{ChatResponse, ResponseBlock, StopKind, TokenUsage};
pub use stream::{
    ClientStreamEvent, MessageDeltaBody, MessageStartBody, ReplyDelta, ReplyEvent, StreamBlock, StreamBlockDelta,
    ToolCallDelta,
};
