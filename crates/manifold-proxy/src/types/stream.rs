use serde::{Deserialize, Serialize};

use super::response::{StopKind, TokenUsage};

/// Neutral event on the streaming reply path
///
/// Protocol codecs parse family-specific frames into these; the handler
/// re-frames them in the client schema's SSE shape.
#[derive(Debug, Clone)]
pub enum ReplyEvent {
    /// Incremental content
    Delta(ReplyDelta),
    /// Usage statistics (arrives near stream end)
    Usage(TokenUsage),
    /// Stream finished
    Done,
}

/// Incremental update within a streaming reply
#[derive(Debug, Clone, Default)]
pub struct ReplyDelta {
    /// Choice index this delta belongs to
    pub index: u32,
    /// Text fragment
    pub content: Option<String>,
    /// Partial tool call
    pub tool_call: Option<ToolCallDelta>,
    /// Terminal stop reason (present on the final delta)
    pub stop_reason: Option<StopKind>,
}

/// Partial tool call within a stream delta
#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    /// Tool call index within the reply
    pub index: u32,
    /// Tool call id (first fragment only)
    pub id: Option<String>,
    /// Tool name (first fragment only)
    pub name: Option<String>,
    /// Incremental argument JSON fragment
    pub arguments: Option<String>,
}

// -- Client-schema SSE framing --

/// SSE event in the client schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientStreamEvent {
    /// Stream opened
    MessageStart {
        /// Partial message metadata
        message: MessageStartBody,
    },
    /// A content block began
    ContentBlockStart {
        /// Block index
        index: u32,
        /// Initial block content
        content_block: StreamBlock,
    },
    /// Incremental content within a block
    ContentBlockDelta {
        /// Block index
        index: u32,
        /// The fragment
        delta: StreamBlockDelta,
    },
    /// A content block finished
    ContentBlockStop {
        /// Block index
        index: u32,
    },
    /// Message metadata update (stop reason, usage)
    MessageDelta {
        /// Stop reason delta
        delta: MessageDeltaBody,
        /// Usage so far
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    /// Stream finished
    MessageStop,
    /// Keep-alive
    Ping,
}

impl ClientStreamEvent {
    /// SSE event name for this payload
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
            Self::Ping => "ping",
        }
    }
}

/// Metadata carried by `message_start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStartBody {
    /// Reply identifier
    pub id: String,
    /// Object type ("message")
    #[serde(rename = "type")]
    pub message_type: String,
    /// Role ("assistant")
    pub role: String,
    /// Model generating the reply
    pub model: String,
    /// Usage so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Initial content of a started block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamBlock {
    /// Text block
    Text {
        /// Initial text (usually empty)
        text: String,
    },
    /// Tool use block
    ToolUse {
        /// Tool use id
        id: String,
        /// Tool name
        name: String,
        /// Initial input (usually an empty object)
        input: serde_json::Value,
    },
}

/// Fragment within a `content_block_delta`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamBlockDelta {
    /// Text fragment
    TextDelta {
        /// The fragment
        text: String,
    },
    /// Tool input JSON fragment
    InputJsonDelta {
        /// The fragment
        partial_json: String,
    },
}

/// Stop metadata carried by `message_delta`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    /// Stop reason
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Stop sequence that fired
    #[serde(default)]
    pub stop_sequence: Option<String>,
}
