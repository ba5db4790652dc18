use manifold_core::ProxyError;
use serde::{Deserialize, Serialize};

/// Chat request in the client schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier (may be a routing alias)
    pub model: String,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// System prompt, top-level rather than in the message list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Conversation messages
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Top-k sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Whether to stream the reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Tool definitions available to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Tool selection directive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Request metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequestMetadata>,
}

/// Request metadata recognized by the router
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Explicit deep-reasoning opt-in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    /// Opaque end-user identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// One conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role
    pub role: ChatRole,
    /// Turn content
    pub content: MessageContent,
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Human (also carries tool results)
    User,
    /// Model
    Assistant,
}

/// Message content, plain text or structured blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text shorthand
    Text(String),
    /// Block list
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of all text blocks
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Content block within a message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content
    Text {
        /// The text string
        text: String,
    },
    /// Image content
    Image {
        /// Image source
        source: ImageSource,
    },
    /// Tool invocation requested by the assistant
    ToolUse {
        /// Tool use identifier
        id: String,
        /// Tool name
        name: String,
        /// Tool input as JSON
        input: serde_json::Value,
    },
    /// Tool result supplied by the user
    ToolResult {
        /// Tool use id this result answers
        tool_use_id: String,
        /// Result content
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Whether the tool call errored
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Image source, base64 or URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    /// Source type ("base64" or "url")
    #[serde(rename = "type")]
    pub source_type: String,
    /// Media type, e.g. "image/png"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Base64 data or the URL itself
    pub data: String,
}

/// Tool the model may call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the input
    pub input_schema: serde_json::Value,
}

/// Tool selection directive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoice {
    /// "auto", "any", or "tool"
    #[serde(rename = "type")]
    pub choice_type: String,
    /// Forced tool name when type is "tool"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatRequest {
    /// Check the structural invariants of the client schema
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` when the message list is empty,
    /// `max_tokens` is zero, or a tool result references no prior
    /// tool use.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.messages.is_empty() {
            return Err(ProxyError::BadRequest("messages must not be empty".to_owned()));
        }
        if self.max_tokens == 0 {
            return Err(ProxyError::BadRequest("max_tokens must be positive".to_owned()));
        }

        let mut seen_tool_ids: Vec<&str> = Vec::new();
        for message in &self.messages {
            if let MessageContent::Blocks(blocks) = &message.content {
                for block in blocks {
                    match block {
                        ContentBlock::ToolUse { id, .. } => seen_tool_ids.push(id),
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            if !seen_tool_ids.contains(&tool_use_id.as_str()) {
                                return Err(ProxyError::BadRequest(format!(
                                    "tool_result references unknown tool_use id '{tool_use_id}'"
                                )));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// Byte length of everything the model will read
    ///
    /// Feeds the long-context classifier; tokens are estimated from this
    /// at roughly four bytes per token, a documented over-estimate.
    pub fn prompt_byte_len(&self) -> usize {
        let mut total = self.system.as_ref().map_or(0, String::len);

        for message in &self.messages {
            total += match &message.content {
                MessageContent::Text(text) => text.len(),
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => text.len(),
                        ContentBlock::Image { source } => source.data.len(),
                        ContentBlock::ToolUse { input, .. } => input.to_string().len(),
                        ContentBlock::ToolResult { content, .. } => content.as_ref().map_or(0, String::len),
                    })
                    .sum(),
            };
        }

        if let Some(tools) = &self.tools {
            for tool in tools {
                total += tool.name.len();
                total += tool.description.as_ref().map_or(0, String::len);
                total += tool.input_schema.to_string().len();
            }
        }

        total
    }
}
