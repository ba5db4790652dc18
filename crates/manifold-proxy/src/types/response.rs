use serde::{Deserialize, Serialize};

/// Chat reply in the client schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Reply identifier
    pub id: String,
    /// Object type (always "message")
    #[serde(rename = "type")]
    pub response_type: String,
    /// Role (always "assistant")
    pub role: String,
    /// Reply content blocks
    pub content: Vec<ResponseBlock>,
    /// Model that generated the reply
    pub model: String,
    /// Why generation stopped
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Stop sequence that fired, if any
    #[serde(default)]
    pub stop_sequence: Option<String>,
    /// Token usage
    pub usage: TokenUsage,
}

/// Content block within a reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBlock {
    /// Text content
    Text {
        /// The text string
        text: String,
    },
    /// Tool invocation request
    ToolUse {
        /// Tool use identifier
        id: String,
        /// Tool name
        name: String,
        /// Tool input as JSON
        input: serde_json::Value,
    },
}

/// Token usage in a reply
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt
    pub input_tokens: u32,
    /// Tokens generated
    pub output_tokens: u32,
}

/// Canonical reason generation stopped
///
/// Family-specific termination strings map into this and back out at the
/// client boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    /// Natural end of generation
    EndTurn,
    /// Token limit reached
    MaxTokens,
    /// Model is calling a tool
    ToolUse,
    /// Safety filter cut generation
    ContentFilter,
}

impl StopKind {
    /// Client-schema stop_reason string
    pub const fn as_client_str(self) -> &'static str {
        match self {
            // The client schema has no content-filter reason
            Self::EndTurn | Self::ContentFilter => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::ToolUse => "tool_use",
        }
    }

    /// Parse an OpenAI-family finish_reason
    pub fn from_openai(s: &str) -> Option<Self> {
        match s {
            "stop" | "end_turn" => Some(Self::EndTurn),
            "length" | "max_tokens" => Some(Self::MaxTokens),
            "tool_calls" | "tool_use" | "function_call" => Some(Self::ToolUse),
            "content_filter" => Some(Self::ContentFilter),
            _ => None,
        }
    }

    /// Parse a Gemini-family finishReason
    pub fn from_gemini(s: &str) -> Option<Self> {
        match s {
            "STOP" => Some(Self::EndTurn),
            "MAX_TOKENS" => Some(Self::MaxTokens),
            "FUNCTION_CALL" => Some(Self::ToolUse),
            "SAFETY" | "RECITATION" => Some(Self::ContentFilter),
            _ => None,
        }
    }

    /// Parse an Anthropic-family stop_reason
    pub fn from_anthropic(s: &str) -> Option<Self> {
        match s {
            "end_turn" | "stop_sequence" => Some(Self::EndTurn),
            "max_tokens" => Some(Self::MaxTokens),
            "tool_use" => Some(Self::ToolUse),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_terminators_parse() {
        assert_eq!(StopKind::from_openai("stop"), Some(StopKind::EndTurn));
        assert_eq!(StopKind::from_openai("tool_calls"), Some(StopKind::ToolUse));
        assert_eq!(StopKind::from_openai("banana"), None);
    }

    #[test]
    fn gemini_terminators_parse() {
        assert_eq!(StopKind::from_gemini("STOP"), Some(StopKind::EndTurn));
        assert_eq!(StopKind::from_gemini("FUNCTION_CALL"), Some(StopKind::ToolUse));
    }

    #[test]
    fn client_strings_are_stable() {
        assert_eq!(StopKind::ToolUse.as_client_str(), "tool_use");
        assert_eq!(StopKind::ContentFilter.as_client_str(), "end_turn");
    }
}
