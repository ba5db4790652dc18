//! AWS CodeWhisperer conversation wire format
//!
//! The conversation API wraps Anthropic-shaped chat in a
//! `conversationState` envelope and answers with a stream of event
//! objects. Non-streamed calls aggregate the events into a `CwReply`.

use serde::{Deserialize, Serialize};

// -- Request --

/// generateAssistantResponse request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwRequest {
    /// Conversation envelope
    pub conversation_state: CwConversationState,
}

/// The conversation envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwConversationState {
    /// Always "MANUAL" for proxied traffic
    pub chat_trigger_type: String,
    /// Conversation identifier
    pub conversation_id: String,
    /// The turn being answered
    pub current_message: CwTurn,
    /// Prior turns, oldest first
    #[serde(default)]
    pub history: Vec<CwTurn>,
}

/// One turn of the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CwTurn {
    /// A user turn
    UserInputMessage(CwUserInput),
    /// An assistant turn
    AssistantResponseMessage(CwAssistantResponse),
}

/// User turn payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwUserInput {
    /// Concatenated text content
    pub content: String,
    /// Target model
    pub model_id: String,
    /// Tool declarations and results for this turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<CwUserInputContext>,
}

/// Tools and tool results attached to a user turn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwUserInputContext {
    /// Declared tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<CwToolSpec>,
    /// Results answering earlier tool uses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<CwToolResult>,
}

/// One declared tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwToolSpec {
    /// Tool specification envelope
    pub tool_specification: CwToolSpecification,
}

/// Tool specification body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwToolSpecification {
    /// Tool name
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input schema wrapper
    pub input_schema: CwInputSchema,
}

/// Input schema wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CwInputSchema {
    /// JSON Schema for the tool input
    pub json: serde_json::Value,
}

/// A tool result answering an earlier tool use
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwToolResult {
    /// Tool use this result answers
    pub tool_use_id: String,
    /// Result content blocks
    pub content: Vec<serde_json::Value>,
    /// "success" or "error"
    pub status: String,
}

/// Assistant turn payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwAssistantResponse {
    /// Text content
    pub content: String,
    /// Tool uses emitted by the assistant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<CwToolUse>,
}

/// One tool use within an assistant turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwToolUse {
    /// Tool use identifier
    pub tool_use_id: String,
    /// Tool name
    pub name: String,
    /// Tool input as JSON
    pub input: serde_json::Value,
}

// -- Response events --

/// One event object in the reply stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CwEvent {
    /// Incremental assistant text
    AssistantResponseEvent(CwAssistantText),
    /// A tool use, possibly fragmented
    ToolUseEvent(CwToolUseEvent),
    /// Reply metadata (conversation id, stop reason)
    MessageMetadataEvent(CwMessageMetadata),
}

/// Incremental assistant text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CwAssistantText {
    /// Text fragment
    pub content: String,
}

/// Tool use fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwToolUseEvent {
    /// Tool use identifier
    pub tool_use_id: String,
    /// Tool name
    pub name: String,
    /// Input JSON fragment
    #[serde(default)]
    pub input: Option<String>,
    /// Set on the final fragment of this tool use
    #[serde(default)]
    pub stop: Option<bool>,
}

/// Reply metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwMessageMetadata {
    /// Conversation identifier
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Why generation stopped (Anthropic-family values)
    #[serde(default)]
    pub stop_reason: Option<String>,
}

// -- Aggregated reply --

/// A complete CodeWhisperer reply, aggregated from the event stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CwReply {
    /// Assistant text
    pub content: String,
    /// Tool uses
    #[serde(default)]
    pub tool_uses: Vec<CwToolUse>,
    /// Why generation stopped
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_use_camel_case_envelopes() {
        let event = CwEvent::AssistantResponseEvent(CwAssistantText {
            content: "hi".to_owned(),
        });
        let raw = serde_json::to_string(&event).unwrap();
        assert!(raw.starts_with(r#"{"assistantResponseEvent":"#), "{raw}");
    }

    #[test]
    fn tool_use_event_parses() {
        let raw = r#"{"toolUseEvent":{"toolUseId":"t1","name":"search","input":"{\"q\":","stop":false}}"#;
        let event: CwEvent = serde_json::from_str(raw).unwrap();
        let CwEvent::ToolUseEvent(tool_use) = event else {
            panic!("wrong variant");
        };
        assert_eq!(tool_use.name, "search");
        assert_eq!(tool_use.stop, Some(false));
    }
}
