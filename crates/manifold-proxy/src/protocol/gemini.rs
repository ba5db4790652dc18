//! Google Gemini generateContent wire format

use serde::{Deserialize, Serialize};

// -- Request --

/// generateContent request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    /// Conversation contents
    pub contents: Vec<GeminiContent>,
    /// System instruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    /// Generation parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
    /// Tool declarations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiTool>>,
    /// Tool calling configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<GeminiToolConfig>,
}

/// Role and parts of one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    /// "user" or "model"; absent on system instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts
    pub parts: Vec<GeminiPart>,
}

/// One part within a content object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GeminiPart {
    /// Text part
    Text(String),
    /// Inline binary data (images)
    InlineData(GeminiInlineData),
    /// Function call from the model
    FunctionCall(GeminiFunctionCall),
    /// Function response from the user
    FunctionResponse(GeminiFunctionResponse),
}

/// Inline binary data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiInlineData {
    /// MIME type
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
}

/// Function call emitted by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    /// Function name
    pub name: String,
    /// Arguments as JSON
    pub args: serde_json::Value,
}

/// Function result supplied back to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    /// Function name (carries the tool-use id for correlation)
    pub name: String,
    /// Result as JSON
    pub response: serde_json::Value,
}

/// Generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Top-k sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Maximum output tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Tool declaration wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    /// Declared functions
    pub function_declarations: Vec<GeminiFunctionDeclaration>,
}

/// One declared function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionDeclaration {
    /// Function name
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Tool calling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolConfig {
    /// Function calling mode
    pub function_calling_config: GeminiFunctionCallingConfig,
}

/// Function calling mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiFunctionCallingConfig {
    /// "AUTO", "ANY", or "NONE"
    pub mode: String,
    /// Allowed functions when mode is "ANY"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
}

// -- Response --

/// generateContent reply; stream chunks reuse the same shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    /// Generated candidates
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    /// Token usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<GeminiUsageMetadata>,
}

/// One generated candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    /// Generated content
    pub content: GeminiContent,
    /// Why generation stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Candidate index
    #[serde(default)]
    pub index: Option<u32>,
}

/// Token usage
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsageMetadata {
    /// Prompt tokens
    #[serde(default)]
    pub prompt_token_count: u32,
    /// Candidate tokens
    #[serde(default)]
    pub candidates_token_count: u32,
    /// Total tokens
    #[serde(default)]
    pub total_token_count: u32,
}

// -- Error envelope --

/// Error reply body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiErrorResponse {
    /// Error details
    pub error: GeminiErrorDetail,
}

/// Error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiErrorDetail {
    /// HTTP status code
    #[serde(default)]
    pub code: u32,
    /// Error message
    pub message: String,
    /// Status string
    #[serde(default)]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_variants_use_camel_case_keys() {
        let text = GeminiPart::Text("hi".to_owned());
        assert_eq!(serde_json::to_string(&text).unwrap(), r#"{"text":"hi"}"#);

        let call = GeminiPart::FunctionCall(GeminiFunctionCall {
            name: "lookup".to_owned(),
            args: serde_json::json!({"q": 1}),
        });
        let raw = serde_json::to_string(&call).unwrap();
        assert!(raw.starts_with(r#"{"functionCall":"#), "{raw}");
    }

    #[test]
    fn response_parses_finish_reason() {
        let raw = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hello"}]},
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7}
        }"#;
        let response: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.candidates[0].finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage_metadata.unwrap().total_token_count, 7);
    }
}
