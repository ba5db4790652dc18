//! Request classification into routing categories
//!
//! Classification is deterministic, evaluated top to bottom, first match
//! wins: long-context threshold, explicit deep-reasoning opt-in,
//! configured lightweight models, search-capable tools, then default.

use manifold_config::{Category, ClassifierConfig};

use crate::types::ChatRequest;

/// Bytes per token assumed by the estimate
///
/// A deliberate over-estimate; a real tokenizer would count fewer tokens
/// than this heuristic reports.
const BYTES_PER_TOKEN: usize = 4;

/// Deterministic category classifier
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    /// Build from configuration
    pub const fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify a request into its routing category
    pub fn classify(&self, request: &ChatRequest) -> Category {
        if estimate_tokens(request) >= self.config.long_context_threshold {
            return Category::Longcontext;
        }

        if self.is_thinking(request) {
            return Category::Thinking;
        }

        if self.config.background_models.iter().any(|m| m == &request.model) {
            return Category::Background;
        }

        if self.has_search_tool(request) {
            return Category::Search;
        }

        Category::Default
    }

    /// Explicit deep-reasoning opt-in: request metadata or a configured
    /// model-name marker
    fn is_thinking(&self, request: &ChatRequest) -> bool {
        if request.metadata.as_ref().is_some_and(|m| m.thinking == Some(true)) {
            return true;
        }
        self.config
            .thinking_markers
            .iter()
            .any(|marker| request.model.contains(marker.as_str()))
    }

    /// Whether any tool advertises search capability
    fn has_search_tool(&self, request: &ChatRequest) -> bool {
        let Some(tools) = &request.tools else {
            return false;
        };

        tools.iter().any(|tool| {
            let name = tool.name.to_ascii_lowercase();
            let description = tool
                .description
                .as_deref()
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();
            self.config
                .search_tool_markers
                .iter()
                .any(|marker| name.contains(marker.as_str()) || description.contains(marker.as_str()))
        })
    }
}

/// Token estimate from prompt byte length, roughly four bytes per token
pub fn estimate_tokens(request: &ChatRequest) -> usize {
    request.prompt_byte_len() / BYTES_PER_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, ChatRole, MessageContent, RequestMetadata, ToolDefinition};

    fn classifier() -> Classifier {
        Classifier::new(ClassifierConfig {
            long_context_threshold: 100,
            background_models: vec!["haiku-mini".to_owned()],
            thinking_markers: vec!["-thinking".to_owned()],
            search_tool_markers: vec!["search".to_owned(), "web_search".to_owned()],
        })
    }

    fn request(model: &str, text: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_owned(),
            max_tokens: 64,
            system: None,
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: MessageContent::Text(text.to_owned()),
            }],
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            metadata: None,
        }
    }

    #[test]
    fn plain_request_is_default() {
        assert_eq!(classifier().classify(&request("sonnet", "hello")), Category::Default);
    }

    #[test]
    fn threshold_boundary_is_exact() {
        // threshold 100 tokens = 400 bytes
        let below = request("sonnet", &"x".repeat(399));
        let at = request("sonnet", &"x".repeat(400));
        assert_eq!(classifier().classify(&below), Category::Default);
        assert_eq!(classifier().classify(&at), Category::Longcontext);
    }

    #[test]
    fn metadata_opts_into_thinking() {
        let mut req = request("sonnet", "hard problem");
        req.metadata = Some(RequestMetadata {
            thinking: Some(true),
            user_id: None,
        });
        assert_eq!(classifier().classify(&req), Category::Thinking);
    }

    #[test]
    fn model_marker_opts_into_thinking() {
        assert_eq!(
            classifier().classify(&request("sonnet-thinking", "x")),
            Category::Thinking
        );
    }

    #[test]
    fn lightweight_model_is_background() {
        assert_eq!(classifier().classify(&request("haiku-mini", "x")), Category::Background);
    }

    #[test]
    fn search_tool_routes_to_search() {
        let mut req = request("sonnet", "find it");
        req.tools = Some(vec![ToolDefinition {
            name: "web_search".to_owned(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        }]);
        assert_eq!(classifier().classify(&req), Category::Search);
    }

    #[test]
    fn long_context_wins_over_thinking() {
        let mut req = request("sonnet", &"x".repeat(400));
        req.metadata = Some(RequestMetadata {
            thinking: Some(true),
            user_id: None,
        });
        assert_eq!(classifier().classify(&req), Category::Longcontext);
    }

    #[test]
    fn thinking_wins_over_background() {
        let mut req = request("haiku-mini", "x");
        req.metadata = Some(RequestMetadata {
            thinking: Some(true),
            user_id: None,
        });
        assert_eq!(classifier().classify(&req), Category::Thinking);
    }
}
