//! Client schema <-> OpenAI-family conversion

use manifold_core::ProxyError;

use super::{Transformer, wrong_family};
use crate::family::{FamilyRequest, FamilyResponse, ProviderFamily};
use crate::protocol::openai::{
    OpenAiContent, OpenAiContentPart, OpenAiFunction, OpenAiFunctionCall, OpenAiImageUrl, OpenAiMessage,
    OpenAiRequest, OpenAiResponse, OpenAiTool, OpenAiToolCall,
};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, ContentBlock, MessageContent, ResponseBlock, StopKind,
    TokenUsage, ToolChoice,
};

/// Transformer for the OpenAI family (canonical and compat servers)
pub struct OpenAiTransformer {
    family: ProviderFamily,
}

impl OpenAiTransformer {
    /// Create a transformer tagged with the concrete family
    pub const fn new(family: ProviderFamily) -> Self {
        Self { family }
    }
}

impl Transformer for OpenAiTransformer {
    fn family(&self) -> ProviderFamily {
        self.family
    }

    fn to_family(&self, request: &ChatRequest) -> Result<FamilyRequest, ProxyError> {
        let mut messages = Vec::new();

        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system".to_owned(),
                content: Some(OpenAiContent::Text(system.clone())),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for message in &request.messages {
            client_message_to_openai(message, &mut messages);
        }

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| OpenAiTool {
                    tool_type: "function".to_owned(),
                    function: OpenAiFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.input_schema.clone()),
                    },
                })
                .collect()
        });

        Ok(FamilyRequest::OpenAi(OpenAiRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: Some(request.max_tokens),
            stop: request.stop_sequences.clone(),
            stream: None,
            tools,
            tool_choice: request.tool_choice.as_ref().map(tool_choice_to_openai),
        }))
    }

    fn to_client(&self, response: FamilyResponse, model: &str) -> Result<ChatResponse, ProxyError> {
        let FamilyResponse::OpenAi(response) = response else {
            return Err(wrong_family("transformer"));
        };

        let choice = response.choices.into_iter().next().ok_or(ProxyError::EmptyResponse)?;

        let mut content = Vec::new();
        if let Some(text) = choice.message.content
            && !text.is_empty()
        {
            content.push(ResponseBlock::Text { text });
        }

        if let Some(tool_calls) = choice.message.tool_calls {
            for call in tool_calls {
                let input = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| serde_json::json!({}));
                content.push(ResponseBlock::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input,
                });
            }
        }

        let stop_reason = choice
            .finish_reason
            .flatten()
            .as_deref()
            .and_then(StopKind::from_openai)
            .map(|kind| kind.as_client_str().to_owned());

        let usage = response.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });

        Ok(ChatResponse {
            id: if response.id.is_empty() {
                format!("msg_{}", uuid::Uuid::new_v4().simple())
            } else {
                response.id
            },
            response_type: "message".to_owned(),
            role: "assistant".to_owned(),
            content,
            model: model.to_owned(),
            stop_reason,
            stop_sequence: None,
            usage,
        })
    }
}

/// Append the OpenAI renditions of one client message
///
/// A client message may fan out into several wire messages: tool results
/// become `tool`-role messages of their own.
fn client_message_to_openai(message: &ChatMessage, out: &mut Vec<OpenAiMessage>) {
    let role = match message.role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    };

    match &message.content {
        MessageContent::Text(text) => out.push(OpenAiMessage {
            role: role.to_owned(),
            content: Some(OpenAiContent::Text(text.clone())),
            tool_calls: None,
            tool_call_id: None,
        }),
        MessageContent::Blocks(blocks) => {
            let mut parts = Vec::new();
            let mut tool_calls = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(OpenAiContentPart::Text { text: text.clone() }),
                    ContentBlock::Image { source } => {
                        let url = if source.source_type == "base64" {
                            let mime = source.media_type.as_deref().unwrap_or("image/png");
                            format!("data:{mime};base64,{}", source.data)
                        } else {
                            source.data.clone()
                        };
                        parts.push(OpenAiContentPart::ImageUrl {
                            image_url: OpenAiImageUrl { url },
                        });
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(OpenAiToolCall {
                            id: id.clone(),
                            tool_type: "function".to_owned(),
                            function: OpenAiFunctionCall {
                                name: name.clone(),
                                arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_owned()),
                            },
                        });
                    }
                    ContentBlock::ToolResult {
                        tool_use_id, content, ..
                    } => {
                        // Tool results are standalone tool-role messages
                        out.push(OpenAiMessage {
                            role: "tool".to_owned(),
                            content: Some(OpenAiContent::Text(content.clone().unwrap_or_default())),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        });
                    }
                }
            }

            if !parts.is_empty() || !tool_calls.is_empty() {
                let content = match parts.len() {
                    0 => None,
                    1 => match parts.into_iter().next() {
                        Some(OpenAiContentPart::Text { text }) => Some(OpenAiContent::Text(text)),
                        Some(other) => Some(OpenAiContent::Parts(vec![other])),
                        None => None,
                    },
                    _ => Some(OpenAiContent::Parts(parts)),
                };

                out.push(OpenAiMessage {
                    role: role.to_owned(),
                    content,
                    tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                    tool_call_id: None,
                });
            }
        }
    }
}

/// Map the client tool-choice directive onto the OpenAI shape
fn tool_choice_to_openai(choice: &ToolChoice) -> serde_json::Value {
    match choice.choice_type.as_str() {
        "any" => serde_json::json!("required"),
        "tool" => choice.name.as_ref().map_or_else(
            || serde_json::json!("auto"),
            |name| serde_json::json!({"type": "function", "function": {"name": name}}),
        ),
        _ => serde_json::json!("auto"),
    }
}
