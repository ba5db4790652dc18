//! Client schema <-> Gemini conversion

use manifold_core::ProxyError;

use super::{Transformer, wrong_family};
use crate::family::{FamilyRequest, FamilyResponse, ProviderFamily};
use crate::protocol::gemini::{
    GeminiContent, GeminiFunctionCall, GeminiFunctionCallingConfig, GeminiFunctionDeclaration,
    GeminiFunctionResponse, GeminiGenerationConfig, GeminiInlineData, GeminiPart, GeminiRequest, GeminiResponse,
    GeminiTool, GeminiToolConfig,
};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, ContentBlock, MessageContent, ResponseBlock, StopKind,
    TokenUsage,
};

/// Transformer for the Gemini family
pub struct GeminiTransformer;

impl Transformer for GeminiTransformer {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    fn to_family(&self, request: &ChatRequest) -> Result<FamilyRequest, ProxyError> {
        let system_instruction = request.system.as_ref().map(|system| GeminiContent {
            role: None,
            parts: vec![GeminiPart::Text(system.clone())],
        });

        let contents = request
            .messages
            .iter()
            .map(client_message_to_gemini)
            .collect::<Result<Vec<_>, _>>()?;

        let tools = request.tools.as_ref().map(|tools| {
            vec![GeminiTool {
                function_declarations: tools
                    .iter()
                    .map(|t| GeminiFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.input_schema.clone()),
                    })
                    .collect(),
            }]
        });

        let tool_config = request.tool_choice.as_ref().map(|choice| {
            let (mode, allowed) = match choice.choice_type.as_str() {
                "any" => ("ANY".to_owned(), None),
                "tool" => (
                    "ANY".to_owned(),
                    choice.name.as_ref().map(|name| vec![name.clone()]),
                ),
                _ => ("AUTO".to_owned(), None),
            };
            GeminiToolConfig {
                function_calling_config: GeminiFunctionCallingConfig {
                    mode,
                    allowed_function_names: allowed,
                },
            }
        });

        Ok(FamilyRequest::Gemini(GeminiRequest {
            contents,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                top_k: request.top_k,
                max_output_tokens: Some(request.max_tokens),
                stop_sequences: request.stop_sequences.clone(),
            }),
            tools,
            tool_config,
        }))
    }

    fn to_client(&self, response: FamilyResponse, model: &str) -> Result<ChatResponse, ProxyError> {
        let FamilyResponse::Gemini(response) = response else {
            return Err(wrong_family("transformer"));
        };

        let candidate = response.candidates.into_iter().next().ok_or(ProxyError::EmptyResponse)?;

        let mut content = Vec::new();
        let mut text = String::new();
        for part in candidate.content.parts {
            match part {
                GeminiPart::Text(fragment) => text.push_str(&fragment),
                GeminiPart::FunctionCall(call) => {
                    content.push(ResponseBlock::ToolUse {
                        // Gemini carries no call ids; mint one for linkage
                        id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                        name: call.name,
                        input: call.args,
                    });
                }
                GeminiPart::InlineData(_) | GeminiPart::FunctionResponse(_) => {}
            }
        }
        if !text.is_empty() {
            content.insert(0, ResponseBlock::Text { text });
        }

        let stop_reason = candidate
            .finish_reason
            .as_deref()
            .and_then(StopKind::from_gemini)
            .map(|kind| kind.as_client_str().to_owned());

        let usage = response.usage_metadata.map_or_else(TokenUsage::default, |u| TokenUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        });

        Ok(ChatResponse {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
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

/// Convert one client message into a Gemini content object
fn client_message_to_gemini(message: &ChatMessage) -> Result<GeminiContent, ProxyError> {
    let role = match message.role {
        ChatRole::User => "user",
        ChatRole::Assistant => "model",
    };

    let mut parts = Vec::new();

    match &message.content {
        MessageContent::Text(text) => parts.push(GeminiPart::Text(text.clone())),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(GeminiPart::Text(text.clone())),
                    ContentBlock::Image { source } => {
                        if source.source_type == "base64" {
                            parts.push(GeminiPart::InlineData(GeminiInlineData {
                                mime_type: source.media_type.clone().unwrap_or_else(|| "image/png".to_owned()),
                                data: source.data.clone(),
                            }));
                        } else {
                            return Err(ProxyError::Transform {
                                stage: "transformer",
                                message: "gemini requires base64 images; URL sources are not supported".to_owned(),
                            });
                        }
                    }
                    ContentBlock::ToolUse { name, input, .. } => {
                        parts.push(GeminiPart::FunctionCall(GeminiFunctionCall {
                            name: name.clone(),
                            args: input.clone(),
                        }));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id, content, ..
                    } => {
                        let response = content.as_ref().map_or_else(
                            || serde_json::json!({}),
                            |c| {
                                serde_json::from_str(c)
                                    .unwrap_or_else(|_| serde_json::json!({"result": c}))
                            },
                        );
                        parts.push(GeminiPart::FunctionResponse(GeminiFunctionResponse {
                            name: tool_use_id.clone(),
                            response,
                        }));
                    }
                }
            }
        }
    }

    // Gemini rejects empty part lists
    if parts.is_empty() {
        parts.push(GeminiPart::Text(String::new()));
    }

    Ok(GeminiContent {
        role: Some(role.to_owned()),
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::gemini::GeminiCandidate;

    fn simple_request() -> ChatRequest {
        ChatRequest {
            model: "gemini-pro".to_owned(),
            max_tokens: 256,
            system: Some("short answers".to_owned()),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: MessageContent::Text("hello".to_owned()),
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
    fn system_prompt_becomes_system_instruction() {
        let FamilyRequest::Gemini(wire) = GeminiTransformer.to_family(&simple_request()).unwrap() else {
            panic!("wrong family");
        };
        assert!(wire.system_instruction.is_some());
        assert_eq!(wire.contents.len(), 1);
        assert_eq!(wire.contents[0].role.as_deref(), Some("user"));
    }

    #[test]
    fn url_images_are_a_transform_error() {
        let mut request = simple_request();
        request.messages[0].content = MessageContent::Blocks(vec![ContentBlock::Image {
            source: crate::types::ImageSource {
                source_type: "url".to_owned(),
                media_type: None,
                data: "https://example.com/cat.png".to_owned(),
            },
        }]);

        let err = GeminiTransformer.to_family(&request).unwrap_err();
        assert!(matches!(err, ProxyError::Transform { .. }));
    }

    #[test]
    fn function_call_becomes_tool_use_block() {
        let wire = GeminiResponse {
            candidates: vec![GeminiCandidate {
                content: GeminiContent {
                    role: Some("model".to_owned()),
                    parts: vec![GeminiPart::FunctionCall(GeminiFunctionCall {
                        name: "lookup".to_owned(),
                        args: serde_json::json!({"q": "x"}),
                    })],
                },
                finish_reason: Some("FUNCTION_CALL".to_owned()),
                index: Some(0),
            }],
            usage_metadata: None,
        };

        let reply = GeminiTransformer
            .to_client(FamilyResponse::Gemini(wire), "gemini-pro")
            .unwrap();

        assert_eq!(reply.stop_reason.as_deref(), Some("tool_use"));
        let ResponseBlock::ToolUse { id, name, .. } = &reply.content[0] else {
            panic!("expected tool_use");
        };
        assert!(id.starts_with("toolu_"));
        assert_eq!(name, "lookup");
    }
}
