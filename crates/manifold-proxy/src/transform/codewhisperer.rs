//! Client schema <-> CodeWhisperer conversation conversion

use manifold_core::ProxyError;

use super::{Transformer, wrong_family};
use crate::family::{FamilyRequest, FamilyResponse, ProviderFamily};
use crate::protocol::codewhisperer::{
    CwAssistantResponse, CwConversationState, CwInputSchema, CwRequest, CwToolResult, CwToolSpec,
    CwToolSpecification, CwToolUse, CwTurn, CwUserInput, CwUserInputContext,
};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, ContentBlock, MessageContent, ResponseBlock, StopKind,
    TokenUsage,
};

/// Transformer for the CodeWhisperer family
pub struct CwTransformer;

impl Transformer for CwTransformer {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::CodeWhisperer
    }

    fn to_family(&self, request: &ChatRequest) -> Result<FamilyRequest, ProxyError> {
        let (last, history_messages) = request
            .messages
            .split_last()
            .ok_or_else(|| ProxyError::BadRequest("messages must not be empty".to_owned()))?;

        if last.role != ChatRole::User {
            return Err(ProxyError::Transform {
                stage: "transformer",
                message: "codewhisperer conversations must end with a user turn".to_owned(),
            });
        }

        let history = history_messages
            .iter()
            .map(|m| client_message_to_turn(m, request))
            .collect::<Result<Vec<_>, _>>()?;

        let mut current = match client_message_to_turn(last, request)? {
            CwTurn::UserInputMessage(input) => input,
            CwTurn::AssistantResponseMessage(_) => unreachable!("last turn checked to be user"),
        };

        // Tool declarations ride on the current turn
        if let Some(tools) = &request.tools {
            let specs = tools
                .iter()
                .map(|t| CwToolSpec {
                    tool_specification: CwToolSpecification {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: CwInputSchema {
                            json: t.input_schema.clone(),
                        },
                    },
                })
                .collect();
            current
                .user_input_message_context
                .get_or_insert_with(CwUserInputContext::default)
                .tools = specs;
        }

        // System prompt folds into the current turn's content
        if let Some(system) = &request.system {
            current.content = format!("{system}\n\n{}", current.content);
        }

        Ok(FamilyRequest::CodeWhisperer(CwRequest {
            conversation_state: CwConversationState {
                chat_trigger_type: "MANUAL".to_owned(),
                conversation_id: format!("conv_{}", uuid::Uuid::new_v4().simple()),
                current_message: CwTurn::UserInputMessage(current),
                history,
            },
        }))
    }

    fn to_client(&self, response: FamilyResponse, model: &str) -> Result<ChatResponse, ProxyError> {
        let FamilyResponse::CodeWhisperer(reply) = response else {
            return Err(wrong_family("transformer"));
        };

        let mut content = Vec::new();
        if !reply.content.is_empty() {
            content.push(ResponseBlock::Text {
                text: reply.content,
            });
        }
        for tool_use in reply.tool_uses {
            content.push(ResponseBlock::ToolUse {
                id: tool_use.tool_use_id,
                name: tool_use.name,
                input: tool_use.input,
            });
        }

        let stop_reason = reply
            .stop_reason
            .as_deref()
            .and_then(StopKind::from_anthropic)
            .map(|kind| kind.as_client_str().to_owned());

        Ok(ChatResponse {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            response_type: "message".to_owned(),
            role: "assistant".to_owned(),
            content,
            model: model.to_owned(),
            stop_reason,
            stop_sequence: None,
            // CodeWhisperer reports no token counts
            usage: TokenUsage::default(),
        })
    }
}

/// Convert one client message to a conversation turn
fn client_message_to_turn(message: &ChatMessage, request: &ChatRequest) -> Result<CwTurn, ProxyError> {
    match message.role {
        ChatRole::User => {
            let mut text = String::new();
            let mut tool_results = Vec::new();

            match &message.content {
                MessageContent::Text(t) => text.push_str(t),
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        match block {
                            ContentBlock::Text { text: t } => text.push_str(t),
                            ContentBlock::ToolResult {
                                tool_use_id,
                                content,
                                is_error,
                            } => tool_results.push(CwToolResult {
                                tool_use_id: tool_use_id.clone(),
                                content: vec![serde_json::json!({"text": content.clone().unwrap_or_default()})],
                                status: if is_error.unwrap_or(false) { "error" } else { "success" }.to_owned(),
                            }),
                            ContentBlock::Image { .. } => {
                                return Err(ProxyError::Transform {
                                    stage: "transformer",
                                    message: "codewhisperer does not accept image content".to_owned(),
                                });
                            }
                            ContentBlock::ToolUse { .. } => {
                                return Err(ProxyError::Transform {
                                    stage: "transformer",
                                    message: "tool_use blocks belong to assistant turns".to_owned(),
                                });
                            }
                        }
                    }
                }
            }

            let context = if tool_results.is_empty() {
                None
            } else {
                Some(CwUserInputContext {
                    tools: Vec::new(),
                    tool_results,
                })
            };

            Ok(CwTurn::UserInputMessage(CwUserInput {
                content: text,
                model_id: request.model.clone(),
                user_input_message_context: context,
            }))
        }
        ChatRole::Assistant => {
            let mut text = String::new();
            let mut tool_uses = Vec::new();

            match &message.content {
                MessageContent::Text(t) => text.push_str(t),
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        match block {
                            ContentBlock::Text { text: t } => text.push_str(t),
                            ContentBlock::ToolUse { id, name, input } => tool_uses.push(CwToolUse {
                                tool_use_id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            }),
                            _ => {
                                return Err(ProxyError::Transform {
                                    stage: "transformer",
                                    message: "unsupported block in assistant turn".to_owned(),
                                });
                            }
                        }
                    }
                }
            }

            Ok(CwTurn::AssistantResponseMessage(CwAssistantResponse {
                content: text,
                tool_uses,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codewhisperer::CwReply;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "claude-sonnet".to_owned(),
            max_tokens: 256,
            system: None,
            messages: vec![
                ChatMessage {
                    role: ChatRole::Assistant,
                    content: MessageContent::Text("earlier".to_owned()),
                },
                ChatMessage {
                    role: ChatRole::User,
                    content: MessageContent::Text("now".to_owned()),
                },
            ],
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
    fn last_user_turn_becomes_current_message() {
        let FamilyRequest::CodeWhisperer(wire) = CwTransformer.to_family(&request()).unwrap() else {
            panic!("wrong family");
        };
        let state = wire.conversation_state;
        assert_eq!(state.history.len(), 1);
        let CwTurn::UserInputMessage(current) = state.current_message else {
            panic!("current must be a user turn");
        };
        assert_eq!(current.content, "now");
        assert_eq!(current.model_id, "claude-sonnet");
    }

    #[test]
    fn trailing_assistant_turn_is_rejected() {
        let mut req = request();
        req.messages.push(ChatMessage {
            role: ChatRole::Assistant,
            content: MessageContent::Text("trailing".to_owned()),
        });
        assert!(CwTransformer.to_family(&req).is_err());
    }

    #[test]
    fn reply_maps_tool_uses() {
        let reply = CwReply {
            content: "using a tool".to_owned(),
            tool_uses: vec![CwToolUse {
                tool_use_id: "toolu_9".to_owned(),
                name: "grep".to_owned(),
                input: serde_json::json!({"pattern": "fn"}),
            }],
            stop_reason: Some("tool_use".to_owned()),
        };

        let out = CwTransformer
            .to_client(FamilyResponse::CodeWhisperer(reply), "claude-sonnet")
            .unwrap();

        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(out.content.len(), 2);
    }
}
