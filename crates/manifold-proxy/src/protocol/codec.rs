//! Protocol stage: family schema <-> wire bodies and stream frames
//!
//! Codecs build the provider-specific URL and body for a request and
//! parse raw bodies or SSE frame payloads back into the family schema.
//! Error envelopes are rejected here as structured `Upstream` errors.

use bytes::Bytes;
use http::HeaderMap;
use manifold_core::ProxyError;
use url::Url;

use super::codewhisperer::{CwEvent, CwReply, CwToolUse};
use super::gemini::GeminiResponse;
use super::openai::{OpenAiStreamChunk, OpenAiResponse};
use crate::family::{FamilyRequest, FamilyResponse, ProviderFamily};
use crate::types::{ReplyDelta, ReplyEvent, StopKind, TokenUsage, ToolCallDelta};

/// A fully built provider request, ready for the server stage
#[derive(Debug, Clone)]
pub struct WireRequest {
    /// Absolute request URL
    pub url: Url,
    /// Headers beyond what the HTTP client adds itself
    pub headers: HeaderMap,
    /// JSON body
    pub body: serde_json::Value,
}

/// A raw provider response
#[derive(Debug, Clone)]
pub struct WireResponse {
    /// HTTP status
    pub status: u16,
    /// Raw body bytes
    pub body: Bytes,
}

/// The protocol stage contract
pub trait ProtocolCodec: Send + Sync {
    /// Build the wire request for a family request
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Transform` when the payload belongs to a
    /// different family or the endpoint URL cannot be extended.
    fn encode(&self, request: &FamilyRequest, endpoint: &Url, model: &str, stream: bool)
    -> Result<WireRequest, ProxyError>;

    /// Parse a complete response body into the family schema
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Upstream` for error envelopes and
    /// `ProxyError::Transform` for unparseable bodies.
    fn decode(&self, response: &WireResponse) -> Result<FamilyResponse, ProxyError>;

    /// Parse one SSE data payload into neutral reply events
    ///
    /// Unparseable keep-alive noise decodes to an empty vector.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Upstream` when the frame carries an error
    /// envelope.
    fn decode_frame(&self, data: &str) -> Result<Vec<ReplyEvent>, ProxyError>;
}

/// Build the codec for a family
pub fn codec_for(family: ProviderFamily) -> Box<dyn ProtocolCodec> {
    match family {
        ProviderFamily::OpenAi | ProviderFamily::OpenAiCompat => Box::new(OpenAiCodec),
        ProviderFamily::Gemini => Box::new(GeminiCodec),
        ProviderFamily::CodeWhisperer => Box::new(CwCodec),
    }
}

/// Extend an endpoint URL with a path suffix
fn join_endpoint(endpoint: &Url, suffix: &str) -> Result<Url, ProxyError> {
    let base = endpoint.as_str().trim_end_matches('/');
    Url::parse(&format!("{base}{suffix}")).map_err(|e| ProxyError::Transform {
        stage: "protocol",
        message: format!("cannot build request URL: {e}"),
    })
}

/// Reject a body that carries a JSON error envelope
fn reject_error_envelope(status: u16, body: &[u8]) -> Result<(), ProxyError> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(error) = value.get("error")
    {
        let message = error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("upstream reported an error")
            .to_owned();
        return Err(ProxyError::Upstream {
            status: if status < 400 { 502 } else { status },
            message,
        });
    }
    Ok(())
}

// -- OpenAI family --

/// Codec for OpenAI chat completions
pub struct OpenAiCodec;

impl ProtocolCodec for OpenAiCodec {
    fn encode(
        &self,
        request: &FamilyRequest,
        endpoint: &Url,
        _model: &str,
        stream: bool,
    ) -> Result<WireRequest, ProxyError> {
        let FamilyRequest::OpenAi(request) = request else {
            return Err(crate::transform::wrong_family("protocol"));
        };

        let mut wire = request.clone();
        wire.stream = stream.then_some(true);

        Ok(WireRequest {
            url: join_endpoint(endpoint, "/chat/completions")?,
            headers: HeaderMap::new(),
            body: serde_json::to_value(&wire).map_err(|e| ProxyError::Transform {
                stage: "protocol",
                message: format!("cannot serialize request: {e}"),
            })?,
        })
    }

    fn decode(&self, response: &WireResponse) -> Result<FamilyResponse, ProxyError> {
        reject_error_envelope(response.status, &response.body)?;

        let reply: OpenAiResponse = serde_json::from_slice(&response.body).map_err(|e| ProxyError::Transform {
            stage: "protocol",
            message: format!("unparseable openai response: {e}"),
        })?;

        Ok(FamilyResponse::OpenAi(reply))
    }

    fn decode_frame(&self, data: &str) -> Result<Vec<ReplyEvent>, ProxyError> {
        if data.trim() == "[DONE]" {
            return Ok(vec![ReplyEvent::Done]);
        }

        reject_error_envelope(200, data.as_bytes())?;

        let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(data) else {
            tracing::debug!(data, "skipping unparseable stream frame");
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        for choice in &chunk.choices {
            let tool_call = choice
                .delta
                .tool_calls
                .as_ref()
                .and_then(|calls| calls.first())
                .map(|call| ToolCallDelta {
                    index: call.index,
                    id: call.id.clone(),
                    name: call.function.as_ref().and_then(|f| f.name.clone()),
                    arguments: call.function.as_ref().and_then(|f| f.arguments.clone()),
                });

            events.push(ReplyEvent::Delta(ReplyDelta {
                index: choice.index,
                content: choice.delta.content.clone(),
                tool_call,
                stop_reason: choice.finish_reason.as_deref().and_then(StopKind::from_openai),
            }));
        }

        if let Some(usage) = &chunk.usage {
            events.push(ReplyEvent::Usage(TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            }));
        }

        Ok(events)
    }
}

// -- Gemini family --

/// Codec for Gemini generateContent
pub struct GeminiCodec;

impl ProtocolCodec for GeminiCodec {
    fn encode(
        &self,
        request: &FamilyRequest,
        endpoint: &Url,
        model: &str,
        stream: bool,
    ) -> Result<WireRequest, ProxyError> {
        let FamilyRequest::Gemini(request) = request else {
            return Err(crate::transform::wrong_family("protocol"));
        };

        let suffix = if stream {
            format!("/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("/models/{model}:generateContent")
        };

        Ok(WireRequest {
            url: join_endpoint(endpoint, &suffix)?,
            headers: HeaderMap::new(),
            body: serde_json::to_value(request).map_err(|e| ProxyError::Transform {
                stage: "protocol",
                message: format!("cannot serialize request: {e}"),
            })?,
        })
    }

    fn decode(&self, response: &WireResponse) -> Result<FamilyResponse, ProxyError> {
        reject_error_envelope(response.status, &response.body)?;

        let reply: GeminiResponse = serde_json::from_slice(&response.body).map_err(|e| ProxyError::Transform {
            stage: "protocol",
            message: format!("unparseable gemini response: {e}"),
        })?;

        Ok(FamilyResponse::Gemini(reply))
    }

    fn decode_frame(&self, data: &str) -> Result<Vec<ReplyEvent>, ProxyError> {
        reject_error_envelope(200, data.as_bytes())?;

        let Ok(chunk) = serde_json::from_str::<GeminiResponse>(data) else {
            tracing::debug!(data, "skipping unparseable stream frame");
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        for (i, candidate) in chunk.candidates.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let index = candidate.index.unwrap_or(i as u32);

            for part in &candidate.content.parts {
                match part {
                    super::gemini::GeminiPart::Text(text) => {
                        events.push(ReplyEvent::Delta(ReplyDelta {
                            index,
                            content: Some(text.clone()),
                            tool_call: None,
                            stop_reason: None,
                        }));
                    }
                    super::gemini::GeminiPart::FunctionCall(call) => {
                        events.push(ReplyEvent::Delta(ReplyDelta {
                            index,
                            content: None,
                            tool_call: Some(ToolCallDelta {
                                index: 0,
                                id: Some(format!("toolu_{}", uuid::Uuid::new_v4().simple())),
                                name: Some(call.name.clone()),
                                arguments: Some(call.args.to_string()),
                            }),
                            stop_reason: None,
                        }));
                    }
                    _ => {}
                }
            }

            if let Some(stop) = candidate.finish_reason.as_deref().and_then(StopKind::from_gemini) {
                events.push(ReplyEvent::Delta(ReplyDelta {
                    index,
                    content: None,
                    tool_call: None,
                    stop_reason: Some(stop),
                }));
            }
        }

        if let Some(usage) = &chunk.usage_metadata {
            events.push(ReplyEvent::Usage(TokenUsage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            }));
        }

        Ok(events)
    }
}

// -- CodeWhisperer family --

/// Codec for the CodeWhisperer conversation API
///
/// Replies arrive as JSON event objects, one per SSE frame (or one per
/// line on the non-streaming path), and aggregate into a `CwReply`.
pub struct CwCodec;

impl ProtocolCodec for CwCodec {
    fn encode(
        &self,
        request: &FamilyRequest,
        endpoint: &Url,
        _model: &str,
        _stream: bool,
    ) -> Result<WireRequest, ProxyError> {
        let FamilyRequest::CodeWhisperer(request) = request else {
            return Err(crate::transform::wrong_family("protocol"));
        };

        Ok(WireRequest {
            url: join_endpoint(endpoint, "/generateAssistantResponse")?,
            headers: HeaderMap::new(),
            body: serde_json::to_value(request).map_err(|e| ProxyError::Transform {
                stage: "protocol",
                message: format!("cannot serialize request: {e}"),
            })?,
        })
    }

    fn decode(&self, response: &WireResponse) -> Result<FamilyResponse, ProxyError> {
        reject_error_envelope(response.status, &response.body)?;

        let text = std::str::from_utf8(&response.body).map_err(|e| ProxyError::Transform {
            stage: "protocol",
            message: format!("non-utf8 codewhisperer response: {e}"),
        })?;

        let mut reply = CwReply::default();
        let mut pending_tools: Vec<(String, String, String)> = Vec::new();

        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let event: CwEvent = serde_json::from_str(line).map_err(|e| ProxyError::Transform {
                stage: "protocol",
                message: format!("unparseable codewhisperer event: {e}"),
            })?;
            fold_event(event, &mut reply, &mut pending_tools);
        }

        flush_pending(&mut reply, pending_tools);
        Ok(FamilyResponse::CodeWhisperer(reply))
    }

    fn decode_frame(&self, data: &str) -> Result<Vec<ReplyEvent>, ProxyError> {
        reject_error_envelope(200, data.as_bytes())?;

        let Ok(event) = serde_json::from_str::<CwEvent>(data) else {
            tracing::debug!(data, "skipping unparseable stream frame");
            return Ok(Vec::new());
        };

        Ok(match event {
            CwEvent::AssistantResponseEvent(text) => vec![ReplyEvent::Delta(ReplyDelta {
                index: 0,
                content: Some(text.content),
                tool_call: None,
                stop_reason: None,
            })],
            CwEvent::ToolUseEvent(tool_use) => vec![ReplyEvent::Delta(ReplyDelta {
                index: 0,
                content: None,
                tool_call: Some(ToolCallDelta {
                    index: 0,
                    id: Some(tool_use.tool_use_id),
                    name: Some(tool_use.name),
                    arguments: tool_use.input,
                }),
                stop_reason: None,
            })],
            CwEvent::MessageMetadataEvent(meta) => meta
                .stop_reason
                .as_deref()
                .and_then(StopKind::from_anthropic)
                .map(|stop| {
                    vec![ReplyEvent::Delta(ReplyDelta {
                        index: 0,
                        content: None,
                        tool_call: None,
                        stop_reason: Some(stop),
                    })]
                })
                .unwrap_or_default(),
        })
    }
}

/// Fold one event into the aggregate reply
fn fold_event(event: CwEvent, reply: &mut CwReply, pending: &mut Vec<(String, String, String)>) {
    match event {
        CwEvent::AssistantResponseEvent(text) => reply.content.push_str(&text.content),
        CwEvent::ToolUseEvent(tool_use) => {
            let slot = pending.iter_mut().find(|(id, _, _)| id == &tool_use.tool_use_id);
            match slot {
                Some((_, _, input)) => input.push_str(tool_use.input.as_deref().unwrap_or_default()),
                None => pending.push((
                    tool_use.tool_use_id,
                    tool_use.name,
                    tool_use.input.unwrap_or_default(),
                )),
            }
        }
        CwEvent::MessageMetadataEvent(meta) => {
            if meta.stop_reason.is_some() {
                reply.stop_reason = meta.stop_reason;
            }
        }
    }
}

/// Materialize buffered tool-use fragments
fn flush_pending(reply: &mut CwReply, pending: Vec<(String, String, String)>) {
    for (id, name, input) in pending {
        let input = serde_json::from_str(&input).unwrap_or_else(|_| serde_json::json!({}));
        reply.tool_uses.push(CwToolUse {
            tool_use_id: id,
            name,
            input,
        });
    }
}
