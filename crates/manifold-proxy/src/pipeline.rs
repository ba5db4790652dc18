//! The per-binding pipeline: four ordered bidirectional stages
//!
//! Request direction: transformer -> protocol -> server-compat ->
//! server; the reply walks the same stages in reverse. Transient server
//! failures retry against the same pipeline with exponential backoff;
//! auth and rate-limit failures surface immediately for the balancer to
//! act on.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use manifold_config::{AuthKind, CompatQuirks, ProviderKind, RetryConfig};
use manifold_core::{Direction, EventSink, ProxyError, RequestContext, StageEvent, StageKind};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::connector::{HttpConnector, classify_status};
use crate::family::ProviderFamily;
use crate::preprocess::{Preprocessor, StreamScanner};
use crate::protocol::{ProtocolCodec, WireRequest, codec_for};
use crate::transform::{Transformer, transformer_for};
use crate::types::{ChatRequest, ChatResponse, ReplyEvent, StopKind};

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Constructed, stages not yet initialized
    Created,
    /// Stages initialized from configuration
    Initialized,
    /// Connector ready
    Connected,
    /// Accepting traffic
    Running,
    /// Draining, no new work
    Disconnected,
    /// Torn down
    Destroyed,
}

impl PipelineState {
    /// Wire label for health endpoints
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::Disconnected => "disconnected",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Everything needed to build one pipeline
pub struct PipelineSpec {
    /// Binding id this pipeline serves
    pub binding: String,
    /// Provider id the binding came from
    pub provider: String,
    /// Provider kind from configuration
    pub kind: ProviderKind,
    /// Target model
    pub model: String,
    /// Base endpoint
    pub endpoint: Url,
    /// Credential presentation
    pub auth_kind: AuthKind,
    /// The credential itself, if any
    pub credential: Option<SecretString>,
    /// Endpoint quirks
    pub quirks: CompatQuirks,
    /// Retry policy
    pub retry: RetryConfig,
    /// Server-stage timeout
    pub timeout: Duration,
    /// Overall per-request deadline
    pub request_timeout: Duration,
    /// Model capping for max_tokens, if configured
    pub max_tokens_cap: Option<u32>,
}

/// One provider binding's executor
pub struct Pipeline {
    binding: String,
    provider: String,
    kind: ProviderKind,
    family: ProviderFamily,
    model: String,
    endpoint: Url,
    auth_kind: AuthKind,
    credential: Option<SecretString>,
    quirks: CompatQuirks,
    retry: RetryConfig,
    request_timeout: Duration,
    max_tokens_cap: Option<u32>,
    transformer: Box<dyn Transformer>,
    codec: Box<dyn ProtocolCodec>,
    connector: HttpConnector,
    preprocessor: Arc<Preprocessor>,
    state: Mutex<PipelineState>,
}

impl Pipeline {
    /// Build a pipeline from its spec
    pub fn new(spec: PipelineSpec, preprocessor: Arc<Preprocessor>) -> Self {
        let family = ProviderFamily::from(spec.kind);
        Self {
            binding: spec.binding,
            provider: spec.provider,
            kind: spec.kind,
            family,
            model: spec.model,
            endpoint: spec.endpoint,
            auth_kind: spec.auth_kind,
            credential: spec.credential,
            quirks: spec.quirks,
            retry: spec.retry,
            request_timeout: spec.request_timeout,
            max_tokens_cap: spec.max_tokens_cap,
            transformer: transformer_for(family),
            codec: codec_for(family),
            connector: HttpConnector::new(spec.timeout),
            preprocessor,
            state: Mutex::new(PipelineState::Created),
        }
    }

    /// Binding id this pipeline serves
    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// Provider id the binding came from
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Target model
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Provider family
    pub const fn family(&self) -> ProviderFamily {
        self.family
    }

    /// Current lifecycle state
    pub fn state(&self) -> PipelineState {
        *self.state.lock().expect("pipeline state lock")
    }

    /// Advance the lifecycle state
    pub fn set_state(&self, state: PipelineState) {
        *self.state.lock().expect("pipeline state lock") = state;
    }

    /// Execute one non-streaming request end-to-end
    ///
    /// # Errors
    ///
    /// Any kind from the error taxonomy; transient upstream failures are
    /// retried here first, everything else surfaces to the caller.
    pub async fn execute(
        &self,
        request: &ChatRequest,
        ctx: &RequestContext,
        sink: &EventSink,
    ) -> Result<ChatResponse, ProxyError> {
        match tokio::time::timeout(self.request_timeout, self.execute_inner(request, ctx, sink)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout(self.request_timeout)),
        }
    }

    async fn execute_inner(
        &self,
        request: &ChatRequest,
        ctx: &RequestContext,
        sink: &EventSink,
    ) -> Result<ChatResponse, ProxyError> {
        request.validate()?;

        let prepared = self.cap_max_tokens(request);

        // Transformer, request direction
        let started = Instant::now();
        let family_request = self.transformer.to_family(&prepared);
        self.emit(sink, ctx, StageKind::Transformer, Direction::Request, started, &family_request);
        let family_request = family_request?;

        // Protocol, request direction
        let started = Instant::now();
        let wire = self.codec.encode(&family_request, &self.endpoint, &self.model, false);
        self.emit(sink, ctx, StageKind::Protocol, Direction::Request, started, &wire);
        let mut wire = wire?;

        // Server-compat, request direction
        let started = Instant::now();
        self.prepare_wire(&mut wire);
        self.emit::<_, ProxyError>(sink, ctx, StageKind::ServerCompat, Direction::Request, started, &Ok(()));

        // Server stage with retries
        let response = self.send_with_retry(&wire, ctx, sink).await?;

        // Protocol, response direction
        let started = Instant::now();
        let family_response = self.codec.decode(&response);
        self.emit(sink, ctx, StageKind::Protocol, Direction::Response, started, &family_response);
        let mut family_response = family_response?;

        // Server-compat, response direction: the preprocessor
        let started = Instant::now();
        let report = self
            .preprocessor
            .run(self.family, self.kind, &self.quirks, &mut family_response);
        self.emit(sink, ctx, StageKind::ServerCompat, Direction::Response, started, &report);
        let report = report?;
        if report.reshaped > 0 || report.normalized {
            tracing::debug!(
                binding = %self.binding,
                reshaped = report.reshaped,
                normalized = report.normalized,
                "response repaired"
            );
        }

        // Transformer, response direction
        let started = Instant::now();
        let reply = self.transformer.to_client(family_response, &self.model);
        self.emit(sink, ctx, StageKind::Transformer, Direction::Response, started, &reply);
        reply
    }

    /// Execute one streaming request; frames repair incrementally
    ///
    /// # Errors
    ///
    /// As `execute`; once the stream is open, failures arrive as stream
    /// items instead.
    pub async fn execute_stream(
        self: Arc<Self>,
        request: &ChatRequest,
        ctx: &RequestContext,
        sink: &EventSink,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ReplyEvent, ProxyError>> + Send>>, ProxyError> {
        request.validate()?;

        let prepared = self.cap_max_tokens(request);

        let started = Instant::now();
        let family_request = self.transformer.to_family(&prepared);
        self.emit(sink, ctx, StageKind::Transformer, Direction::Request, started, &family_request);
        let family_request = family_request?;

        let started = Instant::now();
        let wire = self.codec.encode(&family_request, &self.endpoint, &self.model, true);
        self.emit(sink, ctx, StageKind::Protocol, Direction::Request, started, &wire);
        let mut wire = wire?;

        self.prepare_wire(&mut wire);

        // Open the stream, retrying transient failures like the
        // non-streaming path; failover after open is not possible
        let mut attempt = 0;
        let frames = loop {
            match self.connector.open_stream(&wire, ctx).await {
                Ok(frames) => break frames,
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    self.backoff(attempt, ctx).await?;
                }
                Err(e) => return Err(e),
            }
        };

        let pipeline = Arc::clone(&self);
        let scanner = StreamScanner::new(self.quirks.tool_call_literals.clone());

        let repaired = frames
            .scan(scanner, move |scanner, frame| {
                let out: Vec<Result<ReplyEvent, ProxyError>> = match frame {
                    Ok(data) => match pipeline.codec.decode_frame(&data) {
                        Ok(events) => events
                            .into_iter()
                            .map(|event| Ok(repair_stream_event(scanner, event)))
                            .collect(),
                        Err(e) => vec![Err(e)],
                    },
                    Err(e) => vec![Err(e)],
                };
                futures_util::future::ready(Some(out))
            })
            .flat_map(futures_util::stream::iter);

        Ok(Box::pin(repaired))
    }

    /// Lightweight health probe bounded by the given timeout
    ///
    /// # Errors
    ///
    /// Whatever the probe request fails with.
    pub async fn probe(&self, model: &str, timeout: Duration) -> Result<(), ProxyError> {
        let request = ChatRequest {
            model: model.to_owned(),
            max_tokens: 1,
            system: None,
            messages: vec![crate::types::ChatMessage {
                role: crate::types::ChatRole::User,
                content: crate::types::MessageContent::Text("ping".to_owned()),
            }],
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            metadata: None,
        };

        let family_request = self.transformer.to_family(&request)?;
        let mut wire = self.codec.encode(&family_request, &self.endpoint, model, false)?;
        self.prepare_wire(&mut wire);
        self.connector.probe(&wire, timeout).await
    }

    /// Server stage with the binding's retry policy
    async fn send_with_retry(
        &self,
        wire: &WireRequest,
        ctx: &RequestContext,
        sink: &EventSink,
    ) -> Result<crate::protocol::WireResponse, ProxyError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = self.send_once(wire, ctx).await;
            self.emit(sink, ctx, StageKind::Server, Direction::Request, started, &result);

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        binding = %self.binding,
                        attempt,
                        error = %e,
                        "transient upstream failure, retrying same pipeline"
                    );
                    self.backoff(attempt, ctx).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One server-stage round trip with status classification
    async fn send_once(
        &self,
        wire: &WireRequest,
        ctx: &RequestContext,
    ) -> Result<crate::protocol::WireResponse, ProxyError> {
        let response = self.connector.send(wire, ctx).await?;

        if (200..300).contains(&response.status) {
            return Ok(response);
        }

        let body = String::from_utf8_lossy(&response.body);
        Err(classify_status(response.status, &body))
    }

    /// Cancellation-aware exponential backoff
    async fn backoff(&self, attempt: u32, ctx: &RequestContext) -> Result<(), ProxyError> {
        let delay = Duration::from_millis(self.retry.backoff_ms(attempt));
        tokio::select! {
            () = ctx.cancel.cancelled() => Err(ProxyError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Server-compat request direction: credential injection
    fn prepare_wire(&self, wire: &mut WireRequest) {
        let Some(credential) = &self.credential else {
            return;
        };

        let header = match (self.auth_kind, self.family) {
            (AuthKind::None, _) => return,
            (AuthKind::ApiKey, ProviderFamily::Gemini) => ("x-goog-api-key", credential.expose_secret().to_owned()),
            (AuthKind::ApiKey, _) => ("x-api-key", credential.expose_secret().to_owned()),
            (AuthKind::Bearer, _) => ("authorization", format!("Bearer {}", credential.expose_secret())),
        };

        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(header.0),
            http::header::HeaderValue::try_from(header.1),
        ) {
            wire.headers.insert(name, value);
        }
    }

    /// Clamp max_tokens to the configured per-model cap
    fn cap_max_tokens(&self, request: &ChatRequest) -> ChatRequest {
        let mut prepared = request.clone();
        if let Some(cap) = self.max_tokens_cap
            && prepared.max_tokens > cap
        {
            prepared.max_tokens = cap;
        }
        prepared
    }

    /// Emit one stage event
    fn emit<T, E: std::fmt::Display>(
        &self,
        sink: &EventSink,
        ctx: &RequestContext,
        stage: StageKind,
        direction: Direction,
        started: Instant,
        result: &Result<T, E>,
    ) {
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        sink.emit(StageEvent {
            stage,
            direction,
            request_id: ctx.request_id.clone(),
            binding: self.binding.clone(),
            duration_ms,
            ok: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        });
    }
}

/// Apply incremental repair to one stream event
///
/// Content deltas feed the scanner and pass through byte-exact;
/// structural tool-call deltas mark intent; the terminal stop reason is
/// corrected to the tool value when intent was detected (final-chunk
/// correction only).
fn repair_stream_event(scanner: &mut StreamScanner, event: ReplyEvent) -> ReplyEvent {
    let ReplyEvent::Delta(mut delta) = event else {
        return event;
    };

    if let Some(content) = &delta.content {
        scanner.push(content);
    }
    if delta.tool_call.is_some() {
        scanner.mark_structural();
    }

    if let Some(stop) = delta.stop_reason
        && stop != StopKind::ToolUse
        && scanner.tool_intent()
    {
        delta.stop_reason = Some(StopKind::ToolUse);
    }

    ReplyEvent::Delta(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::{ReplyDelta, ToolCallDelta};

    #[test]
    fn pipeline_state_labels() {
        assert_eq!(PipelineState::Running.as_str(), "running");
        assert_eq!(PipelineState::Disconnected.as_str(), "disconnected");
    }

    #[test]
    fn stream_stop_corrected_after_textual_detection() {
        let mut scanner = StreamScanner::new(Vec::new());

        let content = repair_stream_event(
            &mut scanner,
            ReplyEvent::Delta(ReplyDelta {
                index: 0,
                content: Some(r#"Tool call: f({"a":1})"#.to_owned()),
                tool_call: None,
                stop_reason: None,
            }),
        );
        assert!(matches!(content, ReplyEvent::Delta(_)));

        let terminal = repair_stream_event(
            &mut scanner,
            ReplyEvent::Delta(ReplyDelta {
                index: 0,
                content: None,
                tool_call: None,
                stop_reason: Some(StopKind::EndTurn),
            }),
        );
        let ReplyEvent::Delta(delta) = terminal else {
            panic!("expected delta");
        };
        assert_eq!(delta.stop_reason, Some(StopKind::ToolUse));
    }

    #[test]
    fn stream_stop_untouched_without_intent() {
        let mut scanner = StreamScanner::new(Vec::new());

        repair_stream_event(
            &mut scanner,
            ReplyEvent::Delta(ReplyDelta {
                index: 0,
                content: Some("plain words".to_owned()),
                tool_call: None,
                stop_reason: None,
            }),
        );

        let terminal = repair_stream_event(
            &mut scanner,
            ReplyEvent::Delta(ReplyDelta {
                index: 0,
                content: None,
                tool_call: None,
                stop_reason: Some(StopKind::EndTurn),
            }),
        );
        let ReplyEvent::Delta(delta) = terminal else {
            panic!("expected delta");
        };
        assert_eq!(delta.stop_reason, Some(StopKind::EndTurn));
    }

    #[test]
    fn stream_content_passes_through_byte_exact() {
        let mut scanner = StreamScanner::new(Vec::new());
        let chunks = ["hel", "lo ", "wor", "ld, Tool ca", "ll mention"];

        let mut out = String::new();
        for chunk in chunks {
            let event = repair_stream_event(
                &mut scanner,
                ReplyEvent::Delta(ReplyDelta {
                    index: 0,
                    content: Some((*chunk).to_owned()),
                    tool_call: None,
                    stop_reason: None,
                }),
            );
            let ReplyEvent::Delta(delta) = event else {
                panic!("expected delta");
            };
            out.push_str(delta.content.as_deref().unwrap());
        }

        assert_eq!(out, chunks.concat());
    }

    #[test]
    fn structural_delta_marks_intent() {
        let mut scanner = StreamScanner::new(Vec::new());

        repair_stream_event(
            &mut scanner,
            ReplyEvent::Delta(ReplyDelta {
                index: 0,
                content: None,
                tool_call: Some(ToolCallDelta {
                    index: 0,
                    id: Some("call_1".to_owned()),
                    name: Some("f".to_owned()),
                    arguments: None,
                }),
                stop_reason: None,
            }),
        );

        assert!(scanner.tool_intent());
    }
}
