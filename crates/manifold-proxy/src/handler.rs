//! Axum route handlers for the client-facing surface
//!
//! `POST /v1/messages` speaks the client schema, streamed via SSE when
//! requested. Selection failover loops here: a failed binding releases
//! its lease with the right outcome and the next eligible binding is
//! tried, up to the category's `max_failures`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use futures_util::StreamExt;
use manifold_balance::{BalanceError, Lease, Outcome};
use manifold_core::{HttpError, ProxyError, RequestContext};

use crate::pipeline::PipelineState;
use crate::state::ProxyState;
use crate::types::{
    ChatRequest, ClientStreamEvent, MessageDeltaBody, MessageStartBody, ReplyEvent, StreamBlock, StreamBlockDelta,
    TokenUsage,
};

/// Build the proxy router with all endpoints
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/messages", routing::post(messages))
        .route("/v1/models", routing::get(models))
        .route("/health", routing::get(health))
        .route("/status", routing::get(status))
        .route("/version", routing::get(version))
        .with_state(state)
}

/// Handle `POST /v1/messages`
async fn messages(State(state): State<ProxyState>, Json(request): Json<ChatRequest>) -> Response {
    let ctx = RequestContext::new();

    if let Err(e) = request.validate() {
        return error_response(&e);
    }

    let is_stream = request.stream.unwrap_or(false);
    let category = state.classifier().classify(&request);
    let (category, route) = match state.resolve_route(category) {
        Ok(resolved) => resolved,
        Err(e) => return error_response(&e),
    };

    tracing::debug!(
        request_id = %ctx.request_id,
        category = %category,
        model = %request.model,
        stream = is_stream,
        "request classified"
    );

    let attempts = if route.enable_failover {
        route.max_failures.max(1)
    } else {
        1
    };

    let mut last_error = ProxyError::NoEligibleBinding {
        category: category.to_string(),
    };

    for attempt in 0..attempts {
        let lease = match state
            .balancer()
            .acquire(&category.to_string(), route.strategy, &route.candidates)
        {
            Ok(lease) => lease,
            Err(BalanceError::NoEligibleBinding { category }) => {
                return error_response(&ProxyError::NoEligibleBinding { category });
            }
            Err(BalanceError::UnknownBinding { binding }) => {
                return error_response(&ProxyError::Internal(anyhow::anyhow!("unknown binding {binding}")));
            }
        };

        let guard = Arc::new(LeaseGuard::new(state.clone(), lease.clone(), ctx.clone()));

        let Some(pipeline) = state.registry().pipeline(&lease.binding, &lease.model) else {
            guard.complete(Outcome::Cancelled, false);
            return error_response(&ProxyError::Internal(anyhow::anyhow!(
                "no pipeline for binding {}",
                lease.binding
            )));
        };

        if pipeline.state() != PipelineState::Running {
            guard.complete(Outcome::Cancelled, false);
            return error_response(&ProxyError::NoEligibleBinding {
                category: category.to_string(),
            });
        }

        if is_stream {
            match pipeline.clone().execute_stream(&request, &ctx, state.sink()).await {
                Ok(events) => return stream_response(events, guard, &lease),
                Err(e) => {
                    guard.complete(outcome_for(&e), false);
                    if should_failover(&e) && attempt + 1 < attempts {
                        tracing::warn!(
                            binding = %lease.binding,
                            error = %e,
                            "binding failed before stream open, trying next"
                        );
                        last_error = e;
                        continue;
                    }
                    return error_response(&e);
                }
            }
        } else {
            match pipeline.execute(&request, &ctx, state.sink()).await {
                Ok(reply) => {
                    guard.complete(Outcome::Success, true);
                    return Json(reply).into_response();
                }
                Err(e) => {
                    guard.complete(outcome_for(&e), false);
                    if should_failover(&e) && attempt + 1 < attempts {
                        tracing::warn!(
                            binding = %lease.binding,
                            error = %e,
                            "binding failed, trying next"
                        );
                        last_error = e;
                        continue;
                    }
                    return error_response(&e);
                }
            }
        }
    }

    error_response(&last_error)
}

/// Map an unrecovered error to the balancer outcome
fn outcome_for(error: &ProxyError) -> Outcome {
    match error {
        ProxyError::RateLimit { .. } => Outcome::RateLimit,
        ProxyError::Auth(_) => Outcome::AuthFailure,
        ProxyError::Upstream { status: 500..=599, .. } | ProxyError::EmptyResponse | ProxyError::MissingFinishReason => {
            Outcome::ServerError
        }
        ProxyError::Upstream { .. } => Outcome::TransientFailure,
        ProxyError::Network(_) => Outcome::NetworkError,
        ProxyError::Timeout(_) => Outcome::Timeout,
        // Pre-upstream failures are not the binding's fault
        ProxyError::BadRequest(_)
        | ProxyError::NoEligibleBinding { .. }
        | ProxyError::Transform { .. }
        | ProxyError::Cancelled
        | ProxyError::Internal(_) => Outcome::Cancelled,
    }
}

/// Whether another binding should be tried after this failure
fn should_failover(error: &ProxyError) -> bool {
    matches!(
        error,
        ProxyError::RateLimit { .. }
            | ProxyError::Auth(_)
            | ProxyError::Upstream { .. }
            | ProxyError::Network(_)
            | ProxyError::Timeout(_)
            | ProxyError::EmptyResponse
            | ProxyError::MissingFinishReason
    )
}

/// Releases the lease exactly once; a drop without completion counts as
/// a cancellation and aborts the upstream call
struct LeaseGuard {
    state: ProxyState,
    lease: Lease,
    ctx: RequestContext,
    started: Instant,
    completed: AtomicBool,
}

impl LeaseGuard {
    fn new(state: ProxyState, lease: Lease, ctx: RequestContext) -> Self {
        Self {
            state,
            lease,
            ctx,
            started: Instant::now(),
            completed: AtomicBool::new(false),
        }
    }

    fn complete(&self, outcome: Outcome, with_latency: bool) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let latency = with_latency.then(|| self.started.elapsed());
        self.state.balancer().release(&self.lease, outcome, latency);
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // An uncompleted drop means the client went away mid-flight:
        // abort the upstream call and release without penalty. A
        // completed guard must leave the context alone so a failover
        // attempt can reuse it.
        if !self.completed.load(Ordering::SeqCst) {
            self.ctx.cancel.cancel();
            self.complete(Outcome::Cancelled, false);
        }
    }
}

/// Build the SSE response for a streamed reply
fn stream_response(
    events: std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<ReplyEvent, ProxyError>> + Send>>,
    guard: Arc<LeaseGuard>,
    lease: &Lease,
) -> Response {
    let mut encoder = ClientStreamEncoder::new(lease.model.clone());

    let sse_stream = events
        .map(move |item| {
            let frames: Vec<Result<Event, axum::Error>> = match item {
                Ok(event) => {
                    if matches!(event, ReplyEvent::Done) {
                        guard.complete(Outcome::Success, true);
                    }
                    encoder
                        .encode(&event)
                        .into_iter()
                        .map(|client_event| {
                            let data = serde_json::to_string(&client_event).unwrap_or_default();
                            Ok(Event::default().event(client_event.event_name()).data(data))
                        })
                        .collect()
                }
                Err(e) => {
                    guard.complete(outcome_for(&e), false);
                    let body = serde_json::json!({
                        "type": "error",
                        "error": {"type": e.error_type(), "message": e.client_message()}
                    });
                    vec![Ok(Event::default().event("error").data(body.to_string()))]
                }
            };
            futures_util::stream::iter(frames)
        })
        .flatten();

    Sse::new(sse_stream).keep_alive(KeepAlive::default()).into_response()
}

/// Re-frames neutral reply events in the client schema's SSE shape
struct ClientStreamEncoder {
    message_id: String,
    model: String,
    started: bool,
    next_block: u32,
    text_block: Option<u32>,
    tool_blocks: HashMap<u32, u32>,
    open_blocks: Vec<u32>,
}

impl ClientStreamEncoder {
    fn new(model: String) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model,
            started: false,
            next_block: 0,
            text_block: None,
            tool_blocks: HashMap::new(),
            open_blocks: Vec::new(),
        }
    }

    fn encode(&mut self, event: &ReplyEvent) -> Vec<ClientStreamEvent> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);

        match event {
            ReplyEvent::Delta(delta) => {
                if let Some(content) = &delta.content {
                    let index = self.ensure_text_block(&mut out);
                    out.push(ClientStreamEvent::ContentBlockDelta {
                        index,
                        delta: StreamBlockDelta::TextDelta {
                            text: content.clone(),
                        },
                    });
                }

                if let Some(tool_call) = &delta.tool_call {
                    let index = self.ensure_tool_block(tool_call, &mut out);
                    if let Some(arguments) = &tool_call.arguments {
                        out.push(ClientStreamEvent::ContentBlockDelta {
                            index,
                            delta: StreamBlockDelta::InputJsonDelta {
                                partial_json: arguments.clone(),
                            },
                        });
                    }
                }

                if let Some(stop) = delta.stop_reason {
                    out.push(ClientStreamEvent::MessageDelta {
                        delta: MessageDeltaBody {
                            stop_reason: Some(stop.as_client_str().to_owned()),
                            stop_sequence: None,
                        },
                        usage: None,
                    });
                }
            }
            ReplyEvent::Usage(usage) => {
                out.push(ClientStreamEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: None,
                        stop_sequence: None,
                    },
                    usage: Some(*usage),
                });
            }
            ReplyEvent::Done => {
                for index in self.open_blocks.drain(..) {
                    out.push(ClientStreamEvent::ContentBlockStop { index });
                }
                out.push(ClientStreamEvent::MessageStop);
            }
        }

        out
    }

    fn ensure_started(&mut self, out: &mut Vec<ClientStreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(ClientStreamEvent::MessageStart {
            message: MessageStartBody {
                id: self.message_id.clone(),
                message_type: "message".to_owned(),
                role: "assistant".to_owned(),
                model: self.model.clone(),
                usage: Some(TokenUsage::default()),
            },
        });
    }

    fn ensure_text_block(&mut self, out: &mut Vec<ClientStreamEvent>) -> u32 {
        if let Some(index) = self.text_block {
            return index;
        }
        let index = self.next_block;
        self.next_block += 1;
        self.text_block = Some(index);
        self.open_blocks.push(index);
        out.push(ClientStreamEvent::ContentBlockStart {
            index,
            content_block: StreamBlock::Text { text: String::new() },
        });
        index
    }

    fn ensure_tool_block(&mut self, tool_call: &crate::types::ToolCallDelta, out: &mut Vec<ClientStreamEvent>) -> u32 {
        if let Some(index) = self.tool_blocks.get(&tool_call.index) {
            return *index;
        }
        let index = self.next_block;
        self.next_block += 1;
        self.tool_blocks.insert(tool_call.index, index);
        self.open_blocks.push(index);
        out.push(ClientStreamEvent::ContentBlockStart {
            index,
            content_block: StreamBlock::ToolUse {
                id: tool_call
                    .id
                    .clone()
                    .unwrap_or_else(crate::preprocess::synth_tool_id),
                name: tool_call.name.clone().unwrap_or_default(),
                input: serde_json::json!({}),
            },
        });
        index
    }
}

/// Convert an error to a client-schema error response
fn error_response(error: &ProxyError) -> Response {
    let status = error.status_code();
    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": error.error_type(),
            "message": error.client_message(),
        }
    });

    (status, Json(body)).into_response()
}

// -- Operational endpoints --

/// Handle `GET /health`
async fn health(State(state): State<ProxyState>) -> Response {
    let mut pipelines = serde_json::Map::new();

    for pipeline in state.registry().pipelines() {
        let snapshot = state.balancer().snapshot(pipeline.binding(), pipeline.model());
        pipelines.insert(
            format!("{}:{}", pipeline.binding(), pipeline.model()),
            serde_json::json!({
                "state": pipeline.state().as_str(),
                "cb_state": snapshot.breaker.as_str(),
                "blacklisted": snapshot.blacklisted,
                "in_flight": snapshot.in_flight,
                "avg_latency_ms": snapshot.avg_latency_ms,
            }),
        );
    }

    Json(serde_json::json!({
        "status": "ok",
        "pipelines": pipelines,
    }))
    .into_response()
}

/// Handle `GET /status`
async fn status(State(state): State<ProxyState>) -> Response {
    let mut categories = serde_json::Map::new();
    for category in [
        manifold_config::Category::Default,
        manifold_config::Category::Background,
        manifold_config::Category::Thinking,
        manifold_config::Category::Longcontext,
        manifold_config::Category::Search,
    ] {
        if let Some(route) = state.registry().route(category) {
            let candidates: Vec<serde_json::Value> = route
                .candidates
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "binding": c.binding,
                        "model": c.model,
                        "weight": c.weight,
                        "multi_key": c.key_group.is_some(),
                    })
                })
                .collect();
            categories.insert(
                category.to_string(),
                serde_json::json!({
                    "failover": route.enable_failover,
                    "candidates": candidates,
                }),
            );
        }
    }

    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.uptime().as_secs(),
        "in_flight": state.balancer().total_in_flight(),
        "capture_events_dropped": state.sink().dropped_count(),
        "categories": categories,
    }))
    .into_response()
}

/// Handle `GET /version`
async fn version() -> Response {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

/// Handle `GET /v1/models`: the flat list of routed targets
async fn models(State(state): State<ProxyState>) -> Response {
    let mut seen = std::collections::HashSet::new();
    let mut data = Vec::new();

    for pipeline in state.registry().pipelines() {
        let key = (pipeline.provider().to_owned(), pipeline.model().to_owned());
        if seen.insert(key) {
            data.push(serde_json::json!({
                "id": format!("{}/{}", pipeline.provider(), pipeline.model()),
                "provider": pipeline.provider(),
                "model": pipeline.model(),
            }));
        }
    }

    Json(serde_json::json!({"data": data})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReplyDelta, StopKind, ToolCallDelta};

    #[test]
    fn encoder_frames_a_text_stream() {
        let mut encoder = ClientStreamEncoder::new("m".to_owned());

        let first = encoder.encode(&ReplyEvent::Delta(ReplyDelta {
            index: 0,
            content: Some("hel".to_owned()),
            tool_call: None,
            stop_reason: None,
        }));
        assert!(matches!(first[0], ClientStreamEvent::MessageStart { .. }));
        assert!(matches!(first[1], ClientStreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(first[2], ClientStreamEvent::ContentBlockDelta { index: 0, .. }));

        let next = encoder.encode(&ReplyEvent::Delta(ReplyDelta {
            index: 0,
            content: Some("lo".to_owned()),
            tool_call: None,
            stop_reason: None,
        }));
        assert_eq!(next.len(), 1);

        let done = encoder.encode(&ReplyEvent::Done);
        assert!(matches!(done[0], ClientStreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(done[1], ClientStreamEvent::MessageStop));
    }

    #[test]
    fn encoder_opens_tool_blocks_with_ids() {
        let mut encoder = ClientStreamEncoder::new("m".to_owned());

        let events = encoder.encode(&ReplyEvent::Delta(ReplyDelta {
            index: 0,
            content: None,
            tool_call: Some(ToolCallDelta {
                index: 0,
                id: Some("toolu_1".to_owned()),
                name: Some("search".to_owned()),
                arguments: Some("{\"q\":".to_owned()),
            }),
            stop_reason: None,
        }));

        let start = events
            .iter()
            .find(|e| matches!(e, ClientStreamEvent::ContentBlockStart { .. }))
            .unwrap();
        let ClientStreamEvent::ContentBlockStart { content_block, .. } = start else {
            unreachable!()
        };
        let StreamBlock::ToolUse { id, name, .. } = content_block else {
            panic!("expected tool_use block");
        };
        assert_eq!(id, "toolu_1");
        assert_eq!(name, "search");

        assert!(
            events
                .iter()
                .any(|e| matches!(e, ClientStreamEvent::ContentBlockDelta { .. }))
        );
    }

    #[test]
    fn encoder_emits_stop_reason_delta() {
        let mut encoder = ClientStreamEncoder::new("m".to_owned());
        let events = encoder.encode(&ReplyEvent::Delta(ReplyDelta {
            index: 0,
            content: None,
            tool_call: None,
            stop_reason: Some(StopKind::ToolUse),
        }));

        let delta = events
            .iter()
            .find_map(|e| match e {
                ClientStreamEvent::MessageDelta { delta, .. } => Some(delta),
                _ => None,
            })
            .unwrap();
        assert_eq!(delta.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn failover_covers_upstream_faults_only() {
        assert!(should_failover(&ProxyError::RateLimit { retry_after: None }));
        assert!(should_failover(&ProxyError::Auth("denied".to_owned())));
        assert!(!should_failover(&ProxyError::BadRequest("bad".to_owned())));
        assert!(!should_failover(&ProxyError::Transform {
            stage: "transformer",
            message: "x".to_owned(),
        }));
    }

    #[test]
    fn outcomes_map_to_the_fault_substrate() {
        assert_eq!(outcome_for(&ProxyError::RateLimit { retry_after: None }), Outcome::RateLimit);
        assert_eq!(outcome_for(&ProxyError::Auth(String::new())), Outcome::AuthFailure);
        assert_eq!(
            outcome_for(&ProxyError::Upstream {
                status: 502,
                message: String::new()
            }),
            Outcome::ServerError
        );
        assert_eq!(outcome_for(&ProxyError::MissingFinishReason), Outcome::ServerError);
        assert_eq!(outcome_for(&ProxyError::Cancelled), Outcome::Cancelled);
    }
}
