//! Server stage: the actual network call
//!
//! One `reqwest` client per pipeline with the binding's server-stage
//! timeout. Streamed replies come back as SSE data payloads; every
//! suspension point observes the request's cancellation token.

use std::pin::Pin;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use manifold_core::{ProxyError, RequestContext};
use reqwest::Client;

use crate::protocol::{WireRequest, WireResponse};

/// SSE data payloads from an open stream
pub type SseStream = Pin<Box<dyn Stream<Item = Result<String, ProxyError>> + Send>>;

/// The server stage for one pipeline
pub struct HttpConnector {
    client: Client,
    timeout: Duration,
}

impl HttpConnector {
    /// Create a connector with the binding's server-stage timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// Send a request and collect the whole response
    ///
    /// The status is returned as-is; classifying 4xx/5xx is the
    /// pipeline's job.
    ///
    /// # Errors
    ///
    /// `ProxyError::Timeout` when the deadline expires,
    /// `ProxyError::Network` for transport failures, and
    /// `ProxyError::Cancelled` when the client went away.
    pub async fn send(&self, wire: &WireRequest, ctx: &RequestContext) -> Result<WireResponse, ProxyError> {
        let request = self
            .client
            .post(wire.url.clone())
            .headers(wire.headers.clone())
            .timeout(self.timeout)
            .json(&wire.body);

        let response = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(ProxyError::Cancelled),
            result = request.send() => result.map_err(|e| self.map_transport_error(&e))?,
        };

        let status = response.status().as_u16();
        let body = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(ProxyError::Cancelled),
            result = response.bytes() => result.map_err(|e| self.map_transport_error(&e))?,
        };

        Ok(WireResponse { status, body })
    }

    /// Send a request and open the reply as an SSE stream
    ///
    /// A non-2xx status is read to completion and surfaced through
    /// `classify_status` so the fault substrate sees the right outcome.
    ///
    /// # Errors
    ///
    /// As `send`, plus the classified error for non-2xx statuses.
    pub async fn open_stream(&self, wire: &WireRequest, ctx: &RequestContext) -> Result<SseStream, ProxyError> {
        let request = self
            .client
            .post(wire.url.clone())
            .headers(wire.headers.clone())
            .timeout(self.timeout)
            .json(&wire.body);

        let response = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(ProxyError::Cancelled),
            result = request.send() => result.map_err(|e| self.map_transport_error(&e))?,
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let cancel = ctx.cancel.clone();
        let frames = response
            .bytes_stream()
            .eventsource()
            .map(|result| match result {
                Ok(event) => Ok(event.data),
                Err(e) => Err(ProxyError::Network(e.to_string())),
            })
            .take_while(move |_| {
                let live = !cancel.is_cancelled();
                async move { live }
            });

        Ok(Box::pin(frames))
    }

    /// Lightweight reachability probe bounded by its own timeout
    ///
    /// # Errors
    ///
    /// `ProxyError::Timeout` or `ProxyError::Network` when the endpoint
    /// is unreachable; the classified error for non-2xx statuses.
    pub async fn probe(&self, wire: &WireRequest, timeout: Duration) -> Result<(), ProxyError> {
        let request = self
            .client
            .post(wire.url.clone())
            .headers(wire.headers.clone())
            .timeout(timeout)
            .json(&wire.body);

        let response = request.send().await.map_err(|e| self.map_transport_error(&e))?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }

    fn map_transport_error(&self, error: &reqwest::Error) -> ProxyError {
        if error.is_timeout() {
            ProxyError::Timeout(self.timeout)
        } else {
            ProxyError::Network(error.to_string())
        }
    }
}

/// Map an upstream HTTP status to the error taxonomy
pub fn classify_status(status: u16, body: &str) -> ProxyError {
    let summary: String = body.chars().take(300).collect();
    match status {
        401 | 403 => ProxyError::Auth(summary),
        429 => ProxyError::RateLimit { retry_after: None },
        _ => ProxyError::Upstream {
            status,
            message: summary,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_classify_as_auth() {
        assert!(matches!(classify_status(401, "no"), ProxyError::Auth(_)));
        assert!(matches!(classify_status(403, "no"), ProxyError::Auth(_)));
    }

    #[test]
    fn rate_limit_classifies() {
        assert!(matches!(classify_status(429, ""), ProxyError::RateLimit { .. }));
    }

    #[test]
    fn server_errors_classify_as_upstream() {
        let err = classify_status(503, "overloaded");
        let ProxyError::Upstream { status, .. } = err else {
            panic!("expected upstream");
        };
        assert_eq!(status, 503);
    }
}
