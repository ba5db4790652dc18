use std::time::Instant;

use tokio_util::sync::CancellationToken;

/// Runtime context carried by every request task
///
/// Each client request runs as one independent task; the token is
/// cancelled when the client connection goes away, and every suspension
/// point in the pipeline observes it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Opaque request identifier assigned at ingress
    pub request_id: String,
    /// Cancellation signal for this request
    pub cancel: CancellationToken,
    /// When the request entered the proxy
    pub received_at: Instant,
}

impl RequestContext {
    /// Create a context with a fresh request id
    pub fn new() -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            cancel: CancellationToken::new(),
            received_at: Instant::now(),
        }
    }

    /// Whether the client has gone away
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
