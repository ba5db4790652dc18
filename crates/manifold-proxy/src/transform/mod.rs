//! Transformer stage: client schema <-> provider-family schema
//!
//! One implementation per family, a closed set. Transformers preserve
//! block sequencing and tool-use ids so later tool-result messages can
//! be correlated; a construct that cannot be translated raises a
//! structured `TransformError` rather than being dropped.

mod codewhisperer;
mod gemini;
mod openai;

use manifold_core::ProxyError;

use crate::family::{FamilyRequest, FamilyResponse, ProviderFamily};
use crate::types::{ChatRequest, ChatResponse};

pub use codewhisperer::CwTransformer;
pub use gemini::GeminiTransformer;
pub use openai::OpenAiTransformer;

/// The transformer stage contract
pub trait Transformer: Send + Sync {
    /// Family this transformer targets
    fn family(&self) -> ProviderFamily;

    /// Convert a client request into the family schema
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Transform` for constructs the family cannot
    /// express.
    fn to_family(&self, request: &ChatRequest) -> Result<FamilyRequest, ProxyError>;

    /// Convert a family reply into the client schema
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Transform` when the reply cannot be
    /// represented in the client schema.
    fn to_client(&self, response: FamilyResponse, model: &str) -> Result<ChatResponse, ProxyError>;
}

/// Build the transformer for a family
pub fn transformer_for(family: ProviderFamily) -> Box<dyn Transformer> {
    match family {
        ProviderFamily::OpenAi | ProviderFamily::OpenAiCompat => Box::new(OpenAiTransformer::new(family)),
        ProviderFamily::Gemini => Box::new(GeminiTransformer),
        ProviderFamily::CodeWhisperer => Box::new(CwTransformer),
    }
}

/// Error for a family payload handed to the wrong transformer
pub(crate) fn wrong_family(stage: &'static str) -> ProxyError {
    ProxyError::Transform {
        stage,
        message: "payload belongs to a different provider family".to_owned(),
    }
}
