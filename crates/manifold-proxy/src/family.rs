//! Provider families and the family-schema payload enums
//!
//! A family groups providers sharing a wire schema. The set is closed;
//! local OpenAI-compatible servers reuse the OpenAI wire types but keep
//! their own family tag because the compat stage treats them
//! differently (nonstandard tool-call framings, missing fields).

use manifold_config::ProviderKind;
use serde::{Deserialize, Serialize};

use crate::protocol::codewhisperer::{CwReply, CwRequest};
use crate::protocol::gemini::{GeminiRequest, GeminiResponse};
use crate::protocol::openai::{OpenAiRequest, OpenAiResponse};

/// Wire-schema family a provider belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// OpenAI chat-completions
    OpenAi,
    /// Google Gemini generateContent
    Gemini,
    /// AWS CodeWhisperer conversation API (Anthropic-shaped payloads)
    CodeWhisperer,
    /// Local OpenAI-compatible server
    OpenAiCompat,
}

impl From<ProviderKind> for ProviderFamily {
    fn from(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Openai => Self::OpenAi,
            ProviderKind::Gemini => Self::Gemini,
            ProviderKind::Codewhisperer => Self::CodeWhisperer,
            ProviderKind::OpenaiCompat => Self::OpenAiCompat,
        }
    }
}

impl ProviderFamily {
    /// Termination value that signals a tool call in this family
    pub const fn tool_terminator(self) -> &'static str {
        match self {
            Self::OpenAi | Self::OpenAiCompat => "tool_calls",
            Self::Gemini => "FUNCTION_CALL",
            Self::CodeWhisperer => "tool_use",
        }
    }

    /// Name of the termination field in this family's replies
    pub const fn termination_field(self) -> &'static str {
        match self {
            Self::OpenAi | Self::OpenAiCompat => "finish_reason",
            Self::Gemini => "finishReason",
            Self::CodeWhisperer => "stop_reason",
        }
    }
}

/// Request in a provider family's schema
#[derive(Debug, Clone)]
pub enum FamilyRequest {
    /// OpenAI-family request (also used by openai_compat)
    OpenAi(OpenAiRequest),
    /// Gemini request
    Gemini(GeminiRequest),
    /// CodeWhisperer conversation request
    CodeWhisperer(CwRequest),
}

/// Complete (non-streamed) reply in a provider family's schema
#[derive(Debug, Clone)]
pub enum FamilyResponse {
    /// OpenAI-family reply (also used by openai_compat)
    OpenAi(OpenAiResponse),
    /// Gemini reply
    Gemini(GeminiResponse),
    /// CodeWhisperer reply
    CodeWhisperer(CwReply),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_family() {
        assert_eq!(ProviderFamily::from(ProviderKind::Openai), ProviderFamily::OpenAi);
        assert_eq!(
            ProviderFamily::from(ProviderKind::OpenaiCompat),
            ProviderFamily::OpenAiCompat
        );
    }

    #[test]
    fn terminators_per_family() {
        assert_eq!(ProviderFamily::OpenAi.tool_terminator(), "tool_calls");
        assert_eq!(ProviderFamily::Gemini.tool_terminator(), "FUNCTION_CALL");
        assert_eq!(ProviderFamily::CodeWhisperer.tool_terminator(), "tool_use");
    }
}
