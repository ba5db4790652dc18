//! Termination-signal normalization
//!
//! When tool intent was detected, the family's termination field is
//! forced to its tool-call value. Callers must not invoke this when no
//! detector fired; the no-intent case never rewrites anything.

use crate::family::{FamilyResponse, ProviderFamily};

/// Force the termination field to the family's tool-call value
///
/// Returns whether any field actually changed, which makes repeated
/// application a no-op.
pub fn force_tool_termination(family: ProviderFamily, response: &mut FamilyResponse) -> bool {
    let terminator = family.tool_terminator();
    let mut changed = false;

    match response {
        FamilyResponse::OpenAi(reply) => {
            for choice in &mut reply.choices {
                if choice.finish_reason.as_ref().and_then(Option::as_deref) != Some(terminator) {
                    choice.finish_reason = Some(Some(terminator.to_owned()));
                    changed = true;
                }
            }
        }
        FamilyResponse::Gemini(reply) => {
            for candidate in &mut reply.candidates {
                if candidate.finish_reason.as_deref() != Some(terminator) {
                    candidate.finish_reason = Some(terminator.to_owned());
                    changed = true;
                }
            }
        }
        FamilyResponse::CodeWhisperer(reply) => {
            if reply.stop_reason.as_deref() != Some(terminator) {
                reply.stop_reason = Some(terminator.to_owned());
                changed = true;
            }
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codewhisperer::CwReply;
    use crate::protocol::gemini::{GeminiCandidate, GeminiContent, GeminiPart, GeminiResponse};

    fn gemini_reply(finish: Option<&str>) -> FamilyResponse {
        FamilyResponse::Gemini(GeminiResponse {
            candidates: vec![GeminiCandidate {
                content: GeminiContent {
                    role: Some("model".to_owned()),
                    parts: vec![GeminiPart::Text("hi".to_owned())],
                },
                finish_reason: finish.map(str::to_owned),
                index: Some(0),
            }],
            usage_metadata: None,
        })
    }

    #[test]
    fn gemini_terminator_is_rewritten() {
        let mut reply = gemini_reply(Some("STOP"));
        assert!(force_tool_termination(ProviderFamily::Gemini, &mut reply));
        let FamilyResponse::Gemini(wire) = &reply else { unreachable!() };
        assert_eq!(wire.candidates[0].finish_reason.as_deref(), Some("FUNCTION_CALL"));
    }

    #[test]
    fn second_application_changes_nothing() {
        let mut reply = gemini_reply(Some("STOP"));
        assert!(force_tool_termination(ProviderFamily::Gemini, &mut reply));
        assert!(!force_tool_termination(ProviderFamily::Gemini, &mut reply));
    }

    #[test]
    fn codewhisperer_uses_anthropic_value() {
        let mut reply = FamilyResponse::CodeWhisperer(CwReply {
            content: "x".to_owned(),
            tool_uses: Vec::new(),
            stop_reason: Some("end_turn".to_owned()),
        });
        force_tool_termination(ProviderFamily::CodeWhisperer, &mut reply);
        let FamilyResponse::CodeWhisperer(wire) = &reply else { unreachable!() };
        assert_eq!(wire.stop_reason.as_deref(), Some("tool_use"));
    }
}
