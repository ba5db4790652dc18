//! Abnormal-response classification
//!
//! Runs before the detectors. Error envelopes and HTTP statuses are
//! already rejected at the protocol/server stages; what reaches this
//! point is a parsed success shape that may still be unusable.

use manifold_config::{CompatQuirks, ProviderKind};
use manifold_core::ProxyError;

use crate::family::FamilyResponse;

/// Families of servers known to omit `finish_reason` entirely
const MISSING_FINISH_FAMILIES: [&str; 2] = ["qwen", "modelscope"];

/// Reject replies that cannot be repaired
///
/// # Errors
///
/// `ProxyError::EmptyResponse` when the reply carries no content at all;
/// `ProxyError::MissingFinishReason` when a tagged Qwen/ModelScope
/// server returned a message with no `finish_reason` field.
pub fn classify(kind: ProviderKind, quirks: &CompatQuirks, response: &FamilyResponse) -> Result<(), ProxyError> {
    match response {
        FamilyResponse::OpenAi(reply) => {
            if reply.choices.is_empty() {
                return Err(ProxyError::EmptyResponse);
            }

            // The known defect shows on the first choice only
            if kind == ProviderKind::OpenaiCompat
                && is_missing_finish_family(quirks)
                && let Some(first) = reply.choices.first()
                // Outer None means the field was absent, not null
                && first.finish_reason.is_none()
            {
                return Err(ProxyError::MissingFinishReason);
            }
        }
        FamilyResponse::Gemini(reply) => {
            if reply.candidates.is_empty() {
                return Err(ProxyError::EmptyResponse);
            }
        }
        FamilyResponse::CodeWhisperer(reply) => {
            if reply.content.is_empty() && reply.tool_uses.is_empty() {
                return Err(ProxyError::EmptyResponse);
            }
        }
    }

    Ok(())
}

/// Whether the binding's family tag marks a missing-finish-reason server
fn is_missing_finish_family(quirks: &CompatQuirks) -> bool {
    quirks
        .model_family
        .as_deref()
        .is_some_and(|family| MISSING_FINISH_FAMILIES.contains(&family.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::openai::{OpenAiChoice, OpenAiChoiceMessage, OpenAiResponse};

    fn reply(finish_reason: Option<Option<String>>) -> FamilyResponse {
        FamilyResponse::OpenAi(OpenAiResponse {
            id: "r".to_owned(),
            object: "chat.completion".to_owned(),
            created: 0,
            model: "qwen2.5".to_owned(),
            choices: vec![OpenAiChoice {
                index: 0,
                message: OpenAiChoiceMessage {
                    role: "assistant".to_owned(),
                    content: Some("hi".to_owned()),
                    tool_calls: None,
                },
                finish_reason,
            }],
            usage: None,
        })
    }

    fn qwen_quirks() -> CompatQuirks {
        CompatQuirks {
            model_family: Some("qwen".to_owned()),
            tool_call_literals: Vec::new(),
        }
    }

    #[test]
    fn empty_choices_is_empty_response() {
        let empty = FamilyResponse::OpenAi(OpenAiResponse {
            id: "r".to_owned(),
            object: String::new(),
            created: 0,
            model: String::new(),
            choices: Vec::new(),
            usage: None,
        });
        let err = classify(ProviderKind::Openai, &CompatQuirks::default(), &empty).unwrap_err();
        assert!(matches!(err, ProxyError::EmptyResponse));
    }

    #[test]
    fn qwen_without_finish_reason_field_errors() {
        let err = classify(ProviderKind::OpenaiCompat, &qwen_quirks(), &reply(None)).unwrap_err();
        assert!(matches!(err, ProxyError::MissingFinishReason));
    }

    #[test]
    fn qwen_with_null_finish_reason_passes() {
        classify(ProviderKind::OpenaiCompat, &qwen_quirks(), &reply(Some(None))).unwrap();
    }

    #[test]
    fn only_the_first_choice_is_checked() {
        // First choice carries a finish_reason; a later choice without
        // one does not make the reply abnormal
        let FamilyResponse::OpenAi(mut wire) = reply(Some(Some("stop".to_owned()))) else {
            unreachable!()
        };
        wire.choices.push(OpenAiChoice {
            index: 1,
            message: OpenAiChoiceMessage {
                role: "assistant".to_owned(),
                content: Some("second".to_owned()),
                tool_calls: None,
            },
            finish_reason: None,
        });

        classify(ProviderKind::OpenaiCompat, &qwen_quirks(), &FamilyResponse::OpenAi(wire)).unwrap();
    }

    #[test]
    fn untagged_server_without_finish_reason_passes() {
        classify(ProviderKind::OpenaiCompat, &CompatQuirks::default(), &reply(None)).unwrap();
    }

    #[test]
    fn canonical_openai_is_not_subject_to_the_check() {
        classify(ProviderKind::Openai, &qwen_quirks(), &reply(None)).unwrap();
    }
}
