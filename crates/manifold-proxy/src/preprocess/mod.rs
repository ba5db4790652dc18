//! Response preprocessor
//!
//! Presents a consistent, tool-aware reply regardless of provider
//! peculiarities. Order of operations: abnormal-response classification
//! first, then tool-call detection (structural, textual, explicit),
//! then text-embedded call reshaping, then termination-signal
//! normalization. When no detector fires, the termination field is
//! never touched.

mod classify;
mod detect;
mod normalize;
mod reshape;
mod scanner;

use manifold_config::{CompatQuirks, PreprocessingConfig, ProviderKind};
use manifold_core::ProxyError;

pub use detect::{Detection, TextualHit, scan_text};
pub use reshape::synth_tool_id;
pub use scanner::StreamScanner;

use crate::family::{FamilyResponse, ProviderFamily};

/// What the preprocessor did to a reply
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairReport {
    /// Whether any detector found tool intent
    pub tool_intent: bool,
    /// Text-embedded calls reshaped into structured blocks
    pub reshaped: u32,
    /// Whether the termination field was rewritten
    pub normalized: bool,
}

/// The response preprocessor, built once per proxy
#[derive(Debug, Clone)]
pub struct Preprocessor {
    repair_enabled: bool,
    normalize_enabled: bool,
    classify_enabled: bool,
}

impl Preprocessor {
    /// Build from the preprocessing configuration
    pub fn new(config: &PreprocessingConfig) -> Self {
        Self {
            repair_enabled: config.processor_enabled("tool_call_repair"),
            normalize_enabled: config.processor_enabled("termination_normalize"),
            classify_enabled: config.processor_enabled("abnormal_classify"),
        }
    }

    /// A preprocessor with every processor on (tests, embedded use)
    pub fn all_enabled() -> Self {
        Self {
            repair_enabled: true,
            normalize_enabled: true,
            classify_enabled: true,
        }
    }

    /// Run the full repair sequence on a complete reply
    ///
    /// Idempotent: running it twice yields the same reply as once.
    ///
    /// # Errors
    ///
    /// Returns the abnormal-response classification when the reply is
    /// empty, carries an error body, or (for tagged Qwen/ModelScope
    /// servers) omits its termination field entirely.
    pub fn run(
        &self,
        family: ProviderFamily,
        kind: ProviderKind,
        quirks: &CompatQuirks,
        response: &mut FamilyResponse,
    ) -> Result<RepairReport, ProxyError> {
        if self.classify_enabled {
            classify::classify(kind, quirks, response)?;
        }

        let mut report = RepairReport::default();

        let detection = detect::detect(response, quirks);
        report.tool_intent = detection.any();

        if !report.tool_intent {
            // No detector fired: the termination field is left alone
            return Ok(report);
        }

        if self.repair_enabled && !detection.structural {
            report.reshaped = reshape::reshape_text_calls(response, &detection.textual);
        }

        if self.normalize_enabled {
            report.normalized = normalize::force_tool_termination(family, response);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::openai::{OpenAiChoice, OpenAiChoiceMessage, OpenAiFunctionCall, OpenAiResponse, OpenAiToolCall};

    fn quirkless() -> CompatQuirks {
        CompatQuirks::default()
    }

    fn openai_reply(content: Option<&str>, tool_calls: Option<Vec<OpenAiToolCall>>, finish: &str) -> FamilyResponse {
        FamilyResponse::OpenAi(OpenAiResponse {
            id: "chatcmpl-1".to_owned(),
            object: "chat.completion".to_owned(),
            created: 0,
            model: "gpt-4o".to_owned(),
            choices: vec![OpenAiChoice {
                index: 0,
                message: OpenAiChoiceMessage {
                    role: "assistant".to_owned(),
                    content: content.map(str::to_owned),
                    tool_calls,
                },
                finish_reason: Some(Some(finish.to_owned())),
            }],
            usage: None,
        })
    }

    fn tool_call() -> OpenAiToolCall {
        OpenAiToolCall {
            id: "call_1".to_owned(),
            tool_type: "function".to_owned(),
            function: OpenAiFunctionCall {
                name: "search_web".to_owned(),
                arguments: r#"{"q":"x"}"#.to_owned(),
            },
        }
    }

    #[test]
    fn structural_tool_call_forces_terminator() {
        let pre = Preprocessor::all_enabled();
        let mut reply = openai_reply(None, Some(vec![tool_call()]), "end_turn");

        let report = pre
            .run(ProviderFamily::OpenAi, ProviderKind::Openai, &quirkless(), &mut reply)
            .unwrap();

        assert!(report.tool_intent);
        assert!(report.normalized);
        let FamilyResponse::OpenAi(wire) = &reply else { unreachable!() };
        assert_eq!(wire.choices[0].finish_reason, Some(Some("tool_calls".to_owned())));
        // The structural call is preserved
        assert_eq!(wire.choices[0].message.tool_calls.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn repair_is_idempotent() {
        let pre = Preprocessor::all_enabled();
        let mut reply = openai_reply(
            Some(r#"Tool call: search_web({"q":"x"})"#),
            None,
            "stop",
        );

        pre.run(ProviderFamily::OpenAi, ProviderKind::Openai, &quirkless(), &mut reply)
            .unwrap();
        let after_once = serde_json::to_string(&match &reply {
            FamilyResponse::OpenAi(w) => w.clone(),
            _ => unreachable!(),
        })
        .unwrap();

        pre.run(ProviderFamily::OpenAi, ProviderKind::Openai, &quirkless(), &mut reply)
            .unwrap();
        let after_twice = serde_json::to_string(&match &reply {
            FamilyResponse::OpenAi(w) => w.clone(),
            _ => unreachable!(),
        })
        .unwrap();

        assert_eq!(after_once, after_twice);
    }

    #[test]
    fn no_intent_leaves_terminator_untouched() {
        let pre = Preprocessor::all_enabled();
        let mut reply = openai_reply(Some("just words"), None, "stop");

        let report = pre
            .run(ProviderFamily::OpenAi, ProviderKind::Openai, &quirkless(), &mut reply)
            .unwrap();

        assert!(!report.tool_intent);
        let FamilyResponse::OpenAi(wire) = &reply else { unreachable!() };
        assert_eq!(wire.choices[0].finish_reason, Some(Some("stop".to_owned())));
    }

    #[test]
    fn text_embedded_call_is_reshaped() {
        let pre = Preprocessor::all_enabled();
        let mut reply = openai_reply(
            Some(r#"Let me look. Tool call: search_web({"q":"x"}) done."#),
            None,
            "stop",
        );

        let report = pre
            .run(ProviderFamily::OpenAi, ProviderKind::Openai, &quirkless(), &mut reply)
            .unwrap();

        assert_eq!(report.reshaped, 1);
        let FamilyResponse::OpenAi(wire) = &reply else { unreachable!() };
        let message = &wire.choices[0].message;

        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "search_web");
        assert!(calls[0].id.starts_with("toolu_"));
        assert_eq!(wire.choices[0].finish_reason, Some(Some("tool_calls".to_owned())));

        // The literal span is excised; surrounding text survives
        let text = message.content.as_deref().unwrap();
        assert!(!text.contains("Tool call:"));
        assert!(text.contains("Let me look."));
        assert!(text.contains("done."));
    }
}
