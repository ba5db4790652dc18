//! Text-embedded tool-call reshaping
//!
//! When textual detection found a call but no structural one, the
//! matched literal span is excised from its text block and a structured
//! tool-call block is synthesized in its place, with a fresh
//! `toolu_<timestamp>_<random>` id. Surrounding text is left intact.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::family::FamilyResponse;
use crate::preprocess::detect::TextualHit;
use crate::protocol::codewhisperer::CwToolUse;
use crate::protocol::gemini::{GeminiFunctionCall, GeminiPart};
use crate::protocol::openai::{OpenAiFunctionCall, OpenAiToolCall};

/// Mint a fresh synthesized tool-call id
pub fn synth_tool_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let random = u32::from(rand::random::<u16>());
    format!("toolu_{timestamp}_{random:04x}")
}

/// Reshape textual hits into structured tool calls
///
/// Hits without a parsed name and argument object only signal intent and
/// are skipped. Returns the number of calls synthesized.
pub fn reshape_text_calls(response: &mut FamilyResponse, hits: &[TextualHit]) -> u32 {
    let mut reshaped = 0;

    // Excise right-to-left so earlier spans stay valid; skip overlaps
    let mut ordered: Vec<&TextualHit> = hits
        .iter()
        .filter(|h| h.name.is_some() && h.arguments.is_some())
        .collect();
    ordered.sort_by_key(|h| std::cmp::Reverse(h.span.0));

    let mut last_excised_start = usize::MAX;

    for hit in ordered {
        if hit.span.1 > last_excised_start {
            continue;
        }
        if apply_hit(response, hit) {
            last_excised_start = hit.span.0;
            reshaped += 1;
        }
    }

    reshaped
}

/// Apply one hit to the reply; returns whether it landed
fn apply_hit(response: &mut FamilyResponse, hit: &TextualHit) -> bool {
    let name = hit.name.clone().expect("filtered");
    let arguments = hit.arguments.clone().expect("filtered");

    match response {
        FamilyResponse::OpenAi(reply) => {
            let Some(choice) = reply.choices.get_mut(hit.choice) else {
                return false;
            };
            let Some(text) = choice.message.content.as_mut() else {
                return false;
            };
            if !excise(text, hit.span) {
                return false;
            }
            if text.trim().is_empty() {
                choice.message.content = None;
            }
            choice
                .message
                .tool_calls
                .get_or_insert_with(Vec::new)
                .push(OpenAiToolCall {
                    id: synth_tool_id(),
                    tool_type: "function".to_owned(),
                    function: OpenAiFunctionCall {
                        name,
                        arguments: arguments.to_string(),
                    },
                });
            true
        }
        FamilyResponse::Gemini(reply) => {
            let Some(candidate) = reply.candidates.get_mut(hit.choice) else {
                return false;
            };
            let Some(GeminiPart::Text(text)) = candidate.content.parts.get_mut(hit.part) else {
                return false;
            };
            if !excise(text, hit.span) {
                return false;
            }
            candidate
                .content
                .parts
                .push(GeminiPart::FunctionCall(GeminiFunctionCall { name, args: arguments }));
            true
        }
        FamilyResponse::CodeWhisperer(reply) => {
            if !excise(&mut reply.content, hit.span) {
                return false;
            }
            reply.tool_uses.push(CwToolUse {
                tool_use_id: synth_tool_id(),
                name,
                input: arguments,
            });
            true
        }
    }
}

/// Remove `span` from `text`, collapsing the doubled space it leaves
fn excise(text: &mut String, span: (usize, usize)) -> bool {
    let (start, end) = span;
    if end > text.len() || !text.is_char_boundary(start) || !text.is_char_boundary(end) {
        return false;
    }
    text.replace_range(start..end, "");

    // A removed call usually leaves "  " where " X " was
    if start > 0
        && start < text.len()
        && text.as_bytes()[start - 1] == b' '
        && text.as_bytes()[start] == b' '
    {
        text.remove(start);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::detect::scan_text;
    use crate::protocol::openai::{OpenAiChoice, OpenAiChoiceMessage, OpenAiResponse};

    fn openai_text_reply(text: &str) -> FamilyResponse {
        FamilyResponse::OpenAi(OpenAiResponse {
            id: "r".to_owned(),
            object: "chat.completion".to_owned(),
            created: 0,
            model: "m".to_owned(),
            choices: vec![OpenAiChoice {
                index: 0,
                message: OpenAiChoiceMessage {
                    role: "assistant".to_owned(),
                    content: Some(text.to_owned()),
                    tool_calls: None,
                },
                finish_reason: Some(Some("stop".to_owned())),
            }],
            usage: None,
        })
    }

    #[test]
    fn synthesized_ids_have_the_expected_shape() {
        let id = synth_tool_id();
        assert!(id.starts_with("toolu_"));
        assert_eq!(id.split('_').count(), 3);
    }

    #[test]
    fn reshaping_excises_span_and_adds_call() {
        let text = r#"before Tool call: search_web({"q":"x"}) after"#;
        let mut reply = openai_text_reply(text);
        let hits = scan_text(text, &[]);

        let count = reshape_text_calls(&mut reply, &hits);
        assert_eq!(count, 1);

        let FamilyResponse::OpenAi(wire) = &reply else { unreachable!() };
        let message = &wire.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("before after"));

        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "search_web");
        let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["q"], "x");
    }

    #[test]
    fn call_only_text_becomes_none() {
        let text = r#"Tool call: f({})"#;
        let mut reply = openai_text_reply(text);
        let hits = scan_text(text, &[]);

        reshape_text_calls(&mut reply, &hits);

        let FamilyResponse::OpenAi(wire) = &reply else { unreachable!() };
        assert_eq!(wire.choices[0].message.content, None);
    }

    #[test]
    fn marker_only_hits_do_not_reshape() {
        let text = r#"the server said "type":"tool_use" somewhere"#;
        let mut reply = openai_text_reply(text);
        let hits = scan_text(text, &[]);
        assert!(!hits.is_empty());

        let count = reshape_text_calls(&mut reply, &hits);
        assert_eq!(count, 0);

        let FamilyResponse::OpenAi(wire) = &reply else { unreachable!() };
        assert_eq!(wire.choices[0].message.content.as_deref(), Some(text));
    }

    #[test]
    fn two_calls_reshape_independently() {
        let text = r#"Tool call: a({"n":1}) and Tool call: b({"n":2})"#;
        let mut reply = openai_text_reply(text);
        let hits = scan_text(text, &[]);

        let count = reshape_text_calls(&mut reply, &hits);
        assert_eq!(count, 2);

        let FamilyResponse::OpenAi(wire) = &reply else { unreachable!() };
        let calls = wire.choices[0].message.tool_calls.as_ref().unwrap();
        let names: Vec<&str> = calls.iter().map(|c| c.function.name.as_str()).collect();
        assert!(names.contains(&"a") && names.contains(&"b"));
    }
}
