//! Tool-call detection
//!
//! Three detectors run over a reply and their hits are unioned:
//! structural (family-specific tool-call fields), sliding-window textual
//! (literal framings like `Tool call: NAME({...})` and JSON fragments
//! embedded in prose), and the explicit tool_use marker on
//! Anthropic-shaped payloads. Callable tokens that are language builtins
//! are excluded to suppress false positives in quoted code.

use std::collections::HashSet;
use std::sync::LazyLock;

use manifold_config::CompatQuirks;
use regex::Regex;

use crate::family::FamilyResponse;
use crate::protocol::gemini::GeminiPart;

/// Sliding-window size in bytes
pub const WINDOW: usize = 300;
/// Overlap between adjacent windows in bytes
pub const OVERLAP: usize = 50;

/// Builtin callable tokens that never count as tool names
const BUILTINS: [&str; 6] = ["console", "json", "math", "array", "object", "string"];

/// The default literal framing for text-embedded calls
const DEFAULT_FRAMING: &str = "Tool call:";

/// JSON fragments that signal tool intent inside prose
static JSON_MARKERS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r#""type"\s*:\s*"tool_use""#).expect("valid marker pattern"),
        Regex::new(r#""functionCall"\s*:"#).expect("valid marker pattern"),
    ]
});

/// A callable context immediately before a match, e.g. `console.log("`
static CALLER_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)(?:\.[A-Za-z_][A-Za-z0-9_]*)*\s*\(\s*["']$"#)
        .expect("valid caller pattern")
});

/// One textual detector hit
#[derive(Debug, Clone)]
pub struct TextualHit {
    /// Parsed tool name; `None` for marker-only hits
    pub name: Option<String>,
    /// Parsed argument object; `None` for marker-only hits
    pub arguments: Option<serde_json::Value>,
    /// Byte span of the matched literal within its text block
    pub span: (usize, usize),
    /// Choice (or candidate) index the hit belongs to
    pub choice: usize,
    /// Part index within the candidate (Gemini); 0 elsewhere
    pub part: usize,
}

/// Union of the three detectors
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// A family-structural tool-call field is populated
    pub structural: bool,
    /// The payload already carries an explicit tool_use block
    pub explicit: bool,
    /// Textual hits in prose
    pub textual: Vec<TextualHit>,
}

impl Detection {
    /// Whether any detector fired
    pub fn any(&self) -> bool {
        self.structural || self.explicit || !self.textual.is_empty()
    }
}

/// Run all detectors over a family reply
pub fn detect(response: &FamilyResponse, quirks: &CompatQuirks) -> Detection {
    let mut detection = Detection::default();

    match response {
        FamilyResponse::OpenAi(reply) => {
            for (index, choice) in reply.choices.iter().enumerate() {
                if choice.message.tool_calls.as_ref().is_some_and(|c| !c.is_empty()) {
                    detection.structural = true;
                }
                if let Some(text) = &choice.message.content {
                    for mut hit in scan_text(text, &quirks.tool_call_literals) {
                        hit.choice = index;
                        detection.textual.push(hit);
                    }
                }
            }
        }
        FamilyResponse::Gemini(reply) => {
            for (index, candidate) in reply.candidates.iter().enumerate() {
                for (part_index, part) in candidate.content.parts.iter().enumerate() {
                    match part {
                        GeminiPart::FunctionCall(_) => detection.structural = true,
                        GeminiPart::Text(text) => {
                            for mut hit in scan_text(text, &quirks.tool_call_literals) {
                                hit.choice = index;
                                hit.part = part_index;
                                detection.textual.push(hit);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        FamilyResponse::CodeWhisperer(reply) => {
            if !reply.tool_uses.is_empty() {
                detection.structural = true;
                detection.explicit = true;
            }
            detection
                .textual
                .extend(scan_text(&reply.content, &quirks.tool_call_literals));
        }
    }

    detection
}

/// Scan a text span for embedded tool calls
///
/// Windows of `WINDOW` bytes with `OVERLAP` bytes of overlap locate the
/// framings; argument blobs are brace-matched against the full text so a
/// call whose JSON outgrows the window still parses. Hits are deduplicated
/// by span start.
pub fn scan_text(text: &str, extra_framings: &[String]) -> Vec<TextualHit> {
    let mut hits = Vec::new();
    let mut seen: HashSet<usize> = HashSet::new();

    let mut start = 0;
    loop {
        let end = floor_char_boundary(text, (start + WINDOW).min(text.len()));
        let window = &text[start..end];

        scan_window(text, window, start, extra_framings, &mut seen, &mut hits);

        if end >= text.len() {
            break;
        }
        start = floor_char_boundary(text, start + WINDOW - OVERLAP);
    }

    hits.sort_by_key(|h| h.span.0);
    hits
}

/// Scan a single window, pushing hits not already seen
fn scan_window(
    full: &str,
    window: &str,
    base: usize,
    extra_framings: &[String],
    seen: &mut HashSet<usize>,
    hits: &mut Vec<TextualHit>,
) {
    // Literal framings: the default plus any per-binding extras
    for framing in std::iter::once(DEFAULT_FRAMING).chain(extra_framings.iter().map(String::as_str)) {
        let mut cursor = 0;
        while let Some(found) = window[cursor..].find(framing) {
            let match_start = base + cursor + found;
            cursor += found + framing.len();

            if seen.contains(&match_start) {
                continue;
            }

            if let Some(hit) = parse_framed_call(full, match_start, framing) {
                if !suppressed(full, match_start, hit.name.as_deref()) {
                    seen.insert(match_start);
                    hits.push(hit);
                }
            }
        }
    }

    // JSON fragments signaling tool intent
    for marker in JSON_MARKERS.iter() {
        for found in marker.find_iter(window) {
            let match_start = base + found.start();
            if seen.contains(&match_start) {
                continue;
            }
            seen.insert(match_start);
            hits.push(parse_json_fragment(full, match_start, base + found.end()));
        }
    }
}

/// Parse `FRAMING name({json})` starting at `start` in the full text
fn parse_framed_call(text: &str, start: usize, framing: &str) -> Option<TextualHit> {
    let rest = &text[start + framing.len()..];
    let rest_offset = start + framing.len();

    // Skip whitespace, then read the callable name
    let name_start = rest_offset + rest.len() - rest.trim_start().len();
    let trimmed = rest.trim_start();
    let name_len = trimmed
        .char_indices()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_' || *c == '.')
        .last()
        .map(|(i, c)| i + c.len_utf8())?;
    let name = &trimmed[..name_len];
    if name.is_empty() || !name.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_') {
        return None;
    }

    // An opening paren, then a balanced JSON object, then the close paren
    let after_name = &text[name_start + name_len..];
    let paren = after_name.trim_start();
    if !paren.starts_with('(') {
        return None;
    }
    let paren_offset = name_start + name_len + (after_name.len() - paren.len());

    let brace_offset = paren_offset + 1 + text[paren_offset + 1..].len() - text[paren_offset + 1..].trim_start().len();
    if !text[brace_offset..].starts_with('{') {
        return None;
    }

    let (json_end, arguments) = match_balanced_json(text, brace_offset)?;

    let after_json = &text[json_end..];
    let close = after_json.trim_start();
    if !close.starts_with(')') {
        return None;
    }
    let span_end = json_end + (after_json.len() - close.len()) + 1;

    Some(TextualHit {
        name: Some(name.to_owned()),
        arguments: Some(arguments),
        span: (start, span_end),
        choice: 0,
        part: 0,
    })
}

/// Build a hit from a JSON marker fragment
///
/// Attempts to brace-match the enclosing object to extract a concrete
/// tool name and input; falls back to a marker-only hit.
fn parse_json_fragment(text: &str, marker_start: usize, marker_end: usize) -> TextualHit {
    // Walk back to the opening brace of the enclosing object
    let object_start = text[..marker_start].rfind('{');

    if let Some(object_start) = object_start
        && let Some((object_end, value)) = match_balanced_json(text, object_start)
    {
        let name = value
            .get("name")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .or_else(|| {
                value
                    .get("functionCall")
                    .and_then(|fc| fc.get("name"))
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned)
            });
        let arguments = value
            .get("input")
            .cloned()
            .or_else(|| value.get("functionCall").and_then(|fc| fc.get("args")).cloned());

        if let (Some(name), Some(arguments)) = (name, arguments) {
            return TextualHit {
                name: Some(name),
                arguments: Some(arguments),
                span: (object_start, object_end),
                choice: 0,
                part: 0,
            };
        }
    }

    TextualHit {
        name: None,
        arguments: None,
        span: (marker_start, marker_end),
        choice: 0,
        part: 0,
    }
}

/// Whether a match is a false positive to suppress
///
/// Two rules: the callable name itself is a language builtin, or the
/// match sits inside a quoted argument of a builtin call such as
/// `console.log("Tool call: ...")`.
fn suppressed(text: &str, match_start: usize, name: Option<&str>) -> bool {
    if let Some(name) = name {
        let root = name.split('.').next().unwrap_or(name);
        if BUILTINS.contains(&root.to_ascii_lowercase().as_str()) {
            return true;
        }
    }

    let prefix_start = floor_char_boundary(text, match_start.saturating_sub(48));
    let prefix = &text[prefix_start..match_start];
    if let Some(caps) = CALLER_PREFIX.captures(prefix) {
        let root = caps.get(1).map_or("", |m| m.as_str());
        if BUILTINS.contains(&root.to_ascii_lowercase().as_str()) {
            return true;
        }
    }

    false
}

/// Match a balanced JSON object starting at `start` (which must be `{`)
///
/// Returns the end offset (exclusive) and the parsed value. String
/// escapes are respected while counting braces.
fn match_balanced_json(text: &str, start: usize) -> Option<(usize, serde_json::Value)> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let end = offset + 1;
                    let value = serde_json::from_str(&text[start..end]).ok()?;
                    return Some((end, value));
                }
            }
            _ => {}
        }
    }

    None
}

/// Largest char boundary at or below `index`
fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_call_is_detected() {
        let hits = scan_text(r#"Tool call: search_web({"q":"x"})"#, &[]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name.as_deref(), Some("search_web"));
        assert_eq!(hits[0].arguments.as_ref().unwrap()["q"], "x");
        assert_eq!(hits[0].span.0, 0);
    }

    #[test]
    fn empty_args_still_detects() {
        let hits = scan_text("Tool call: f({})", &[]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name.as_deref(), Some("f"));
    }

    #[test]
    fn quoted_builtin_context_is_suppressed() {
        let hits = scan_text(r#"console.log("Tool call: f({})")"#, &[]);
        assert!(hits.is_empty());
    }

    #[test]
    fn builtin_callable_name_is_suppressed() {
        let hits = scan_text("Tool call: json({})", &[]);
        assert!(hits.is_empty());
    }

    #[test]
    fn json_tool_use_fragment_parses_name_and_input() {
        let text = r#"raw: {"type":"tool_use","name":"grep","input":{"pattern":"fn"}}"#;
        let hits = scan_text(text, &[]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name.as_deref(), Some("grep"));
        assert_eq!(hits[0].arguments.as_ref().unwrap()["pattern"], "fn");
    }

    #[test]
    fn function_call_fragment_is_detected() {
        let text = r#"{"functionCall":{"name":"lookup","args":{"q":1}}}"#;
        let hits = scan_text(text, &[]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name.as_deref(), Some("lookup"));
    }

    #[test]
    fn malformed_fragment_is_marker_only() {
        let text = r#"it printed "type":"tool_use" and stopped"#;
        let hits = scan_text(text, &[]);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].name.is_none());
    }

    #[test]
    fn extra_framings_from_config_match() {
        let extras = vec!["<<call>>".to_owned()];
        let hits = scan_text(r#"<<call>> ping({"host":"a"})"#, &extras);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name.as_deref(), Some("ping"));
    }

    #[test]
    fn long_text_with_call_past_first_window_is_found() {
        let padding = "x".repeat(500);
        let text = format!(r#"{padding} Tool call: late({{"k":1}})"#);
        let hits = scan_text(&text, &[]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name.as_deref(), Some("late"));
        assert_eq!(hits[0].span.0, 501);
    }

    #[test]
    fn arguments_larger_than_the_window_parse() {
        let big_value = "v".repeat(400);
        let text = format!(r#"Tool call: big({{"k":"{big_value}"}})"#);
        let hits = scan_text(&text, &[]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].arguments.as_ref().unwrap()["k"], big_value);
    }

    #[test]
    fn duplicate_windows_do_not_duplicate_hits() {
        // A call that falls inside the overlap of two windows
        let padding = "y".repeat(WINDOW - OVERLAP + 10);
        let text = format!(r#"{padding}Tool call: once({{"a":1}})"#);
        let hits = scan_text(&text, &[]);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn unbalanced_braces_do_not_match() {
        let hits = scan_text(r#"Tool call: broken({"q": "x")"#, &[]);
        assert!(hits.is_empty());
    }
}
