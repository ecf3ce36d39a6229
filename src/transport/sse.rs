//! AWS Event Stream payload scanner.
//!
//! Kiro's upstream emits a binary framed envelope whose payload is JSON text.
//! This module does not decode the binary framing itself (that happens at the
//! byte layer below); it scans the decoded text for recognised JSON event
//! prefixes and extracts each complete object with a string-aware brace
//! counter, buffering any trailing partial object until more bytes arrive.

use tracing::trace;

use crate::models::kiro::KiroStreamEvent;

const CONTENT_PATTERN: &str = r#"{"content":"#;
const TOOL_NAME_PATTERN: &str = r#"{"name":"#;
const TOOL_INPUT_PATTERN: &str = r#"{"input":"#;
const STOP_PATTERN: &str = r#"{"stop":"#;
const FOLLOWUP_PROMPT_PATTERN: &str = r#"{"followupPrompt":"#;
const USAGE_PATTERN: &str = r#"{"usage":"#;
const CONTEXT_USAGE_PATTERN: &str = r#"{"contextUsagePercentage":"#;

const RECOGNISED_PATTERNS: &[&str] = &[
    CONTENT_PATTERN,
    TOOL_NAME_PATTERN,
    TOOL_INPUT_PATTERN,
    STOP_PATTERN,
    FOLLOWUP_PROMPT_PATTERN,
    USAGE_PATTERN,
    CONTEXT_USAGE_PATTERN,
];

/// Incrementally scans decoded stream text for complete JSON event objects.
///
/// Callers feed decoded text as it arrives; the scanner holds back any
/// trailing incomplete object until the next feed completes it.
#[derive(Default)]
pub struct StreamScanner {
    buffer: String,
}

impl StreamScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly decoded text, returning every event fully contained in the
    /// accumulated buffer.
    pub fn feed(&mut self, text: &str) -> Vec<KiroStreamEvent> {
        self.buffer.push_str(text);
        let mut events = Vec::new();

        loop {
            let Some((pattern_start, pattern)) = earliest_pattern_match(&self.buffer) else {
                break;
            };

            let Some(end) = find_matching_brace(&self.buffer, pattern_start) else {
                // Incomplete object at the tail: keep everything from the
                // pattern onward and wait for more bytes.
                if pattern_start > 0 {
                    self.buffer.drain(..pattern_start);
                }
                break;
            };

            let object = self.buffer[pattern_start..=end].to_string();
            self.buffer.drain(..=end);

            if let Some(event) = parse_object(pattern, &object) {
                events.push(event);
            } else {
                trace!(pattern, "Recognised prefix but object failed to parse");
            }
        }

        events
    }

    /// Any bytes still buffered (e.g. because the stream ended mid-object).
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

fn earliest_pattern_match(buffer: &str) -> Option<(usize, &'static str)> {
    RECOGNISED_PATTERNS
        .iter()
        .filter_map(|p| buffer.find(p).map(|idx| (idx, *p)))
        .min_by_key(|(idx, _)| *idx)
}

/// Locate the index of the `}` matching the `{` at `start`, counting braces
/// only outside double-quoted strings and honouring `\`-escapes.
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut idx = start;

    while idx < bytes.len() {
        let b = bytes[idx];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(idx);
                    }
                }
                _ => {}
            }
        }
        idx += 1;
    }
    None
}

fn parse_object(pattern: &str, object: &str) -> Option<KiroStreamEvent> {
    match pattern {
        CONTENT_PATTERN => {
            let data: serde_json::Value = serde_json::from_str(object).ok()?;
            let content = data.get("content")?.as_str()?;
            Some(KiroStreamEvent::Content(content.to_string()))
        }
        TOOL_NAME_PATTERN => {
            let data: serde_json::Value = serde_json::from_str(object).ok()?;
            let name = data.get("name")?.as_str()?.to_string();
            let tool_use_id = data
                .get("toolUseId")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let input = data.get("input").map(|v| v.to_string()).unwrap_or_default();
            Some(KiroStreamEvent::ToolStart {
                name,
                tool_use_id,
                input,
            })
        }
        TOOL_INPUT_PATTERN => {
            let data: serde_json::Value = serde_json::from_str(object).ok()?;
            let input = data.get("input")?.as_str()?.to_string();
            Some(KiroStreamEvent::ToolInput(input))
        }
        STOP_PATTERN => Some(KiroStreamEvent::ToolStop),
        FOLLOWUP_PROMPT_PATTERN => None,
        USAGE_PATTERN => {
            let data: serde_json::Value = serde_json::from_str(object).ok()?;
            let usage = data.get("usage")?.clone();
            Some(KiroStreamEvent::Usage(usage))
        }
        CONTEXT_USAGE_PATTERN => {
            let data: serde_json::Value = serde_json::from_str(object).ok()?;
            let pct = data.get("contextUsagePercentage")?.as_f64()?;
            Some(KiroStreamEvent::ContextUsage(pct))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feeds_content_event_in_one_shot() {
        let mut scanner = StreamScanner::new();
        let events = scanner.feed(r#"{"content":"Hello"}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], KiroStreamEvent::Content(t) if t == "Hello"));
    }

    #[test]
    fn holds_back_incomplete_object_across_feeds() {
        let mut scanner = StreamScanner::new();
        assert!(scanner.feed(r#"{"content":"Hel"#).is_empty());
        let events = scanner.feed(r#"lo"}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], KiroStreamEvent::Content(t) if t == "Hello"));
    }

    #[test]
    fn brace_counting_ignores_braces_inside_strings() {
        let mut scanner = StreamScanner::new();
        let events = scanner.feed(r#"{"content":"a { b } c"}{"stop":true}"#);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], KiroStreamEvent::Content(t) if t == "a { b } c"));
        assert!(matches!(&events[1], KiroStreamEvent::ToolStop));
    }

    #[test]
    fn honours_escaped_quotes_inside_strings() {
        let mut scanner = StreamScanner::new();
        let events = scanner.feed(r#"{"content":"she said \"hi\""}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], KiroStreamEvent::Content(t) if t == r#"she said "hi""#));
    }

    #[test]
    fn followup_prompt_is_recognised_and_ignored() {
        let mut scanner = StreamScanner::new();
        let events = scanner.feed(r#"{"followupPrompt":"next?"}{"content":"ok"}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], KiroStreamEvent::Content(t) if t == "ok"));
    }

    #[test]
    fn tool_start_and_input_parse() {
        let mut scanner = StreamScanner::new();
        let events =
            scanner.feed(r#"{"name":"get_weather","toolUseId":"t1","input":""}{"input":"{\"city\""}"#);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], KiroStreamEvent::ToolStart { name, .. } if name == "get_weather"));
        assert!(matches!(&events[1], KiroStreamEvent::ToolInput(_)));
    }

    #[test]
    fn ignores_unrecognised_prefixes_between_events() {
        let mut scanner = StreamScanner::new();
        let events = scanner.feed(r#"X{"content":"a{b}"}Y{"content":"a{b}"}Z"#);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], KiroStreamEvent::Content(t) if t == "a{b}"));
        assert!(matches!(&events[1], KiroStreamEvent::Content(t) if t == "a{b}"));
        assert_eq!(scanner.pending(), "Z");
    }

    #[test]
    fn matching_brace_skips_nested_braces_inside_string_value() {
        assert_eq!(find_matching_brace(r#"{"a": "{}"}"#, 0), Some(10));
    }
}
