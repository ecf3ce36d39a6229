//! Stream Transcoder (C8): first-token watchdog plus framing translation
//! from raw Kiro stream events into downstream chunks.

use std::time::Duration;

use regex_lite::Regex;
use tracing::{debug, warn};

use crate::config::{FIRST_TOKEN_TIMEOUT, MAX_RETRIES, STREAMING_READ_TIMEOUT};
use crate::error::{Error, Result};
use crate::models::kiro::KiroStreamEvent;

/// One frame handed to the downstream surface.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamFrame {
    /// A chunk of assistant text.
    TextDelta(String),
    /// A completed tool call.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// Token usage counters, if the upstream reported them.
    Usage { input_tokens: u32, output_tokens: u32 },
    /// Context-window usage gauge.
    ContextUsage(f64),
}

struct PendingTool {
    id: String,
    name: String,
    input: String,
}

/// Assembles raw [`KiroStreamEvent`]s into [`DownstreamFrame`]s.
///
/// Owns the tool-call state machine, the content-dedup check, and the
/// textual `[Called name with args: {...}]` fallback scan run once at the
/// end of the stream.
pub struct Transcoder {
    pending_tool: Option<PendingTool>,
    finished_tools: Vec<(String, String, String)>,
    last_content: Option<String>,
    full_text: String,
    input_tokens: u32,
    output_tokens: u32,
    next_tool_id: u64,
}

impl Transcoder {
    pub fn new() -> Self {
        Self {
            pending_tool: None,
            finished_tools: Vec::new(),
            last_content: None,
            full_text: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            next_tool_id: 0,
        }
    }

    /// Feed one raw stream event, producing zero or more downstream frames.
    pub fn ingest(&mut self, event: KiroStreamEvent) -> Vec<DownstreamFrame> {
        match event {
            KiroStreamEvent::Content(text) => {
                if self.last_content.as_deref() == Some(text.as_str()) {
                    return Vec::new();
                }
                self.last_content = Some(text.clone());
                self.full_text.push_str(&text);
                vec![DownstreamFrame::TextDelta(text)]
            }
            KiroStreamEvent::ToolStart {
                name,
                tool_use_id,
                input,
            } => {
                let mut frames = Vec::new();
                if let Some(finished) = self.finalize_pending_tool() {
                    frames.push(finished);
                }
                let id = if tool_use_id.is_empty() {
                    self.mint_tool_id()
                } else {
                    tool_use_id
                };
                self.pending_tool = Some(PendingTool { id, name, input });
                frames
            }
            KiroStreamEvent::ToolInput(chunk) => {
                if let Some(tool) = &mut self.pending_tool {
                    tool.input.push_str(&chunk);
                }
                Vec::new()
            }
            KiroStreamEvent::ToolStop => self.finalize_pending_tool().into_iter().collect(),
            KiroStreamEvent::Usage(value) => {
                if let Some(v) = value.get("inputTokenCount").and_then(|v| v.as_u64()) {
                    self.input_tokens = v as u32;
                }
                if let Some(v) = value.get("outputTokenCount").and_then(|v| v.as_u64()) {
                    self.output_tokens = v as u32;
                }
                vec![DownstreamFrame::Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: self.output_tokens,
                }]
            }
            KiroStreamEvent::ContextUsage(pct) => vec![DownstreamFrame::ContextUsage(pct)],
        }
    }

    /// End of stream: finalize any in-progress tool call and merge in any
    /// textual fallback tool calls found in the accumulated text.
    pub fn finish(mut self) -> Vec<DownstreamFrame> {
        let mut frames: Vec<DownstreamFrame> = self.finalize_pending_tool().into_iter().collect();

        for (id, name, arguments) in extract_textual_tool_calls(&self.full_text) {
            if self
                .finished_tools
                .iter()
                .any(|(n, a, _)| *n == name && *a == arguments)
            {
                continue;
            }
            self.finished_tools.push((name.clone(), arguments.clone(), id.clone()));
            frames.push(DownstreamFrame::ToolCall { id, name, arguments });
        }

        frames
    }

    fn finalize_pending_tool(&mut self) -> Option<DownstreamFrame> {
        let tool = self.pending_tool.take()?;
        let arguments = normalize_json_or_raw(&tool.input);

        let duplicate = self
            .finished_tools
            .iter()
            .any(|(name, args, _)| *name == tool.name && *args == arguments);
        if duplicate {
            return None;
        }

        self.finished_tools
            .push((tool.name.clone(), arguments.clone(), tool.id.clone()));
        Some(DownstreamFrame::ToolCall {
            id: tool.id,
            name: tool.name,
            arguments,
        })
    }

    fn mint_tool_id(&mut self) -> String {
        self.next_tool_id += 1;
        format!("toolu_{}", uuid::Uuid::new_v4().simple())
    }
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `raw` as JSON and re-serialize it compactly; fall back to the raw
/// string unchanged if it does not parse.
fn normalize_json_or_raw(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => serde_json::to_string(&value).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

/// Scan `text` for `[Called <name> with args: {...}]` sequences, brace-matching
/// the argument object, and return `(id, name, arguments)` triples.
fn extract_textual_tool_calls(text: &str) -> Vec<(String, String, String)> {
    static CALL_RE_SRC: &str = r"\[Called (\w+) with args: \{";
    let re = Regex::new(CALL_RE_SRC).expect("static regex is valid");

    let mut calls = Vec::new();
    for m in re.captures_iter(text) {
        let whole = m.get(0).unwrap();
        let name = m.get(1).unwrap().as_str().to_string();
        let brace_start = whole.end() - 1;
        if let Some(end) = find_matching_brace(text, brace_start) {
            let arguments = normalize_json_or_raw(&text[brace_start..=end]);
            calls.push((format!("toolu_{}", uuid::Uuid::new_v4().simple()), name, arguments));
        }
    }
    calls
}

fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0i32;
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

/// Tunable knobs for the first-token watchdog.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub first_token_timeout: Duration,
    pub first_token_max_retries: u32,
    pub streaming_read_timeout: Duration,
}

impl WatchdogConfig {
    /// Validate the configured deadlines. `streaming_read_timeout` must
    /// strictly exceed `first_token_timeout`.
    pub fn validate(&self) -> Result<()> {
        if self.streaming_read_timeout <= self.first_token_timeout {
            return Err(Error::Config(format!(
                "streaming_read_timeout ({:?}) must exceed first_token_timeout ({:?})",
                self.streaming_read_timeout, self.first_token_timeout
            )));
        }
        Ok(())
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            first_token_timeout: FIRST_TOKEN_TIMEOUT,
            first_token_max_retries: MAX_RETRIES,
            streaming_read_timeout: STREAMING_READ_TIMEOUT,
        }
    }
}

/// The response handle plus its already-consumed first chunk, ready for the
/// caller to keep reading under `streaming_read_timeout`.
pub struct WatchedStream {
    response: reqwest::Response,
    first_chunk: Option<bytes::Bytes>,
}

impl WatchedStream {
    /// Read the next chunk, subject to `read_timeout`. Returns `Ok(None)` at
    /// end of stream.
    pub async fn next_chunk(&mut self, read_timeout: Duration) -> Result<Option<bytes::Bytes>> {
        if let Some(chunk) = self.first_chunk.take() {
            return Ok(Some(chunk));
        }
        match tokio::time::timeout(read_timeout, self.response.chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(Error::Network(e)),
            Err(_) => Err(Error::Timeout),
        }
    }
}

/// Race connecting *and* the first response byte against
/// `config.first_token_timeout`, retrying the whole attempt (via `start`) up
/// to `config.first_token_max_retries` times on timeout. A server that
/// accepts the connection but never sends a response is just as much a
/// watchdog trip as one that sends headers and then stalls. Once a byte has
/// arrived the watchdog is disarmed; the caller reads the remainder through
/// [`WatchedStream::next_chunk`] under `config.streaming_read_timeout`.
pub async fn fetch_with_watchdog<F, Fut>(mut start: F, config: &WatchdogConfig) -> Result<WatchedStream>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response>>,
{
    config.validate()?;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let attempt_deadline = config.first_token_timeout;
        let attempt = async {
            let mut response = start().await?;
            let first_chunk = response.chunk().await.map_err(Error::Network)?;
            Ok::<_, Error>((response, first_chunk))
        };

        match tokio::time::timeout(attempt_deadline, attempt).await {
            Ok(Ok((response, first_chunk))) => {
                debug!(attempts, "First token arrived, disarming watchdog");
                return Ok(WatchedStream { response, first_chunk });
            }
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => {
                warn!(attempts, "First-token watchdog fired, cancelling and retrying");
                if attempts >= config.first_token_max_retries {
                    return Err(Error::FirstTokenTimeout { attempts });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_consecutive_content_events_collapse() {
        let mut t = Transcoder::new();
        let a = t.ingest(KiroStreamEvent::Content("hi".into()));
        let b = t.ingest(KiroStreamEvent::Content("hi".into()));
        let c = t.ingest(KiroStreamEvent::Content("there".into()));
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn new_tool_start_finalizes_prior_accumulating_call() {
        let mut t = Transcoder::new();
        assert!(t
            .ingest(KiroStreamEvent::ToolStart {
                name: "a".into(),
                tool_use_id: "1".into(),
                input: "{\"x\":1".into(),
            })
            .is_empty());
        t.ingest(KiroStreamEvent::ToolInput("}".into()));

        let frames = t.ingest(KiroStreamEvent::ToolStart {
            name: "b".into(),
            tool_use_id: "2".into(),
            input: String::new(),
        });
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            DownstreamFrame::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "a");
                assert_eq!(arguments, "{\"x\":1}");
            }
            _ => panic!("expected finalized tool call"),
        }
    }

    #[test]
    fn unfinished_call_is_finalized_at_stream_end() {
        let mut t = Transcoder::new();
        t.ingest(KiroStreamEvent::ToolStart {
            name: "a".into(),
            tool_use_id: "1".into(),
            input: "{\"x\":1}".into(),
        });
        let frames = t.finish();
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], DownstreamFrame::ToolCall { name, .. } if name == "a"));
    }

    #[test]
    fn malformed_input_is_kept_raw_not_dropped() {
        let mut t = Transcoder::new();
        t.ingest(KiroStreamEvent::ToolStart {
            name: "a".into(),
            tool_use_id: "1".into(),
            input: "not json".into(),
        });
        let frames = t.finish();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            DownstreamFrame::ToolCall { arguments, .. } => assert_eq!(arguments, "not json"),
            _ => panic!(),
        }
    }

    #[test]
    fn textual_fallback_merges_with_structured_calls_deduped() {
        let mut t = Transcoder::new();
        t.ingest(KiroStreamEvent::Content(
            "Sure, [Called get_weather with args: {\"city\":\"NYC\"}] done.".into(),
        ));
        let frames = t.finish();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            DownstreamFrame::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "get_weather");
                assert_eq!(arguments, r#"{"city":"NYC"}"#);
            }
            _ => panic!("expected fallback tool call"),
        }
    }

    #[test]
    fn textual_fallback_does_not_duplicate_structured_call() {
        let mut t = Transcoder::new();
        t.ingest(KiroStreamEvent::ToolStart {
            name: "get_weather".into(),
            tool_use_id: "1".into(),
            input: r#"{"city":"NYC"}"#.into(),
        });
        t.ingest(KiroStreamEvent::ToolStop);
        t.ingest(KiroStreamEvent::Content(
            "[Called get_weather with args: {\"city\":\"NYC\"}]".into(),
        ));
        let frames = t.finish();
        assert_eq!(frames.len(), 0);
    }

    #[test]
    fn watchdog_config_rejects_non_strict_deadlines() {
        let cfg = WatchdogConfig {
            first_token_timeout: Duration::from_secs(30),
            first_token_max_retries: 3,
            streaming_read_timeout: Duration::from_secs(30),
        };
        assert!(cfg.validate().is_err());
    }

    // Drives fetch_with_watchdog against two real local connections: the first
    // accepts then stays silent past the deadline, the second streams a byte
    // promptly. Exercises the actual retry-then-succeed path end to end.
    #[tokio::test]
    async fn watchdog_retries_once_then_succeeds_on_second_connection() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // First connection: accept, then go silent forever (never write).
            let (_silent, _) = listener.accept().await.unwrap();

            // Second connection: respond immediately with a tiny streamed body.
            let (mut stream, _) = listener.accept().await.unwrap();
            let body = "hello";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });

        let config = WatchdogConfig {
            first_token_timeout: Duration::from_millis(200),
            first_token_max_retries: 2,
            streaming_read_timeout: Duration::from_secs(5),
        };

        let client = reqwest::Client::new();
        let url = format!("http://{addr}/");
        let mut attempts = 0u32;
        let result = fetch_with_watchdog(
            || {
                attempts += 1;
                let client = client.clone();
                let url = url.clone();
                async move { client.get(&url).send().await.map_err(Error::Network) }
            },
            &config,
        )
        .await;

        let mut watched = result.expect("watchdog should succeed on the second attempt");
        let chunk = watched
            .next_chunk(config.streaming_read_timeout)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert_eq!(attempts, 2);
    }
}
