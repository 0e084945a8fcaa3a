use serde::Deserialize;
use tracing::debug;

/// Terminal sentinel of an OpenAI-compatible completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One meaningful line of the upstream stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseLine {
    /// A non-empty text fragment.
    Delta(String),
    /// The `data: [DONE]` sentinel.
    Done,
}

#[derive(Deserialize)]
struct ChunkRecord {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Interpret one line of the upstream body.
///
/// Returns `None` for blank lines, comments, non-`data` fields, records
/// without text (role preambles, finish markers) and records that fail to
/// parse. Malformed records are logged at debug and otherwise ignored.
pub fn parse_line(line: &str) -> Option<SseLine> {
    let line = line.trim_end_matches('\r');
    let data = line.strip_prefix("data:")?.trim_start();

    if data.trim() == DONE_SENTINEL {
        return Some(SseLine::Done);
    }

    match serde_json::from_str::<ChunkRecord>(data) {
        Ok(record) => record
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|s| !s.is_empty())
            .map(SseLine::Delta),
        Err(e) => {
            debug!(error = %e, line = %data, "dropping unparseable stream record");
            None
        }
    }
}

/// Splits a chunked byte body into complete lines.
///
/// Bytes are buffered until a `\n` arrives, so a UTF-8 sequence or a JSON
/// record split across network chunks is reassembled before parsing.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the body has ended without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta() {
        let line = r#"data: {"id":"1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_line(line), Some(SseLine::Delta("Hel".into())));
    }

    #[test]
    fn parses_without_space_after_colon() {
        let line = r#"data:{"choices":[{"delta":{"content":"x"}}]}"#;
        assert_eq!(parse_line(line), Some(SseLine::Delta("x".into())));
    }

    #[test]
    fn parses_done_sentinel() {
        assert_eq!(parse_line("data: [DONE]"), Some(SseLine::Done));
        assert_eq!(parse_line("data: [DONE]\r"), Some(SseLine::Done));
    }

    #[test]
    fn keeps_embedded_newlines_in_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"line one\nline two"}}]}"#;
        assert_eq!(parse_line(line), Some(SseLine::Delta("line one\nline two".into())));
    }

    #[test]
    fn ignores_role_preamble_and_finish_records() {
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            None
        );
        assert_eq!(parse_line(r#"data: {"choices":[]}"#), None);
    }

    #[test]
    fn drops_malformed_and_foreign_lines() {
        assert_eq!(parse_line("data: {not json"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line(": keep-alive"), None);
        assert_eq!(parse_line("event: message"), None);
    }

    #[test]
    fn line_buffer_reassembles_split_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"choices\":[{\"delta\":{\"con").is_empty());
        let lines = buf.push(b"tent\":\"hi\"}}]}\n\ndata: [DO");
        assert_eq!(lines.len(), 2);
        assert_eq!(parse_line(&lines[0]), Some(SseLine::Delta("hi".into())));
        assert_eq!(lines[1], "");
        let lines = buf.push(b"NE]\n");
        assert_eq!(parse_line(&lines[0]), Some(SseLine::Done));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_reassembles_split_utf8() {
        let mut buf = LineBuffer::new();
        let bytes = "data: 你好\n".as_bytes();
        let (a, b) = bytes.split_at(8);
        assert!(buf.push(a).is_empty());
        assert_eq!(buf.push(b), vec!["data: 你好".to_string()]);
    }

    #[test]
    fn line_buffer_finish_returns_tail() {
        let mut buf = LineBuffer::new();
        buf.push(b"data: [DONE]");
        assert_eq!(buf.finish().as_deref(), Some("data: [DONE]"));
        assert_eq!(buf.finish(), None);
    }
}
