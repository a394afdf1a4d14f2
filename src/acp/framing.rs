//! Message framing for the agent's stdio stream.
//!
//! Two framings exist in the wild: newline-delimited JSON (one object per
//! line — the Claude Code ACP adapter) and LSP-style
//! `Content-Length: N\r\n\r\n<N bytes>`. The choice is made once at connect
//! time from the agent command and is fixed for the child's lifetime.

use serde_json::Value;
use thiserror::Error;

/// Substring of the binary name or argv that selects NDJSON framing.
const CLAUDE_TOKEN: &str = "claude";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Ndjson,
    Lsp,
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("invalid JSON in frame: {0}")]
    BadJson(String),
    #[error("malformed LSP header: {0}")]
    BadHeader(String),
    #[error("frame exceeds maximum size ({0} bytes)")]
    TooLarge(usize),
}

/// Frames larger than this indicate a broken peer; the bridge closes the
/// child rather than buffering without bound.
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

impl Framing {
    /// Pick the framing for an agent command line.
    pub fn detect(program: &str, args: &[String]) -> Framing {
        let lower = program.to_ascii_lowercase();
        if lower.contains(CLAUDE_TOKEN)
            || args.iter().any(|a| a.to_ascii_lowercase().contains(CLAUDE_TOKEN))
        {
            Framing::Ndjson
        } else {
            Framing::Lsp
        }
    }

    /// Encode one message for the child's stdin.
    pub fn encode(&self, value: &Value) -> Vec<u8> {
        let body = value.to_string();
        match self {
            Framing::Ndjson => {
                let mut out = body.into_bytes();
                out.push(b'\n');
                out
            }
            Framing::Lsp => {
                let mut out =
                    format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
                out.extend_from_slice(body.as_bytes());
                out
            }
        }
    }
}

/// Incremental decoder over the child's stdout byte stream.
pub struct FrameDecoder {
    framing: Framing,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self { framing, buf: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_FRAME_BYTES {
            return Err(FramingError::TooLarge(self.buf.len()));
        }
        Ok(())
    }

    /// Pop the next complete message, or `None` until more bytes arrive.
    pub fn next(&mut self) -> Result<Option<Value>, FramingError> {
        match self.framing {
            Framing::Ndjson => self.next_line(),
            Framing::Lsp => self.next_lsp(),
        }
    }

    fn next_line(&mut self) -> Result<Option<Value>, FramingError> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            return serde_json::from_str(text)
                .map(Some)
                .map_err(|e| FramingError::BadJson(e.to_string()));
        }
    }

    fn next_lsp(&mut self) -> Result<Option<Value>, FramingError> {
        let Some(header_end) = find_subslice(&self.buf, b"\r\n\r\n") else {
            return Ok(None);
        };
        let header = String::from_utf8_lossy(&self.buf[..header_end]).to_string();
        let mut content_length: Option<usize> = None;
        for line in header.split("\r\n") {
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok();
                }
            }
        }
        let len = content_length
            .ok_or_else(|| FramingError::BadHeader(header.clone()))?;
        if len > MAX_FRAME_BYTES {
            return Err(FramingError::TooLarge(len));
        }

        let body_start = header_end + 4;
        if self.buf.len() < body_start + len {
            return Ok(None);
        }
        let body: Vec<u8> = self.buf.drain(..body_start + len).collect();
        serde_json::from_slice(&body[body_start..])
            .map(Some)
            .map_err(|e| FramingError::BadJson(e.to_string()))
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
