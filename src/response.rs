//! Response reader and JSON extractor.
//!
//! The reader walks `AwaitingHeaders -> ReadingBody -> Done`:
//! - headers are skipped line by line under one fixed deadline; only the blank
//!   terminator line matters, status and fields are not interpreted
//! - the body accumulates until the peer closes or no byte has arrived for the
//!   idle timeout, bounded by `max_response_bytes`
//!
//! Extraction then isolates the first balanced top-level `{ ... }` in the raw
//! body, which may be wrapped in chunk-size markers or trailing text.

use std::time::{Duration, Instant};

use crate::outcome::LocalFailure;
use crate::transport::{BodyRead, ChannelReader, LineRead};

pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_BODY_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 32 * 1024;
pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;

const BODY_CHUNK_BYTES: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseLimits {
    /// Deadline for the whole header section, from the start of reading.
    pub header_timeout: Duration,
    /// Longest gap allowed between body bytes.
    pub body_idle_timeout: Duration,
    pub max_response_bytes: usize,
    pub max_header_bytes: usize,
}

impl Default for ResponseLimits {
    fn default() -> Self {
        Self {
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            body_idle_timeout: DEFAULT_BODY_IDLE_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    AwaitingHeaders,
    ReadingBody,
    Done,
}

/// Accumulated response body bytes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RawResponse(Vec<u8>);

impl RawResponse {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One-shot state machine over a connected channel.
pub struct ResponseReader {
    limits: ResponseLimits,
    state: ReaderState,
    status_line: Option<String>,
}

impl ResponseReader {
    pub fn new(limits: ResponseLimits) -> Self {
        Self {
            limits,
            state: ReaderState::AwaitingHeaders,
            status_line: None,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// First header line, kept for diagnostics only.
    pub fn status_line(&self) -> Option<&str> {
        self.status_line.as_deref()
    }

    /// Consume headers and body. A non-empty body is returned; every other
    /// ending is a `LocalFailure`.
    pub fn read(&mut self, reader: &mut ChannelReader<'_>) -> Result<RawResponse, LocalFailure> {
        let result = self.read_headers(reader).and_then(|()| self.read_body(reader));
        self.state = ReaderState::Done;
        result
    }

    fn read_headers(&mut self, reader: &mut ChannelReader<'_>) -> Result<(), LocalFailure> {
        let deadline = Instant::now() + self.limits.header_timeout;
        let mut header_bytes = 0usize;
        loop {
            let remaining = self.limits.max_header_bytes.saturating_sub(header_bytes);
            let line = reader.read_line(deadline, remaining).map_err(|err| {
                log::debug!("header read failed: {}", err);
                LocalFailure::Connection
            })?;
            match line {
                LineRead::Line(line) if line.is_empty() => {
                    self.state = ReaderState::ReadingBody;
                    return Ok(());
                }
                LineRead::Line(line) => {
                    header_bytes += line.len() + 2;
                    if header_bytes > self.limits.max_header_bytes {
                        return Err(LocalFailure::ResponseTooLarge);
                    }
                    if self.status_line.is_none() {
                        log::debug!("response status: {}", line);
                        self.status_line = Some(line);
                    }
                }
                LineRead::TooLong => return Err(LocalFailure::ResponseTooLarge),
                LineRead::TimedOut => {
                    log::debug!(
                        "no header terminator within {:?}",
                        self.limits.header_timeout
                    );
                    return Err(LocalFailure::HeaderTimeout);
                }
                LineRead::Closed => {
                    log::debug!("connection closed before header terminator");
                    return Err(LocalFailure::HeaderTimeout);
                }
            }
        }
    }

    fn read_body(&mut self, reader: &mut ChannelReader<'_>) -> Result<RawResponse, LocalFailure> {
        let mut body = Vec::new();
        let mut chunk = [0u8; BODY_CHUNK_BYTES];
        let mut last_byte_at = Instant::now();
        loop {
            let deadline = last_byte_at + self.limits.body_idle_timeout;
            match reader.read_available(&mut chunk, deadline) {
                Ok(BodyRead::Data(n)) => {
                    if body.len() + n > self.limits.max_response_bytes {
                        log::warn!(
                            "response body exceeded {} bytes",
                            self.limits.max_response_bytes
                        );
                        return Err(LocalFailure::ResponseTooLarge);
                    }
                    body.extend_from_slice(&chunk[..n]);
                    last_byte_at = Instant::now();
                }
                Ok(BodyRead::Closed) => break,
                Ok(BodyRead::TimedOut) => {
                    log::debug!(
                        "body idle for {:?}, finishing with {} bytes",
                        self.limits.body_idle_timeout,
                        body.len()
                    );
                    break;
                }
                Err(err) => {
                    log::debug!("body read ended with error: {}", err);
                    break;
                }
            }
        }
        if body.is_empty() {
            return Err(LocalFailure::EmptyResponse);
        }
        Ok(RawResponse(body))
    }
}

// ----------------------------------------------------------------------------
// Extraction
// ----------------------------------------------------------------------------

/// How braces are counted while looking for the end of the object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BraceScan {
    /// Count every `{` and `}`, including ones inside string literals.
    #[default]
    Naive,
    /// Skip braces inside JSON string literals, honouring backslash escapes.
    StringAware,
}

impl std::str::FromStr for BraceScan {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "naive" => Ok(Self::Naive),
            "string-aware" | "string_aware" | "strings" => Ok(Self::StringAware),
            other => Err(anyhow::anyhow!(
                "unknown brace scan '{}': expected 'naive' or 'string-aware'",
                other
            )),
        }
    }
}

/// Slice out the first balanced top-level object.
///
/// If the object never balances, everything from the first `{` is returned
/// and the JSON parser reports the problem.
pub fn extract_json(raw: &[u8], scan: BraceScan) -> Result<&[u8], LocalFailure> {
    let start = raw
        .iter()
        .position(|b| *b == b'{')
        .ok_or(LocalFailure::NoJson)?;
    let tail = &raw[start..];

    let mut depth: i64 = 1;
    let mut in_string = false;
    let mut escaped = false;
    for (i, byte) in tail.iter().enumerate().skip(1) {
        if scan == BraceScan::StringAware {
            if in_string {
                if escaped {
                    escaped = false;
                } else if *byte == b'\\' {
                    escaped = true;
                } else if *byte == b'"' {
                    in_string = false;
                }
                continue;
            }
            if *byte == b'"' {
                in_string = true;
                continue;
            }
        }
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&tail[..=i]);
                }
            }
            _ => {}
        }
    }
    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, ReplayConnector, ReplayStep};

    fn fast_limits() -> ResponseLimits {
        ResponseLimits {
            header_timeout: Duration::from_millis(60),
            body_idle_timeout: Duration::from_millis(60),
            ..ResponseLimits::default()
        }
    }

    fn run(script: Vec<ReplayStep>, limits: ResponseLimits) -> (Result<RawResponse, LocalFailure>, ReaderState) {
        let connector = ReplayConnector::new(script);
        let mut channel = connector.connect("h", 443, Duration::from_secs(1)).unwrap();
        let mut reader = ChannelReader::new(channel.as_mut());
        let mut response = ResponseReader::new(limits);
        let result = response.read(&mut reader);
        (result, response.state())
    }

    #[test]
    fn extracts_object_between_garbage() {
        let raw = br#"garbage{"a":{"b":1}}trailing"#;
        assert_eq!(extract_json(raw, BraceScan::Naive).unwrap(), br#"{"a":{"b":1}}"#);
    }

    #[test]
    fn extracts_from_chunked_body() {
        let raw = b"1a3\r\n{\"candidates\":[]}\r\n0\r\n\r\n";
        assert_eq!(
            extract_json(raw, BraceScan::Naive).unwrap(),
            b"{\"candidates\":[]}"
        );
    }

    #[test]
    fn missing_brace_is_no_json() {
        assert_eq!(
            extract_json(b"<html>502 Bad Gateway</html>", BraceScan::Naive),
            Err(LocalFailure::NoJson)
        );
    }

    #[test]
    fn unbalanced_tail_is_returned_whole() {
        let raw = br#"xx{"a":{"b":1}"#;
        assert_eq!(extract_json(raw, BraceScan::Naive).unwrap(), br#"{"a":{"b":1}"#);
    }

    #[test]
    fn naive_scan_miscounts_braces_in_strings() {
        let raw = br#"{"text":"a } b"} tail"#;
        assert_eq!(extract_json(raw, BraceScan::Naive).unwrap(), br#"{"text":"a }"#);
        assert_eq!(
            extract_json(raw, BraceScan::StringAware).unwrap(),
            br#"{"text":"a } b"}"#
        );
    }

    #[test]
    fn string_aware_scan_honours_escapes() {
        let raw = br#"{"text":"quote \" { brace"} tail"#;
        assert_eq!(
            extract_json(raw, BraceScan::StringAware).unwrap(),
            br#"{"text":"quote \" { brace"}"#
        );
    }

    #[test]
    fn reads_body_after_headers_until_close() {
        let (result, state) = run(
            vec![
                ReplayStep::data(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n"),
                ReplayStep::data(b"{\"a\":"),
                ReplayStep::data(b"1}"),
                ReplayStep::Close,
            ],
            fast_limits(),
        );
        assert_eq!(result.unwrap().as_bytes(), b"{\"a\":1}");
        assert_eq!(state, ReaderState::Done);
    }

    #[test]
    fn header_stall_times_out_without_reading_body() {
        let connector = ReplayConnector::new(vec![
            ReplayStep::data(b"HTTP/1.1 200 OK\r\n"),
            ReplayStep::Stall(Duration::from_secs(60)),
            ReplayStep::data(b"\r\n{\"late\":true}"),
        ]);
        let mut channel = connector.connect("h", 443, Duration::from_secs(1)).unwrap();
        let mut reader = ChannelReader::new(channel.as_mut());
        let mut response = ResponseReader::new(fast_limits());

        let result = response.read(&mut reader);
        assert_eq!(result, Err(LocalFailure::HeaderTimeout));
        assert_eq!(response.status_line(), Some("HTTP/1.1 200 OK"));
        assert_eq!(response.state(), ReaderState::Done);
    }

    #[test]
    fn body_idle_timeout_keeps_received_bytes() {
        let (result, _) = run(
            vec![
                ReplayStep::data(b"HTTP/1.1 200 OK\r\n\r\n{\"a\":1}"),
                ReplayStep::Stall(Duration::from_secs(60)),
            ],
            fast_limits(),
        );
        assert_eq!(result.unwrap().as_bytes(), b"{\"a\":1}");
    }

    #[test]
    fn empty_body_is_reported() {
        let (result, _) = run(
            vec![ReplayStep::data(b"HTTP/1.1 204 No Content\r\n\r\n"), ReplayStep::Close],
            fast_limits(),
        );
        assert_eq!(result, Err(LocalFailure::EmptyResponse));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut body = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        body.extend(std::iter::repeat(b'x').take(2048));
        let limits = ResponseLimits {
            max_response_bytes: 1024,
            ..fast_limits()
        };
        let (result, _) = run(vec![ReplayStep::Data(body), ReplayStep::Close], limits);
        assert_eq!(result, Err(LocalFailure::ResponseTooLarge));
    }

    #[test]
    fn many_short_headers_exceed_header_cap() {
        let mut raw = b"HTTP/1.1 200 OK\r\n".to_vec();
        for i in 0..64 {
            raw.extend(format!("X-Pad-{i}: v\r\n").into_bytes());
        }
        raw.extend(b"\r\n{\"candidates\":[]}");
        let limits = ResponseLimits {
            max_header_bytes: 256,
            ..fast_limits()
        };
        let (result, state) = run(vec![ReplayStep::Data(raw), ReplayStep::Close], limits);
        assert_eq!(result, Err(LocalFailure::ResponseTooLarge));
        assert_eq!(state, ReaderState::Done);
    }

    #[test]
    fn close_before_terminator_is_header_timeout() {
        let (result, _) = run(
            vec![ReplayStep::data(b"HTTP/1.1 200 OK\r\n"), ReplayStep::Close],
            fast_limits(),
        );
        assert_eq!(result, Err(LocalFailure::HeaderTimeout));
    }
}
