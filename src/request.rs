//! Request builder: prompt + encoded frame to one HTTP/1.1 upload request.
//!
//! The builder does no I/O. The JSON body is serialized once, up front, so the
//! `Content-Length` header is the exact byte count of what goes on the wire.

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Serialize;
use std::io::Write;
use std::sync::OnceLock;

use crate::encode::EncodedPayload;

pub const DEFAULT_API_HOST: &str = "generativelanguage.googleapis.com";
pub const DEFAULT_API_PORT: u16 = 443;
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_PROMPT: &str = "I want a short answer for what do you see in the image";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 100;

fn model_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("model id pattern is valid")
    })
}

/// Remote inference endpoint plus credentials.
#[derive(Clone)]
pub struct ApiTarget {
    pub host: String,
    pub port: u16,
    pub model: String,
    api_key: String,
}

impl ApiTarget {
    pub fn new(host: &str, port: u16, model: &str, api_key: &str) -> Result<Self> {
        let target = Self {
            host: host.trim().to_string(),
            port,
            model: model.trim().to_string(),
            api_key: api_key.trim().to_string(),
        };
        target.validate()?;
        Ok(target)
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.host.contains(char::is_whitespace) {
            return Err(anyhow!("api host '{}' is not a valid host name", self.host));
        }
        if self.port == 0 {
            return Err(anyhow!("api port must be non-zero"));
        }
        if !model_id_pattern().is_match(&self.model) {
            return Err(anyhow!("model id '{}' is not a valid identifier", self.model));
        }
        if self.api_key.is_empty() {
            return Err(anyhow!("api key is empty"));
        }
        if self.api_key.chars().any(|c| c.is_whitespace() || c == '&' || c == '#') {
            return Err(anyhow!("api key contains characters not allowed in a query string"));
        }
        Ok(())
    }

    /// Request path, including the API key.
    pub fn path(&self) -> String {
        format!(
            "/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        )
    }

    /// Request path with the key masked, for logs.
    pub fn redacted_path(&self) -> String {
        format!("/v1beta/models/{}:generateContent?key=***", self.model)
    }
}

impl std::fmt::Debug for ApiTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("model", &self.model)
            .field("api_key", &"***")
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Wire shape
// ----------------------------------------------------------------------------

#[derive(Serialize)]
struct GenerateContentBody<'a> {
    contents: [Content<'a>; 1],
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: (TextPart<'a>, InlinePart<'a>),
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct InlinePart<'a> {
    inline_data: InlineData<'a>,
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

// ----------------------------------------------------------------------------
// UploadRequest
// ----------------------------------------------------------------------------

/// One serialized upload. Immutable once built.
pub struct UploadRequest {
    host: String,
    port: u16,
    path: String,
    redacted_path: String,
    prompt: String,
    max_output_tokens: u32,
    payload_len: usize,
    body: Vec<u8>,
}

impl UploadRequest {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn redacted_path(&self) -> &str {
        &self.redacted_path
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn max_output_tokens(&self) -> u32 {
        self.max_output_tokens
    }

    /// Length of the base64 image text embedded in the body.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    /// `Host` header value; the port is only spelled out when it is not 443.
    pub fn host_header(&self) -> String {
        if self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Request line and headers, terminated by the blank line.
    pub fn head(&self) -> String {
        format!(
            "POST {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {len}\r\n\r\n",
            path = self.path,
            host = self.host_header(),
            len = self.body.len()
        )
    }

    /// Write the complete request. Nothing follows the body.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.head().as_bytes())?;
        writer.write_all(&self.body)?;
        writer.flush()
    }
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("host", &self.host)
            .field("path", &self.redacted_path)
            .field("content_length", &self.body.len())
            .finish()
    }
}

/// Assemble the upload request. The payload is consumed so its text is freed
/// as soon as it has been copied into the body.
pub fn build_request(
    prompt: &str,
    mime_type: &str,
    payload: EncodedPayload,
    max_output_tokens: u32,
    target: &ApiTarget,
) -> Result<UploadRequest> {
    let document = GenerateContentBody {
        contents: [Content {
            parts: (
                TextPart { text: prompt },
                InlinePart {
                    inline_data: InlineData {
                        mime_type,
                        data: payload.as_str(),
                    },
                },
            ),
        }],
        generation_config: GenerationConfig { max_output_tokens },
    };
    let body = serde_json::to_vec(&document)?;
    let payload_len = payload.len();
    drop(payload);

    Ok(UploadRequest {
        host: target.host.clone(),
        port: target.port,
        path: target.path(),
        redacted_path: target.redacted_path(),
        prompt: prompt.to_string(),
        max_output_tokens,
        payload_len,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_frame;

    fn target() -> ApiTarget {
        ApiTarget::new(DEFAULT_API_HOST, 443, DEFAULT_MODEL, "test-key-123").unwrap()
    }

    #[test]
    fn body_has_fixed_shape() {
        let payload = encode_frame(b"\xFF\xD8jpeg\xFF\xD9").unwrap();
        let expected_data = payload.as_str().to_string();
        let request = build_request("what is it?", "image/jpeg", payload, 100, &target()).unwrap();

        let value: serde_json::Value = serde_json::from_slice(request.body()).unwrap();
        assert_eq!(value["contents"][0]["parts"][0]["text"], "what is it?");
        assert_eq!(
            value["contents"][0]["parts"][1]["inline_data"]["mime_type"],
            "image/jpeg"
        );
        assert_eq!(
            value["contents"][0]["parts"][1]["inline_data"]["data"],
            expected_data.as_str()
        );
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 100);
    }

    #[test]
    fn content_length_counts_bytes_not_chars() {
        let prompt = "¿Qué ves? 画像 🗑️ \"quoted\"\n";
        let payload = encode_frame(b"abc").unwrap();
        let request = build_request(prompt, "image/jpeg", payload, 100, &target()).unwrap();

        let head = request.head();
        let expected = format!("Content-Length: {}\r\n", request.body().len());
        assert!(head.contains(&expected));

        let mut wire = Vec::new();
        request.write_to(&mut wire).unwrap();
        let split = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(wire.len() - split, request.content_length());
    }

    #[test]
    fn head_carries_required_headers() {
        let payload = encode_frame(b"abc").unwrap();
        let request = build_request("p", "image/jpeg", payload, 10, &target()).unwrap();
        let head = request.head();
        assert!(head.starts_with(
            "POST /v1beta/models/gemini-1.5-flash:generateContent?key=test-key-123 HTTP/1.1\r\n"
        ));
        assert!(head.contains("Host: generativelanguage.googleapis.com\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("Content-Type: application/json\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn host_header_names_non_default_port() {
        let local = ApiTarget::new("inference.local", 8443, "gemini-1.5-flash", "k").unwrap();
        let payload = encode_frame(b"abc").unwrap();
        let request = build_request("p", "image/jpeg", payload, 10, &local).unwrap();
        assert!(request.head().contains("Host: inference.local:8443\r\n"));

        let payload = encode_frame(b"abc").unwrap();
        let request = build_request("p", "image/jpeg", payload, 10, &target()).unwrap();
        assert_eq!(request.host_header(), "generativelanguage.googleapis.com");
    }

    #[test]
    fn redacted_path_hides_key() {
        let target = target();
        assert!(!target.redacted_path().contains("test-key-123"));
        assert!(!format!("{:?}", target).contains("test-key-123"));
    }

    #[test]
    fn target_validation() {
        assert!(ApiTarget::new("host", 443, "gemini-1.5-flash", "").is_err());
        assert!(ApiTarget::new("host", 443, "bad model", "k").is_err());
        assert!(ApiTarget::new("host", 443, "../etc", "k").is_err());
        assert!(ApiTarget::new("host", 443, "m", "a&b").is_err());
        assert!(ApiTarget::new("", 443, "m", "k").is_err());
        assert!(ApiTarget::new("host", 0, "m", "k").is_err());
    }
}
