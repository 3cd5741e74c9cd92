use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::frame::{ResolutionProfile, SourceSettings, MAX_COMPRESSION_QUALITY};
use crate::pipeline::{
    PipelineSettings, UploadSettings, DEFAULT_CAPTURE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT,
};
use crate::request::{
    ApiTarget, DEFAULT_API_HOST, DEFAULT_API_PORT, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL,
    DEFAULT_PROMPT,
};
use crate::response::{
    BraceScan, ResponseLimits, DEFAULT_BODY_IDLE_TIMEOUT, DEFAULT_HEADER_TIMEOUT,
    DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_RESPONSE_BYTES,
};
use crate::transport::TlsVerification;

const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_PREVIEW_ADDR: &str = "127.0.0.1:8780";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrashcamConfigFile {
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
    response: Option<ResponseConfigFile>,
    store_dir: Option<PathBuf>,
    preview_addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    host: Option<String>,
    port: Option<u16>,
    model: Option<String>,
    api_key: Option<String>,
    prompt: Option<String>,
    max_output_tokens: Option<u32>,
    connect_timeout_secs: Option<u64>,
    tls_verify: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    url: Option<String>,
    profile: Option<String>,
    compression_quality: Option<u8>,
    buffer_count: Option<u8>,
    capture_timeout_secs: Option<u64>,
    flush_stale: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ResponseConfigFile {
    header_timeout_secs: Option<u64>,
    body_idle_timeout_secs: Option<u64>,
    max_response_bytes: Option<usize>,
    max_header_bytes: Option<usize>,
    brace_scan: Option<String>,
}

#[derive(Clone)]
pub struct TrashcamConfig {
    pub api_host: String,
    pub api_port: u16,
    pub model: String,
    api_key: Option<Zeroizing<String>>,
    pub prompt: String,
    pub max_output_tokens: u32,
    pub connect_timeout: Duration,
    pub tls: TlsVerification,
    pub source: SourceConfig,
    pub response: ResponseLimits,
    pub brace_scan: BraceScan,
    /// `None` keeps the temporary copy in memory.
    pub store_dir: Option<PathBuf>,
    /// `None` disables the preview server.
    pub preview_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub url: String,
    pub settings: SourceSettings,
    pub capture_timeout: Duration,
    pub flush_stale: bool,
}

impl std::fmt::Debug for TrashcamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrashcamConfig")
            .field("api_host", &self.api_host)
            .field("api_port", &self.api_port)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("prompt", &self.prompt)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("tls", &self.tls.to_string())
            .field("source", &self.source)
            .field("response", &self.response)
            .field("brace_scan", &self.brace_scan)
            .field("store_dir", &self.store_dir)
            .field("preview_addr", &self.preview_addr)
            .finish()
    }
}

impl TrashcamConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRASHCAM_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with the config file named explicitly.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrashcamConfigFile) -> Result<Self> {
        let api = file.api.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let response = file.response.unwrap_or_default();

        let profile = match source.profile.as_deref() {
            Some(profile) => profile.parse()?,
            None => ResolutionProfile::default(),
        };
        let tls = match api.tls_verify.as_deref() {
            Some(mode) => mode.parse()?,
            None => TlsVerification::default(),
        };
        let brace_scan = match response.brace_scan.as_deref() {
            Some(scan) => scan.parse()?,
            None => BraceScan::default(),
        };

        Ok(Self {
            api_host: api.host.unwrap_or_else(|| DEFAULT_API_HOST.to_string()),
            api_port: api.port.unwrap_or(DEFAULT_API_PORT),
            model: api.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key: api.api_key.map(Zeroizing::new),
            prompt: api.prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            max_output_tokens: api.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
            connect_timeout: api
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            tls,
            source: SourceConfig {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                settings: SourceSettings {
                    profile,
                    compression_quality: source
                        .compression_quality
                        .unwrap_or_else(|| profile.default_quality()),
                    buffer_count: source.buffer_count.unwrap_or(1),
                },
                capture_timeout: source
                    .capture_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_CAPTURE_TIMEOUT),
                flush_stale: source.flush_stale.unwrap_or(true),
            },
            response: ResponseLimits {
                header_timeout: response
                    .header_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_HEADER_TIMEOUT),
                body_idle_timeout: response
                    .body_idle_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_BODY_IDLE_TIMEOUT),
                max_response_bytes: response
                    .max_response_bytes
                    .unwrap_or(DEFAULT_MAX_RESPONSE_BYTES),
                max_header_bytes: response.max_header_bytes.unwrap_or(DEFAULT_MAX_HEADER_BYTES),
            },
            brace_scan,
            store_dir: file.store_dir,
            preview_addr: Some(
                file.preview_addr
                    .unwrap_or_else(|| DEFAULT_PREVIEW_ADDR.to_string()),
            )
            .filter(|addr| !is_off(addr)),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = Some(Zeroizing::new(key));
            }
        }
        if let Ok(model) = std::env::var("TRASHCAM_MODEL") {
            if !model.trim().is_empty() {
                self.model = model;
            }
        }
        if let Ok(prompt) = std::env::var("TRASHCAM_PROMPT") {
            if !prompt.trim().is_empty() {
                self.prompt = prompt;
            }
        }
        if let Ok(url) = std::env::var("TRASHCAM_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(profile) = std::env::var("TRASHCAM_PROFILE") {
            if !profile.trim().is_empty() {
                let profile: ResolutionProfile = profile.parse()?;
                self.source.settings = SourceSettings {
                    buffer_count: self.source.settings.buffer_count,
                    ..SourceSettings::for_profile(profile)
                };
            }
        }
        if let Ok(dir) = std::env::var("TRASHCAM_STORE_DIR") {
            if !dir.trim().is_empty() {
                self.store_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(addr) = std::env::var("TRASHCAM_PREVIEW_ADDR") {
            if is_off(&addr) {
                self.preview_addr = None;
            } else if !addr.trim().is_empty() {
                self.preview_addr = Some(addr);
            }
        }
        if let Ok(mode) = std::env::var("TRASHCAM_TLS_VERIFY") {
            if !mode.trim().is_empty() {
                self.tls = mode.parse()?;
            }
        }
        if let Ok(tokens) = std::env::var("TRASHCAM_MAX_OUTPUT_TOKENS") {
            self.max_output_tokens = tokens.trim().parse().map_err(|_| {
                anyhow!("TRASHCAM_MAX_OUTPUT_TOKENS must be a positive integer")
            })?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_output_tokens == 0 {
            return Err(anyhow!("max_output_tokens must be greater than zero"));
        }
        if self.source.settings.compression_quality > MAX_COMPRESSION_QUALITY {
            return Err(anyhow!(
                "compression_quality must be within 0-{}",
                MAX_COMPRESSION_QUALITY
            ));
        }
        self.source.settings.validate()?;
        if self.response.max_response_bytes == 0 || self.response.max_header_bytes == 0 {
            return Err(anyhow!("response size limits must be greater than zero"));
        }
        if self.response.header_timeout.is_zero() || self.response.body_idle_timeout.is_zero() {
            return Err(anyhow!("response timeouts must be greater than zero"));
        }
        if let Some(addr) = &self.preview_addr {
            addr.parse::<std::net::SocketAddr>()
                .map_err(|_| anyhow!("invalid preview address '{}'", addr))?;
        }
        if self.tls.is_disabled() {
            log::warn!("TLS verification {}", self.tls);
        }
        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Set the key from a source other than the environment (CLI flag).
    pub fn set_api_key(&mut self, key: String) {
        self.api_key = Some(Zeroizing::new(key));
    }

    /// The endpoint to upload to. Fails when no API key is configured.
    pub fn api_target(&self) -> Result<ApiTarget> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow!("no API key configured; set GEMINI_API_KEY"))?;
        ApiTarget::new(&self.api_host, self.api_port, &self.model, key.as_str())
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            prompt: self.prompt.clone(),
            max_output_tokens: self.max_output_tokens,
            connect_timeout: self.connect_timeout,
            limits: self.response,
            brace_scan: self.brace_scan,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            upload: self.upload_settings(),
            capture_timeout: self.source.capture_timeout,
            flush_stale: self.source.flush_stale,
        }
    }
}

fn is_off(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "off" | "none" | "disabled"
    )
}

fn read_config_file(path: &Path) -> Result<TrashcamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
