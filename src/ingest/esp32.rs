//! ESP32 camera web server source.
//!
//! Talks to the stock camera firmware HTTP interface:
//! - `GET <base>/capture` returns one JPEG snapshot
//! - `GET <base>/control?var=framesize&val=<code>` switches geometry
//! - `GET <base>/control?var=quality&val=<0-63>` sets JPEG quality
//!
//! After a profile switch the next snapshot is decoded once to confirm the
//! camera really delivers the requested geometry.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use image::GenericImageView;
use url::Url;

use super::{looks_like_jpeg, FrameSource, SourceFrame, MAX_FRAME_BYTES};
use crate::frame::{FrameFormat, SourceSettings};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Esp32Source {
    base: Url,
    agent: ureq::Agent,
    settings: SourceSettings,
    verify_geometry: bool,
    frame_count: u64,
}

impl Esp32Source {
    pub fn new(url: &str, settings: SourceSettings) -> Result<Self> {
        let base = Url::parse(url).context("parse esp32 url")?;
        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported esp32 scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let mut source = Self {
            base,
            agent: ureq::AgentBuilder::new().build(),
            settings,
            verify_geometry: true,
            frame_count: 0,
        };
        source.push_settings(&settings)?;
        Ok(source)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("build esp32 endpoint {}", path))
    }

    fn set_control(&self, var: &str, val: u32) -> Result<()> {
        let mut url = self.endpoint("control")?;
        url.query_pairs_mut()
            .append_pair("var", var)
            .append_pair("val", &val.to_string());
        self.agent
            .get(url.as_str())
            .timeout(CONTROL_TIMEOUT)
            .call()
            .with_context(|| format!("set esp32 {}={}", var, val))?;
        Ok(())
    }

    fn push_settings(&mut self, settings: &SourceSettings) -> Result<()> {
        self.set_control("framesize", settings.profile.driver_code() as u32)?;
        self.set_control("quality", settings.compression_quality as u32)?;
        self.verify_geometry = true;
        log::info!("Esp32Source: {} set to {}", self.base, settings.profile);
        Ok(())
    }

    fn check_geometry(&mut self, bytes: &[u8]) {
        if !self.verify_geometry {
            return;
        }
        self.verify_geometry = false;
        match image::load_from_memory(bytes) {
            Ok(decoded) => {
                let actual = decoded.dimensions();
                let expected = self.settings.profile.dimensions();
                if actual != expected {
                    log::warn!(
                        "Esp32Source: camera delivers {}x{}, expected {}",
                        actual.0,
                        actual.1,
                        self.settings.profile
                    );
                }
            }
            Err(err) => log::warn!("Esp32Source: snapshot did not decode: {}", err),
        }
    }
}

impl FrameSource for Esp32Source {
    fn acquire_frame(&mut self, timeout: Duration) -> Result<Option<SourceFrame>> {
        let url = self.endpoint("capture")?;
        let response = match self.agent.get(url.as_str()).timeout(timeout).call() {
            Ok(response) => response,
            Err(ureq::Error::Transport(err)) => {
                log::warn!("Esp32Source: snapshot request failed: {}", err);
                return Ok(None);
            }
            Err(err) => return Err(err).context("fetch esp32 snapshot"),
        };
        let mut data = Vec::new();
        response
            .into_reader()
            .take(MAX_FRAME_BYTES as u64 + 1)
            .read_to_end(&mut data)
            .context("read esp32 snapshot")?;
        if data.len() > MAX_FRAME_BYTES {
            return Err(anyhow!("esp32 snapshot exceeds {} bytes", MAX_FRAME_BYTES));
        }
        if !looks_like_jpeg(&data) {
            return Err(anyhow!("esp32 snapshot is not a JPEG"));
        }
        self.check_geometry(&data);
        self.frame_count += 1;
        Ok(Some(SourceFrame::new(data, FrameFormat::Jpeg)))
    }

    fn release_frame(&mut self, frame: SourceFrame) {
        drop(frame);
    }

    fn reconfigure(&mut self, settings: &SourceSettings) -> Result<()> {
        settings.validate()?;
        self.push_settings(settings)?;
        self.settings = *settings;
        Ok(())
    }

    fn settings(&self) -> SourceSettings {
        self.settings
    }

    fn describe(&self) -> String {
        format!("esp32 {} ({} frames)", self.base, self.frame_count)
    }
}
