//! Frame sources.
//!
//! A source hands out driver-owned JPEG buffers one at a time and must get
//! each one back through `release_frame`. Backends, selected by URL:
//! - `stub://` synthetic JPEG-shaped frames (tests, demos)
//! - `file://<path>` or a bare path: a snapshot file on local disk
//! - `http(s)://` an ESP32 camera web server (feature: ingest-esp32)
//!
//! Sources MUST NOT:
//! - Block longer than the timeout passed to `acquire_frame`
//! - Change geometry except through `reconfigure`

#[cfg(feature = "ingest-esp32")]
pub mod esp32;
pub mod file;
pub mod stub;

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::frame::{FrameFormat, SourceSettings};

#[cfg(feature = "ingest-esp32")]
pub use esp32::Esp32Source;
pub use file::FileSource;
pub use stub::{StubSource, StubStats};

/// Upper bound on one encoded frame.
pub const MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

/// A buffer on loan from the source. Hand it back with `release_frame`.
pub struct SourceFrame {
    data: Vec<u8>,
    format: FrameFormat,
}

impl SourceFrame {
    pub fn new(data: Vec<u8>, format: FrameFormat) -> Self {
        Self { data, format }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }
}

pub trait FrameSource: Send {
    /// Next frame, or `None` if none arrived within `timeout`.
    fn acquire_frame(&mut self, timeout: Duration) -> Result<Option<SourceFrame>>;

    /// Return a buffer obtained from `acquire_frame`.
    fn release_frame(&mut self, frame: SourceFrame);

    /// Tear down and reinitialize with new geometry/quality.
    fn reconfigure(&mut self, settings: &SourceSettings) -> Result<()>;

    fn settings(&self) -> SourceSettings;

    fn describe(&self) -> String;
}

/// Open a source by URL.
pub fn open_source(url: &str, settings: SourceSettings) -> Result<Box<dyn FrameSource>> {
    settings.validate()?;
    let url = url.trim();
    if url.starts_with("stub://") {
        return Ok(Box::new(StubSource::new(url, settings)));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        #[cfg(feature = "ingest-esp32")]
        {
            return Ok(Box::new(Esp32Source::new(url, settings)?));
        }
        #[cfg(not(feature = "ingest-esp32"))]
        {
            return Err(anyhow!("camera URL '{}' requires the ingest-esp32 feature", url));
        }
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Box::new(FileSource::new(path, settings)?));
    }
    if url.contains("://") {
        return Err(anyhow!("unsupported frame source '{}'", url));
    }
    Ok(Box::new(FileSource::new(url, settings)?))
}

/// Check the JPEG start-of-image marker.
pub(crate) fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0] == 0xFF && bytes[1] == 0xD8
}
