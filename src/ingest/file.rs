//! Local snapshot file source.
//!
//! Re-reads one JPEG file on every acquisition, so an external process can
//! keep replacing it. Geometry cannot be changed here; `reconfigure` only
//! records the requested settings.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{looks_like_jpeg, FrameSource, SourceFrame, MAX_FRAME_BYTES};
use crate::frame::{FrameFormat, SourceSettings};

pub struct FileSource {
    path: PathBuf,
    settings: SourceSettings,
    frames_read: u64,
}

impl FileSource {
    pub fn new(path: &str, settings: SourceSettings) -> Result<Self> {
        if path.trim().is_empty() {
            return Err(anyhow!("file source path is empty"));
        }
        let path = PathBuf::from(path);
        if !path.exists() {
            log::warn!(
                "FileSource: {} does not exist yet; captures fail until it does",
                path.display()
            );
        }
        Ok(Self {
            path,
            settings,
            frames_read: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for FileSource {
    fn acquire_frame(&mut self, _timeout: Duration) -> Result<Option<SourceFrame>> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("failed to open snapshot {}", self.path.display()))?;
        let mut data = Vec::new();
        file.take(MAX_FRAME_BYTES as u64 + 1)
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read snapshot {}", self.path.display()))?;
        if data.len() > MAX_FRAME_BYTES {
            return Err(anyhow!(
                "snapshot {} exceeds {} bytes",
                self.path.display(),
                MAX_FRAME_BYTES
            ));
        }
        if !looks_like_jpeg(&data) {
            return Err(anyhow!("snapshot {} is not a JPEG", self.path.display()));
        }
        self.frames_read += 1;
        Ok(Some(SourceFrame::new(data, FrameFormat::Jpeg)))
    }

    fn release_frame(&mut self, frame: SourceFrame) {
        drop(frame);
    }

    fn reconfigure(&mut self, settings: &SourceSettings) -> Result<()> {
        settings.validate()?;
        log::debug!(
            "FileSource: {} cannot change geometry; recording {}",
            self.path.display(),
            settings.profile
        );
        self.settings = *settings;
        Ok(())
    }

    fn settings(&self) -> SourceSettings {
        self.settings
    }

    fn describe(&self) -> String {
        format!("file {} ({} frames read)", self.path.display(), self.frames_read)
    }
}
