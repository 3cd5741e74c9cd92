//! Synthetic frame source (`stub://`).
//!
//! Produces JPEG-shaped buffers (SOI marker, random body, EOI marker) whose
//! size follows the configured geometry and quality. An optional acquisition
//! delay simulates a slow sensor; it still honours the caller's timeout.

use anyhow::{anyhow, Result};
use rand::RngCore;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{FrameSource, SourceFrame};
use crate::frame::{FrameFormat, SourceSettings};

/// Counters shared with whoever created the source.
#[derive(Debug, Default)]
pub struct StubStats {
    pub frames_acquired: AtomicU64,
    pub frames_released: AtomicU64,
    pub reconfigurations: AtomicU64,
    outstanding: AtomicUsize,
}

impl StubStats {
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

pub struct StubSource {
    url: String,
    settings: SourceSettings,
    delay: Duration,
    fail: bool,
    stats: Arc<StubStats>,
}

impl StubSource {
    pub fn new(url: &str, settings: SourceSettings) -> Self {
        log::info!("StubSource: {} ready at {}", url, settings.profile);
        Self {
            url: url.to_string(),
            settings,
            delay: Duration::ZERO,
            fail: false,
            stats: Arc::new(StubStats::default()),
        }
    }

    /// Every acquisition takes this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every acquisition comes back empty, like a sensor that never delivers.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn stats(&self) -> Arc<StubStats> {
        self.stats.clone()
    }

    fn synthetic_jpeg(&self) -> Vec<u8> {
        let (w, h) = self.settings.profile.dimensions();
        let quality = self.settings.compression_quality as usize;
        let body_len = ((w * h) as usize / 16 / (1 + quality / 8)).max(64);

        let mut data = Vec::with_capacity(body_len + 4);
        data.extend_from_slice(&[0xFF, 0xD8]);
        let mut body = vec![0u8; body_len];
        rand::thread_rng().fill_bytes(&mut body);
        data.extend_from_slice(&body);
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }
}

impl FrameSource for StubSource {
    fn acquire_frame(&mut self, timeout: Duration) -> Result<Option<SourceFrame>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay.min(timeout));
            if self.delay > timeout {
                return Ok(None);
            }
        }
        if self.fail {
            return Ok(None);
        }
        if self.stats.outstanding() >= self.settings.buffer_count as usize {
            return Err(anyhow!(
                "all {} frame buffers are on loan",
                self.settings.buffer_count
            ));
        }
        self.stats.outstanding.fetch_add(1, Ordering::SeqCst);
        self.stats.frames_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Some(SourceFrame::new(self.synthetic_jpeg(), FrameFormat::Jpeg)))
    }

    fn release_frame(&mut self, frame: SourceFrame) {
        drop(frame);
        self.stats.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.stats.frames_released.fetch_add(1, Ordering::SeqCst);
    }

    fn reconfigure(&mut self, settings: &SourceSettings) -> Result<()> {
        settings.validate()?;
        if self.stats.outstanding() > 0 {
            return Err(anyhow!("cannot reconfigure while frames are on loan"));
        }
        self.settings = *settings;
        self.stats.reconfigurations.fetch_add(1, Ordering::SeqCst);
        log::info!("StubSource: {} reconfigured to {}", self.url, settings.profile);
        Ok(())
    }

    fn settings(&self) -> SourceSettings {
        self.settings
    }

    fn describe(&self) -> String {
        format!("{} (synthetic, {})", self.url, self.settings.profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ResolutionProfile;
    use crate::ingest::looks_like_jpeg;

    #[test]
    fn frames_are_jpeg_shaped() {
        let mut source = StubSource::new("stub://test", SourceSettings::default());
        let frame = source.acquire_frame(Duration::from_secs(1)).unwrap().unwrap();
        assert!(looks_like_jpeg(frame.bytes()));
        assert_eq!(&frame.bytes()[frame.len() - 2..], &[0xFF, 0xD9]);
        source.release_frame(frame);
    }

    #[test]
    fn buffer_count_limits_loans() {
        let mut source = StubSource::new("stub://test", SourceSettings::default());
        let stats = source.stats();
        let first = source.acquire_frame(Duration::from_secs(1)).unwrap().unwrap();
        assert!(source.acquire_frame(Duration::from_secs(1)).is_err());
        source.release_frame(first);
        assert_eq!(stats.outstanding(), 0);
        assert!(source.acquire_frame(Duration::from_secs(1)).unwrap().is_some());
    }

    #[test]
    fn reconfigure_refused_while_on_loan() {
        let mut source = StubSource::new("stub://test", SourceSettings::default());
        let frame = source.acquire_frame(Duration::from_secs(1)).unwrap().unwrap();
        let vga = SourceSettings::for_profile(ResolutionProfile::Vga);
        assert!(source.reconfigure(&vga).is_err());
        source.release_frame(frame);
        source.reconfigure(&vga).unwrap();
        assert_eq!(source.settings().profile, ResolutionProfile::Vga);
    }

    #[test]
    fn delay_longer_than_timeout_yields_none() {
        let mut source = StubSource::new("stub://slow", SourceSettings::default())
            .with_delay(Duration::from_millis(200));
        assert!(source
            .acquire_frame(Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn larger_profiles_produce_larger_frames() {
        let mut small = StubSource::new("stub://a", SourceSettings::for_profile(ResolutionProfile::Qvga));
        let mut large = StubSource::new("stub://b", SourceSettings::for_profile(ResolutionProfile::Uxga));
        let a = small.acquire_frame(Duration::from_secs(1)).unwrap().unwrap();
        let b = large.acquire_frame(Duration::from_secs(1)).unwrap().unwrap();
        assert!(b.len() > a.len());
    }
}
