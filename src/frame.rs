//! Captured frame ownership and resolution presets.
//!
//! - `CapturedFrame`: the single in-memory JPEG owned by the pipeline. Bytes are
//!   zeroized on drop, so a superseded frame cannot be read after release.
//! - `ResolutionProfile`: the eight fixed geometry presets a camera supports.
//! - `SourceSettings`: profile + compression quality + driver buffer count.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::time::Instant;
use zeroize::Zeroize;

/// Highest (coarsest) JPEG quality value the camera driver accepts.
pub const MAX_COMPRESSION_QUALITY: u8 = 63;

// ----------------------------------------------------------------------------
// FrameFormat
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameFormat {
    #[default]
    Jpeg,
}

impl FrameFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
        }
    }
}

// ----------------------------------------------------------------------------
// CapturedFrame
// ----------------------------------------------------------------------------

/// One encoded camera frame.
///
/// There is deliberately no `Clone`: the pipeline owns exactly one frame at a
/// time and shares it read-only through `Arc`.
pub struct CapturedFrame {
    data: Vec<u8>,
    format: FrameFormat,
    sequence: u64,
    profile: ResolutionProfile,
    captured_at: Instant,
}

impl CapturedFrame {
    /// Take ownership of encoded bytes. Empty buffers are rejected.
    pub fn new(
        data: Vec<u8>,
        format: FrameFormat,
        sequence: u64,
        profile: ResolutionProfile,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(anyhow!("captured frame #{} is empty", sequence));
        }
        Ok(Self {
            data,
            format,
            sequence,
            profile,
            captured_at: Instant::now(),
        })
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

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn profile(&self) -> ResolutionProfile {
        self.profile
    }

    pub fn age_secs(&self) -> u64 {
        self.captured_at.elapsed().as_secs()
    }

    /// SHA-256 of the encoded bytes, hex encoded.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.data))
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .field("format", &self.format)
            .field("profile", &self.profile)
            .finish()
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

// ----------------------------------------------------------------------------
// ResolutionProfile
// ----------------------------------------------------------------------------

/// Fixed frame geometry presets, selectable by index 1-8.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResolutionProfile {
    Qvga,
    #[default]
    Cif,
    Hvga,
    Vga,
    Svga,
    Xga,
    Sxga,
    Uxga,
}

impl ResolutionProfile {
    pub const ALL: [ResolutionProfile; 8] = [
        Self::Qvga,
        Self::Cif,
        Self::Hvga,
        Self::Vga,
        Self::Svga,
        Self::Xga,
        Self::Sxga,
        Self::Uxga,
    ];

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            1..=8 => Some(Self::ALL[(index - 1) as usize]),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            Self::Qvga => 1,
            Self::Cif => 2,
            Self::Hvga => 3,
            Self::Vga => 4,
            Self::Svga => 5,
            Self::Xga => 6,
            Self::Sxga => 7,
            Self::Uxga => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Qvga => "QVGA",
            Self::Cif => "CIF",
            Self::Hvga => "HVGA",
            Self::Vga => "VGA",
            Self::Svga => "SVGA",
            Self::Xga => "XGA",
            Self::Sxga => "SXGA",
            Self::Uxga => "UXGA",
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Qvga => (320, 240),
            Self::Cif => (400, 296),
            Self::Hvga => (480, 320),
            Self::Vga => (640, 480),
            Self::Svga => (800, 600),
            Self::Xga => (1024, 768),
            Self::Sxga => (1280, 1024),
            Self::Uxga => (1600, 1200),
        }
    }

    /// `framesize` code understood by the ESP32 camera driver.
    pub fn driver_code(&self) -> u8 {
        match self {
            Self::Qvga => 5,
            Self::Cif => 6,
            Self::Hvga => 7,
            Self::Vga => 8,
            Self::Svga => 9,
            Self::Xga => 10,
            Self::Sxga => 12,
            Self::Uxga => 13,
        }
    }

    /// Larger frames get coarser compression so they fit the upload budget.
    pub fn default_quality(&self) -> u8 {
        match self {
            Self::Qvga | Self::Cif | Self::Hvga => 30,
            Self::Vga | Self::Svga => 35,
            Self::Xga => 40,
            Self::Sxga | Self::Uxga => 45,
        }
    }
}

impl FromStr for ResolutionProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(index) = trimmed.parse::<u8>() {
            return Self::from_index(index)
                .ok_or_else(|| anyhow!("resolution profile index {} out of range 1-8", index));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|profile| profile.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| anyhow!("unknown resolution profile '{}'", trimmed))
    }
}

impl std::fmt::Display for ResolutionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "{} ({}x{})", self.name(), w, h)
    }
}

// ----------------------------------------------------------------------------
// SourceSettings
// ----------------------------------------------------------------------------

/// Frame source configuration. Lower `compression_quality` means better images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceSettings {
    pub profile: ResolutionProfile,
    pub compression_quality: u8,
    pub buffer_count: u8,
}

impl SourceSettings {
    pub fn for_profile(profile: ResolutionProfile) -> Self {
        Self {
            profile,
            compression_quality: profile.default_quality(),
            buffer_count: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression_quality > MAX_COMPRESSION_QUALITY {
            return Err(anyhow!(
                "compression quality {} out of range 0-{}",
                self.compression_quality,
                MAX_COMPRESSION_QUALITY
            ));
        }
        if self.buffer_count == 0 {
            return Err(anyhow!("frame buffer count must be at least 1"));
        }
        Ok(())
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self::for_profile(ResolutionProfile::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_is_rejected() {
        let result = CapturedFrame::new(Vec::new(), FrameFormat::Jpeg, 1, ResolutionProfile::Cif);
        assert!(result.is_err());
    }

    #[test]
    fn frame_exposes_bytes_and_fingerprint() {
        let frame =
            CapturedFrame::new(b"jpeg".to_vec(), FrameFormat::Jpeg, 7, ResolutionProfile::Vga)
                .unwrap();
        assert_eq!(frame.bytes(), b"jpeg");
        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.format().mime_type(), "image/jpeg");
        assert_eq!(frame.fingerprint().len(), 64);
    }

    #[test]
    fn profiles_round_trip_by_index() {
        for (i, profile) in ResolutionProfile::ALL.iter().enumerate() {
            assert_eq!(profile.index() as usize, i + 1);
            assert_eq!(ResolutionProfile::from_index(profile.index()), Some(*profile));
        }
        assert_eq!(ResolutionProfile::from_index(0), None);
        assert_eq!(ResolutionProfile::from_index(9), None);
    }

    #[test]
    fn profile_parses_names_and_indices() {
        assert_eq!("2".parse::<ResolutionProfile>().unwrap(), ResolutionProfile::Cif);
        assert_eq!("vga".parse::<ResolutionProfile>().unwrap(), ResolutionProfile::Vga);
        assert!("9".parse::<ResolutionProfile>().is_err());
        assert!("4k".parse::<ResolutionProfile>().is_err());
    }

    #[test]
    fn default_profile_is_cif() {
        let settings = SourceSettings::default();
        assert_eq!(settings.profile, ResolutionProfile::Cif);
        assert_eq!(settings.profile.dimensions(), (400, 296));
        assert_eq!(settings.compression_quality, 30);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn settings_validation_rejects_out_of_range() {
        let mut settings = SourceSettings::default();
        settings.compression_quality = 64;
        assert!(settings.validate().is_err());

        let mut settings = SourceSettings::default();
        settings.buffer_count = 0;
        assert!(settings.validate().is_err());
    }
}
