use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::frame::CapturedFrame;

/// Where a frame copy was written. `location` is a path or an in-memory key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFrame {
    pub sequence: u64,
    pub location: String,
    pub len: usize,
}

pub trait FrameStore: Send {
    fn persist(&mut self, frame: &CapturedFrame) -> Result<StoredFrame>;

    fn remove(&mut self, stored: &StoredFrame) -> Result<()>;

    fn describe(&self) -> String;
}

/// Name of the on-device copy for one capture.
pub fn stored_file_name(frame: &CapturedFrame) -> String {
    format!("photo{}.{}", frame.sequence(), frame.format().extension())
}

// ----------------------------------------------------------------------------
// Filesystem
// ----------------------------------------------------------------------------

pub struct FilesystemFrameStore {
    root: PathBuf,
}

impl FilesystemFrameStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create frame store {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FrameStore for FilesystemFrameStore {
    fn persist(&mut self, frame: &CapturedFrame) -> Result<StoredFrame> {
        let name = stored_file_name(frame);
        let final_path = self.root.join(&name);
        let tmp_path = self.root.join(format!(".{}.tmp", name));

        let write = || -> Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(frame.bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &final_path)?;
            Ok(())
        };
        if let Err(err) = write() {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err.context(format!("failed to store {}", final_path.display())));
        }

        log::debug!("stored {} ({} bytes)", final_path.display(), frame.len());
        Ok(StoredFrame {
            sequence: frame.sequence(),
            location: final_path.to_string_lossy().into_owned(),
            len: frame.len(),
        })
    }

    fn remove(&mut self, stored: &StoredFrame) -> Result<()> {
        match std::fs::remove_file(&stored.location) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(anyhow!("failed to remove {}: {}", stored.location, err)),
        }
    }

    fn describe(&self) -> String {
        format!("filesystem {}", self.root.display())
    }
}

// ----------------------------------------------------------------------------
// In memory
// ----------------------------------------------------------------------------

/// Keeps copies in a shared map; clones see the same contents.
#[derive(Clone, Default)]
pub struct InMemoryFrameStore {
    frames: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_persist: bool,
}

impl InMemoryFrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every `persist` fails, like a full or missing disk.
    pub fn failing() -> Self {
        Self {
            fail_persist: true,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map(|frames| frames.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, location: &str) -> bool {
        self.frames
            .lock()
            .map(|frames| frames.contains_key(location))
            .unwrap_or(false)
    }
}

impl FrameStore for InMemoryFrameStore {
    fn persist(&mut self, frame: &CapturedFrame) -> Result<StoredFrame> {
        if self.fail_persist {
            return Err(anyhow!("in-memory store refuses writes"));
        }
        let location = stored_file_name(frame);
        let mut frames = self
            .frames
            .lock()
            .map_err(|_| anyhow!("frame store lock poisoned"))?;
        frames.insert(location.clone(), frame.bytes().to_vec());
        Ok(StoredFrame {
            sequence: frame.sequence(),
            location,
            len: frame.len(),
        })
    }

    fn remove(&mut self, stored: &StoredFrame) -> Result<()> {
        let mut frames = self
            .frames
            .lock()
            .map_err(|_| anyhow!("frame store lock poisoned"))?;
        frames.remove(&stored.location);
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}
