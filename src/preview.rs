//! Read-only view of the last capture for the preview server.
//!
//! The controller is the only writer. Readers get `Arc` clones of the
//! retained frame, so a frame they hold stays valid after the controller
//! moves on; the slot itself is replaced swap-then-free.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::frame::{CapturedFrame, ResolutionProfile};
use crate::outcome::ClassificationOutcome;
use crate::pipeline::PipelineStats;

#[derive(Default)]
struct Shared {
    frame: RwLock<Option<Arc<CapturedFrame>>>,
    outcome: RwLock<Option<ClassificationOutcome>>,
    stats: RwLock<PipelineStats>,
    profile: RwLock<ResolutionProfile>,
    new_image: AtomicBool,
    busy: Arc<AtomicBool>,
}

// A panicking reader cannot leave these values half-written, so poisoning is
// ignored rather than propagated.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writer side, owned by the pipeline controller.
pub struct PreviewState {
    shared: Arc<Shared>,
}

impl PreviewState {
    pub fn new(profile: ResolutionProfile) -> Self {
        let shared = Shared::default();
        *write(&shared.profile) = profile;
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn handle(&self) -> PreviewHandle {
        PreviewHandle {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn busy_flag(&self) -> Arc<AtomicBool> {
        self.shared.busy.clone()
    }

    /// Drop the retained frame ahead of a new capture. The "new image" flag
    /// goes with it.
    pub(crate) fn retire_frame(&self) {
        let previous = {
            let mut slot = write(&self.shared.frame);
            self.shared.new_image.store(false, Ordering::SeqCst);
            slot.take()
        };
        drop(previous);
    }

    /// Install `frame`; the previous one is released only after the swap.
    pub(crate) fn publish_frame(&self, frame: Arc<CapturedFrame>) {
        let previous = write(&self.shared.frame).replace(frame);
        self.shared.new_image.store(true, Ordering::SeqCst);
        drop(previous);
    }

    pub(crate) fn publish_outcome(&self, outcome: ClassificationOutcome, stats: PipelineStats) {
        *write(&self.shared.outcome) = Some(outcome);
        *write(&self.shared.stats) = stats;
    }

    pub(crate) fn set_profile(&self, profile: ResolutionProfile) {
        *write(&self.shared.profile) = profile;
    }
}

/// Point-in-time copy of everything the preview surface shows.
#[derive(Clone, Debug, Serialize)]
pub struct PreviewSnapshot {
    pub sequence: Option<u64>,
    pub frame_bytes: Option<usize>,
    pub fingerprint: Option<String>,
    pub profile: String,
    pub outcome_kind: Option<&'static str>,
    pub outcome: Option<String>,
    pub reason_code: Option<String>,
    pub new_image: bool,
    pub busy: bool,
    pub stats: PipelineStats,
}

/// Reader side. Cheap to clone; cannot mutate anything except the
/// consumer-owned "new image" flag.
#[derive(Clone)]
pub struct PreviewHandle {
    shared: Arc<Shared>,
}

impl PreviewHandle {
    pub fn latest_frame(&self) -> Option<Arc<CapturedFrame>> {
        read(&self.shared.frame).clone()
    }

    pub fn last_outcome(&self) -> Option<ClassificationOutcome> {
        read(&self.shared.outcome).clone()
    }

    pub fn stats(&self) -> PipelineStats {
        *read(&self.shared.stats)
    }

    pub fn profile(&self) -> ResolutionProfile {
        *read(&self.shared.profile)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    pub fn new_image_available(&self) -> bool {
        self.shared.new_image.load(Ordering::SeqCst)
    }

    pub fn clear_new_image(&self) {
        self.shared.new_image.store(false, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PreviewSnapshot {
        let frame = self.latest_frame();
        let outcome = self.last_outcome();
        PreviewSnapshot {
            sequence: frame.as_ref().map(|f| f.sequence()),
            frame_bytes: frame.as_ref().map(|f| f.len()),
            fingerprint: frame.as_ref().map(|f| f.fingerprint()),
            profile: self.profile().to_string(),
            outcome_kind: outcome.as_ref().map(|o| o.kind()),
            outcome: outcome.as_ref().map(|o| o.to_string()),
            reason_code: outcome.as_ref().and_then(|o| o.reason_code()),
            new_image: self.new_image_available(),
            busy: self.is_busy(),
            stats: self.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;

    fn frame(sequence: u64) -> Arc<CapturedFrame> {
        Arc::new(
            CapturedFrame::new(
                vec![0xFF, 0xD8, sequence as u8, 0xFF, 0xD9],
                FrameFormat::Jpeg,
                sequence,
                ResolutionProfile::Cif,
            )
            .unwrap(),
        )
    }

    #[test]
    fn publish_sets_new_image_flag() {
        let state = PreviewState::new(ResolutionProfile::Cif);
        let handle = state.handle();
        assert!(!handle.new_image_available());

        state.publish_frame(frame(1));
        assert!(handle.new_image_available());
        handle.clear_new_image();
        assert!(!handle.new_image_available());
        assert_eq!(handle.latest_frame().unwrap().sequence(), 1);
    }

    #[test]
    fn reader_keeps_superseded_frame_alive() {
        let state = PreviewState::new(ResolutionProfile::Cif);
        let handle = state.handle();
        state.publish_frame(frame(1));
        let held = handle.latest_frame().unwrap();

        state.retire_frame();
        state.publish_frame(frame(2));

        assert_eq!(held.sequence(), 1);
        assert_eq!(held.bytes()[2], 1);
        assert_eq!(handle.latest_frame().unwrap().sequence(), 2);
    }

    #[test]
    fn swap_releases_previous_frame() {
        let state = PreviewState::new(ResolutionProfile::Cif);
        let first = frame(1);
        let weak = Arc::downgrade(&first);
        state.publish_frame(first);
        state.publish_frame(frame(2));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn snapshot_reports_outcome_and_stats() {
        let state = PreviewState::new(ResolutionProfile::Vga);
        let handle = state.handle();
        let mut stats = PipelineStats::default();
        let outcome = ClassificationOutcome::Success("cardboard".into());
        stats.record(&outcome);
        state.publish_outcome(outcome, stats);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.outcome.as_deref(), Some("cardboard"));
        assert_eq!(snapshot.outcome_kind, Some("success"));
        assert_eq!(snapshot.stats.successes, 1);
        assert!(snapshot.profile.starts_with("VGA"));
        assert!(snapshot.sequence.is_none());
    }
}
