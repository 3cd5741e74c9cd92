//! Capture-to-classification pipeline.
//!
//! One run: acquire -> retain for preview -> store copy -> encode -> build
//! request -> connect/write -> read response -> extract JSON -> classify ->
//! remove stored copy -> publish outcome.
//!
//! The controller is driven from a single thread. Other threads reach it only
//! through a `CaptureTrigger` (commands) and a `PreviewHandle` (reads).
//!
//! The controller MUST NOT:
//! - Start a run while another is in flight
//! - Reconfigure the source while a frame from the old settings is in use
//! - Turn a pipeline failure into a panic or an `Err`; failures are outcomes

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::classify::classify;
use crate::encode::encode_frame;
use crate::frame::{CapturedFrame, ResolutionProfile, SourceSettings};
use crate::ingest::FrameSource;
use crate::outcome::{ClassificationOutcome, LocalFailure};
use crate::preview::{PreviewHandle, PreviewState};
use crate::request::{build_request, ApiTarget, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_PROMPT};
use crate::response::{extract_json, BraceScan, ResponseLimits, ResponseReader};
use crate::storage::{FrameStore, StoredFrame};
use crate::transport::{ChannelReader, Connector};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_POLL: Duration = Duration::from_millis(100);

// ----------------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------------

/// Everything one upload needs besides the frame and the target.
#[derive(Clone, Debug)]
pub struct UploadSettings {
    pub prompt: String,
    pub max_output_tokens: u32,
    pub connect_timeout: Duration,
    pub limits: ResponseLimits,
    pub brace_scan: BraceScan,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            limits: ResponseLimits::default(),
            brace_scan: BraceScan::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub upload: UploadSettings,
    pub capture_timeout: Duration,
    /// Acquire and drop one frame before each capture so the result is fresh.
    pub flush_stale: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            upload: UploadSettings::default(),
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            flush_stale: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub runs: u64,
    pub successes: u64,
    pub api_errors: u64,
    pub local_failures: u64,
}

impl PipelineStats {
    pub fn record(&mut self, outcome: &ClassificationOutcome) {
        self.runs += 1;
        match outcome {
            ClassificationOutcome::Success(_) => self.successes += 1,
            ClassificationOutcome::ApiError(_) => self.api_errors += 1,
            ClassificationOutcome::LocalFailure(_) => self.local_failures += 1,
        }
    }
}

// ----------------------------------------------------------------------------
// Upload stages
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Encode,
    Connect,
    Send,
    Receive,
    Classify,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Encode => "encode frame",
            Self::Connect => "connect",
            Self::Send => "send request",
            Self::Receive => "read response",
            Self::Classify => "classify",
        }
    }
}

/// Encode, send and classify one frame. Every failure comes back as an
/// outcome. `on_stage` is told when each stage starts.
pub fn upload_frame(
    frame: &CapturedFrame,
    target: &ApiTarget,
    settings: &UploadSettings,
    connector: &dyn Connector,
    on_stage: &mut dyn FnMut(Stage),
) -> ClassificationOutcome {
    match try_upload(frame, target, settings, connector, on_stage) {
        Ok(outcome) => outcome,
        Err(failure) => failure.into(),
    }
}

fn try_upload(
    frame: &CapturedFrame,
    target: &ApiTarget,
    settings: &UploadSettings,
    connector: &dyn Connector,
    on_stage: &mut dyn FnMut(Stage),
) -> Result<ClassificationOutcome, LocalFailure> {
    on_stage(Stage::Encode);
    let payload = encode_frame(frame.bytes()).map_err(|err| {
        log::warn!("frame #{} encoding failed: {}", frame.sequence(), err);
        LocalFailure::Encoding
    })?;
    let request = build_request(
        &settings.prompt,
        frame.format().mime_type(),
        payload,
        settings.max_output_tokens,
        target,
    )
    .map_err(|err| {
        log::warn!("request build failed: {}", err);
        LocalFailure::Encoding
    })?;
    log::debug!(
        "POST {} ({} body bytes)",
        request.redacted_path(),
        request.content_length()
    );

    on_stage(Stage::Connect);
    let mut channel = connector
        .connect(request.host(), request.port(), settings.connect_timeout)
        .map_err(|err| {
            log::warn!("connect via {} failed: {:#}", connector.describe(), err);
            LocalFailure::Connection
        })?;

    on_stage(Stage::Send);
    request
        .write_to(channel.as_mut())
        .and_then(|()| channel.flush())
        .map_err(|err| {
            log::warn!("request write failed: {}", err);
            LocalFailure::Connection
        })?;
    drop(request);

    on_stage(Stage::Receive);
    let mut reader = ChannelReader::new(channel.as_mut());
    let mut response = ResponseReader::new(settings.limits);
    let raw = response.read(&mut reader)?;
    log::debug!(
        "response {:?}: {} body bytes",
        response.status_line().unwrap_or("<none>"),
        raw.len()
    );

    on_stage(Stage::Classify);
    let json = extract_json(raw.as_bytes(), settings.brace_scan)?;
    Ok(classify(json))
}

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Capture,
    SwitchProfileThenCapture(ResolutionProfile),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerError {
    /// A run is queued or in flight.
    Busy,
    /// The controller loop has exited.
    Closed,
}

impl std::fmt::Display for TriggerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => write!(f, "capture already in progress"),
            Self::Closed => write!(f, "pipeline stopped"),
        }
    }
}

impl std::error::Error for TriggerError {}

/// One line from the operator console.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorInput {
    Run(Command),
    Status,
    Quit,
}

impl std::str::FromStr for OperatorInput {
    type Err = anyhow::Error;

    /// Blank or `c` captures, `p <1-8>` switches profile then captures,
    /// `s` prints status, `q` quits.
    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let input = match words.next() {
            None | Some("c") => OperatorInput::Run(Command::Capture),
            Some("s") => OperatorInput::Status,
            Some("q") => OperatorInput::Quit,
            Some("p") => {
                let index = words
                    .next()
                    .ok_or_else(|| anyhow!("usage: p <1-8>"))?;
                let index: u8 = index
                    .parse()
                    .map_err(|_| anyhow!("profile index must be a number 1-8"))?;
                let profile = ResolutionProfile::from_index(index)
                    .ok_or_else(|| anyhow!("profile index {} out of range 1-8", index))?;
                OperatorInput::Run(Command::SwitchProfileThenCapture(profile))
            }
            Some(other) => return Err(anyhow!("unknown command '{}'", other)),
        };
        if words.next().is_some() {
            return Err(anyhow!("unexpected arguments in '{}'", line.trim()));
        }
        Ok(input)
    }
}

/// Submits commands to the controller loop. At most one command is accepted
/// until the controller finishes it.
#[derive(Clone)]
pub struct CaptureTrigger {
    sender: SyncSender<Command>,
    in_flight: Arc<AtomicBool>,
}

impl CaptureTrigger {
    pub fn submit(&self, command: Command) -> Result<(), TriggerError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TriggerError::Busy);
        }
        match self.sender.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.in_flight.store(false, Ordering::SeqCst);
                Err(TriggerError::Busy)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.store(false, Ordering::SeqCst);
                Err(TriggerError::Closed)
            }
        }
    }

    pub fn capture(&self) -> Result<(), TriggerError> {
        self.submit(Command::Capture)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

/// Removes the on-device copy when dropped, whatever the outcome.
struct StoredCopy<'a> {
    store: &'a mut dyn FrameStore,
    stored: StoredFrame,
}

impl Drop for StoredCopy<'_> {
    fn drop(&mut self) {
        match self.store.remove(&self.stored) {
            Ok(()) => log::debug!("removed stored copy {}", self.stored.location),
            Err(err) => log::warn!("stored copy cleanup failed: {:#}", err),
        }
    }
}

pub struct PipelineController {
    source: Box<dyn FrameSource>,
    store: Box<dyn FrameStore>,
    connector: Box<dyn Connector>,
    target: ApiTarget,
    settings: PipelineSettings,
    preview: PreviewState,
    stats: PipelineStats,
    next_sequence: u64,
    in_flight: Arc<AtomicBool>,
}

impl PipelineController {
    pub fn new(
        source: Box<dyn FrameSource>,
        store: Box<dyn FrameStore>,
        connector: Box<dyn Connector>,
        target: ApiTarget,
        settings: PipelineSettings,
    ) -> Self {
        let preview = PreviewState::new(source.settings().profile);
        let in_flight = preview.busy_flag();
        log::info!(
            "pipeline: source={} store={} transport={} target={}:{}",
            source.describe(),
            store.describe(),
            connector.describe(),
            target.host,
            target.port
        );
        Self {
            source,
            store,
            connector,
            target,
            settings,
            preview,
            stats: PipelineStats::default(),
            next_sequence: 1,
            in_flight,
        }
    }

    pub fn preview(&self) -> PreviewHandle {
        self.preview.handle()
    }

    /// A trigger plus the receiver to pass to `run`. The queue holds one command.
    pub fn trigger(&self) -> (CaptureTrigger, Receiver<Command>) {
        let (sender, receiver) = mpsc::sync_channel(1);
        (
            CaptureTrigger {
                sender,
                in_flight: self.in_flight.clone(),
            },
            receiver,
        )
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn profile(&self) -> ResolutionProfile {
        self.source.settings().profile
    }

    /// Run one full capture and publish its outcome.
    pub fn capture_now(&mut self) -> ClassificationOutcome {
        let started = Instant::now();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let outcome = self.run_once(sequence);

        self.stats.record(&outcome);
        self.preview.publish_outcome(outcome.clone(), self.stats);
        log::info!(
            "capture #{} finished in {} ms: {}",
            sequence,
            started.elapsed().as_millis(),
            outcome
        );
        outcome
    }

    fn run_once(&mut self, sequence: u64) -> ClassificationOutcome {
        self.preview.retire_frame();
        if self.settings.flush_stale {
            self.flush_stale();
        }

        let frame = match self.acquire(sequence) {
            Ok(frame) => Arc::new(frame),
            Err(err) => {
                log::warn!("capture #{} failed: {:#}", sequence, err);
                return LocalFailure::Capture.into();
            }
        };
        log::debug!(
            "captured #{} ({} bytes, {})",
            sequence,
            frame.len(),
            frame.profile()
        );
        self.preview.publish_frame(frame.clone());

        let stored = match self.store.persist(&frame) {
            Ok(stored) => stored,
            Err(err) => {
                log::warn!("storing frame #{} failed: {:#}", sequence, err);
                return LocalFailure::Storage.into();
            }
        };
        let _copy = StoredCopy {
            store: self.store.as_mut(),
            stored,
        };

        upload_frame(
            &frame,
            &self.target,
            &self.settings.upload,
            self.connector.as_ref(),
            &mut |stage| log::debug!("capture #{}: {}", sequence, stage.label()),
        )
    }

    fn acquire(&mut self, sequence: u64) -> Result<CapturedFrame> {
        let profile = self.source.settings().profile;
        let loaned = self
            .source
            .acquire_frame(self.settings.capture_timeout)?
            .ok_or_else(|| {
                anyhow!(
                    "no frame within {:?} from {}",
                    self.settings.capture_timeout,
                    self.source.describe()
                )
            })?;
        let data = loaned.bytes().to_vec();
        let format = loaned.format();
        self.source.release_frame(loaned);
        CapturedFrame::new(data, format, sequence, profile)
    }

    fn flush_stale(&mut self) {
        match self.source.acquire_frame(self.settings.capture_timeout) {
            Ok(Some(stale)) => self.source.release_frame(stale),
            Ok(None) => log::debug!("no stale frame to flush"),
            Err(err) => log::debug!("stale frame flush failed: {:#}", err),
        }
    }

    /// Reconfigure the source for `profile`. The retained preview frame is
    /// kept; it was fully copied out of the source before the switch.
    pub fn switch_profile(&mut self, profile: ResolutionProfile) -> Result<()> {
        let current = self.source.settings();
        if current.profile == profile {
            return Ok(());
        }
        let settings = SourceSettings {
            profile,
            compression_quality: profile.default_quality(),
            buffer_count: current.buffer_count,
        };
        self.source.reconfigure(&settings)?;
        self.preview.set_profile(profile);
        log::info!("profile switched to {}", profile);
        Ok(())
    }

    /// Execute one command and release the single-flight slot.
    pub fn handle(&mut self, command: Command) -> ClassificationOutcome {
        self.in_flight.store(true, Ordering::SeqCst);
        let outcome = match command {
            Command::Capture => self.capture_now(),
            Command::SwitchProfileThenCapture(profile) => match self.switch_profile(profile) {
                Ok(()) => self.capture_now(),
                Err(err) => {
                    log::warn!("profile switch to {} failed: {:#}", profile, err);
                    let outcome = ClassificationOutcome::from(LocalFailure::Capture);
                    self.stats.record(&outcome);
                    self.preview.publish_outcome(outcome.clone(), self.stats);
                    outcome
                }
            },
        };
        self.in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    /// Process commands until `shutdown` is set or every trigger is dropped.
    pub fn run(&mut self, commands: Receiver<Command>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            match commands.recv_timeout(COMMAND_POLL) {
                Ok(command) => {
                    self.handle(command);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::info!("pipeline loop stopped after {} runs", self.stats.runs);
    }
}
