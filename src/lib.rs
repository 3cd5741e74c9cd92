//! Trash camera
//!
//! Captures one still frame, uploads it to a Gemini `generateContent`
//! endpoint over TLS, and turns the reply into a short classification.
//!
//! # Pipeline
//!
//! 1. **Capture**: a `FrameSource` lends a JPEG buffer; it is copied into the
//!    single owned `CapturedFrame` and the loan is returned.
//! 2. **Store**: a temporary copy goes to the `FrameStore` and is removed
//!    once classification finishes.
//! 3. **Encode / Build**: base64 payload inside a fixed JSON body with an
//!    exact `Content-Length`.
//! 4. **Transport**: one request per connection, `Connection: close`.
//! 5. **Read / Extract**: headers skipped under a fixed deadline, body read
//!    until close or idle timeout, first balanced `{...}` extracted.
//! 6. **Classify**: `error.message`, first candidate text, or a local failure.
//!
//! Every failure is a `ClassificationOutcome`, never a panic. The last frame
//! and outcome are readable through a `PreviewHandle`.
//!
//! # Module Structure
//!
//! - `frame`: CapturedFrame, ResolutionProfile, SourceSettings
//! - `ingest`: frame sources (stub, file, ESP32 web camera)
//! - `storage`: temporary on-device copies
//! - `encode`, `request`, `transport`, `response`, `classify`: upload stages
//! - `pipeline`, `preview`: controller, triggers, read-only state
//! - `api`: loopback preview server
//! - `config`, `ui`: ambient pieces for the binaries

pub mod api;
pub mod classify;
pub mod config;
pub mod encode;
pub mod frame;
pub mod ingest;
pub mod outcome;
pub mod pipeline;
pub mod preview;
pub mod request;
pub mod response;
pub mod storage;
pub mod transport;
pub mod ui;

pub use classify::classify;
pub use encode::{encode_frame, EncodeError, EncodedPayload};
pub use frame::{CapturedFrame, FrameFormat, ResolutionProfile, SourceSettings};
pub use ingest::{open_source, FrameSource, SourceFrame};
pub use outcome::{ClassificationOutcome, LocalFailure};
pub use pipeline::{
    upload_frame, CaptureTrigger, Command, PipelineController, PipelineSettings, PipelineStats,
    Stage, TriggerError, UploadSettings,
};
pub use preview::{PreviewHandle, PreviewSnapshot};
pub use request::{build_request, ApiTarget, UploadRequest};
pub use response::{extract_json, BraceScan, RawResponse, ResponseLimits, ResponseReader};
pub use storage::{FilesystemFrameStore, FrameStore, InMemoryFrameStore, StoredFrame};
pub use transport::{Connector, ReplayConnector, TlsConnector, TlsVerification};
