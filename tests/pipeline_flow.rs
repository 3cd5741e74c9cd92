use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;

use trashcam::ingest::StubSource;
use trashcam::transport::ReplayStep;
use trashcam::{
    ApiTarget, ClassificationOutcome, Command, FilesystemFrameStore, InMemoryFrameStore,
    LocalFailure, PipelineController, PipelineSettings, ReplayConnector, ResolutionProfile,
    ResponseLimits, SourceSettings, TriggerError,
};

const SUCCESS: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: application/json; charset=UTF-8\r\n\
Transfer-Encoding: chunked\r\n\
\r\n\
7b\r\n\
{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"A crumpled aluminium can\"}],\"role\":\"model\"}}]}\r\n\
0\r\n\r\n";

fn target() -> ApiTarget {
    ApiTarget::new(
        "generativelanguage.googleapis.com",
        443,
        "gemini-1.5-flash",
        "test-key-42",
    )
    .expect("target")
}

fn stub(settings: SourceSettings) -> Box<StubSource> {
    Box::new(StubSource::new("stub://bench", settings))
}

fn split_request(raw: &[u8]) -> (String, Vec<u8>) {
    let pos = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    (
        String::from_utf8(raw[..pos].to_vec()).expect("utf8 head"),
        raw[pos + 4..].to_vec(),
    )
}

#[test]
fn capture_uploads_exact_request_and_publishes_success() {
    let connector = ReplayConnector::from_response(SUCCESS);
    let store = InMemoryFrameStore::new();
    let mut controller = PipelineController::new(
        stub(SourceSettings::default()),
        Box::new(store.clone()),
        Box::new(connector.clone()),
        target(),
        PipelineSettings::default(),
    );
    let preview = controller.preview();

    let outcome = controller.capture_now();
    assert_eq!(
        outcome,
        ClassificationOutcome::Success("A crumpled aluminium can".into())
    );

    let (head, body) = split_request(&connector.written());
    let mut lines = head.split("\r\n");
    assert_eq!(
        lines.next(),
        Some("POST /v1beta/models/gemini-1.5-flash:generateContent?key=test-key-42 HTTP/1.1")
    );
    let headers: Vec<&str> = lines.collect();
    assert!(headers.contains(&"Host: generativelanguage.googleapis.com"));
    assert!(headers.contains(&"Connection: close"));
    assert!(headers.contains(&"Content-Type: application/json"));
    let content_length = format!("Content-Length: {}", body.len());
    assert!(headers.contains(&content_length.as_str()));

    let doc: serde_json::Value = serde_json::from_slice(&body).expect("json body");
    let parts = &doc["contents"][0]["parts"];
    assert_eq!(
        parts[0]["text"],
        "I want a short answer for what do you see in the image"
    );
    assert_eq!(parts[1]["inline_data"]["mime_type"], "image/jpeg");
    assert_eq!(doc["generationConfig"]["maxOutputTokens"], 100);

    let frame = preview.latest_frame().expect("retained frame");
    let uploaded = base64::engine::general_purpose::STANDARD
        .decode(parts[1]["inline_data"]["data"].as_str().expect("data"))
        .expect("base64");
    assert_eq!(uploaded, frame.bytes());

    assert!(preview.new_image_available());
    assert_eq!(preview.last_outcome(), Some(outcome));
    assert!(store.is_empty());
}

#[test]
fn api_error_is_published_as_last_result() {
    let response = b"HTTP/1.1 400 Bad Request\r\n\r\n\
{\"error\":{\"code\":400,\"message\":\"API key not valid. Please pass a valid API key.\",\"status\":\"INVALID_ARGUMENT\"}}";
    let mut controller = PipelineController::new(
        stub(SourceSettings::default()),
        Box::new(InMemoryFrameStore::new()),
        Box::new(ReplayConnector::from_response(response)),
        target(),
        PipelineSettings::default(),
    );
    let outcome = controller.capture_now();
    assert_eq!(
        outcome.to_string(),
        "API Error: API key not valid. Please pass a valid API key."
    );
    assert_eq!(controller.stats().api_errors, 1);
}

#[test]
fn header_stall_times_out_and_cleans_up() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let connector = ReplayConnector::new(vec![
        ReplayStep::data(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n"),
        ReplayStep::Stall(Duration::from_secs(30)),
    ]);
    let mut settings = PipelineSettings::default();
    settings.upload.limits = ResponseLimits {
        header_timeout: Duration::from_millis(150),
        ..ResponseLimits::default()
    };
    let mut controller = PipelineController::new(
        stub(SourceSettings::default()),
        Box::new(FilesystemFrameStore::open(dir.path())?),
        Box::new(connector),
        target(),
        settings,
    );

    let started = Instant::now();
    let outcome = controller.capture_now();
    assert_eq!(outcome, ClassificationOutcome::from(LocalFailure::HeaderTimeout));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn oversized_body_is_rejected() {
    let mut response = b"HTTP/1.1 200 OK\r\n\r\n{\"candidates\":\"".to_vec();
    response.extend(std::iter::repeat(b'x').take(4096));
    let mut settings = PipelineSettings::default();
    settings.upload.limits.max_response_bytes = 1024;
    let mut controller = PipelineController::new(
        stub(SourceSettings::default()),
        Box::new(InMemoryFrameStore::new()),
        Box::new(ReplayConnector::from_response(&response)),
        target(),
        settings,
    );
    assert_eq!(
        controller.capture_now(),
        ClassificationOutcome::LocalFailure(LocalFailure::ResponseTooLarge)
    );
}

#[test]
fn body_without_json_reports_no_json() {
    let mut controller = PipelineController::new(
        stub(SourceSettings::default()),
        Box::new(InMemoryFrameStore::new()),
        Box::new(ReplayConnector::from_response(
            b"HTTP/1.1 502 Bad Gateway\r\n\r\nupstream unavailable",
        )),
        target(),
        PipelineSettings::default(),
    );
    assert_eq!(
        controller.capture_now().to_string(),
        LocalFailure::NoJson.to_string()
    );
}

#[test]
fn second_capture_rejected_while_first_in_flight() {
    let source = StubSource::new("stub://slow", SourceSettings::default())
        .with_delay(Duration::from_millis(300));
    let stats = source.stats();
    let mut settings = PipelineSettings::default();
    settings.flush_stale = false;
    let mut controller = PipelineController::new(
        Box::new(source),
        Box::new(InMemoryFrameStore::new()),
        Box::new(ReplayConnector::from_response(SUCCESS)),
        target(),
        settings,
    );
    let preview = controller.preview();
    let (trigger, commands) = controller.trigger();
    let shutdown = Arc::new(AtomicBool::new(false));
    let loop_shutdown = shutdown.clone();
    let worker = thread::spawn(move || {
        controller.run(commands, loop_shutdown);
        controller
    });

    trigger.capture().expect("first capture accepted");
    assert_eq!(trigger.capture(), Err(TriggerError::Busy));
    assert_eq!(
        trigger.submit(Command::SwitchProfileThenCapture(ResolutionProfile::Vga)),
        Err(TriggerError::Busy)
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while trigger.is_busy() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(!trigger.is_busy());
    assert_eq!(preview.stats().runs, 1);
    assert_eq!(stats.outstanding(), 0);

    trigger
        .submit(Command::SwitchProfileThenCapture(ResolutionProfile::Vga))
        .expect("accepted once idle");
    let deadline = Instant::now() + Duration::from_secs(10);
    while preview.stats().runs < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }

    shutdown.store(true, Ordering::SeqCst);
    let controller = worker.join().expect("controller thread");
    assert_eq!(controller.stats().runs, 2);
    assert_eq!(controller.profile(), ResolutionProfile::Vga);
    assert_eq!(
        preview.latest_frame().expect("frame").profile(),
        ResolutionProfile::Vga
    );
}
