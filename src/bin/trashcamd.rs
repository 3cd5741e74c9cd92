//! trashcamd - trash camera daemon
//!
//! This daemon:
//! 1. Opens the frame source, the temporary frame store and the TLS connector
//! 2. Serves the read-only preview endpoint
//! 3. Reads operator commands from stdin and runs one capture per command
//! 4. Publishes each classification as the "last result"

use anyhow::Result;
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use trashcam::{
    api::{PreviewServer, PreviewServerConfig},
    config::TrashcamConfig,
    open_source,
    pipeline::OperatorInput,
    CaptureTrigger, FilesystemFrameStore, FrameStore, InMemoryFrameStore, PipelineController,
    PreviewHandle, TlsConnector, TriggerError,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "TRASHCAM_CONFIG")]
    config: Option<PathBuf>,
    /// Override the frame source URL.
    #[arg(long)]
    source: Option<String>,
    /// Do not start the preview server.
    #[arg(long)]
    no_preview: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = TrashcamConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        config.source.url = source;
    }
    if args.no_preview {
        config.preview_addr = None;
    }
    log::debug!("config: {:?}", config);

    let target = config.api_target()?;
    let source = open_source(&config.source.url, config.source.settings)?;
    let store: Box<dyn FrameStore> = match &config.store_dir {
        Some(dir) => Box::new(FilesystemFrameStore::open(dir)?),
        None => Box::new(InMemoryFrameStore::new()),
    };
    let connector = TlsConnector::new(config.tls.clone())?;

    let mut controller = PipelineController::new(
        source,
        store,
        Box::new(connector),
        target,
        config.pipeline_settings(),
    );
    let preview = controller.preview();

    let preview_server = match &config.preview_addr {
        Some(addr) => {
            let handle = PreviewServer::new(
                PreviewServerConfig { addr: addr.clone() },
                preview.clone(),
            )
            .spawn()?;
            log::info!("preview listening on http://{}", handle.addr);
            Some(handle)
        }
        None => None,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let ctrlc_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        ctrlc_shutdown.store(true, Ordering::SeqCst);
    })?;

    let (trigger, commands) = controller.trigger();
    let console_shutdown = shutdown.clone();
    std::thread::spawn(move || operator_console(trigger, preview, console_shutdown));

    log::info!("trashcamd running at {}", controller.profile());
    log::info!("commands: <enter>|c capture, p <1-8> switch profile + capture, s status, q quit");
    controller.run(commands, shutdown);

    log::info!("shutting down");
    if let Some(handle) = preview_server {
        handle.stop()?;
    }
    Ok(())
}

fn operator_console(trigger: CaptureTrigger, preview: PreviewHandle, shutdown: Arc<AtomicBool>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::warn!("operator console read failed: {}", err);
                break;
            }
        };
        match line.parse::<OperatorInput>() {
            Ok(OperatorInput::Run(command)) => match trigger.submit(command) {
                Ok(()) => {}
                Err(TriggerError::Busy) => println!("busy: capture already in progress"),
                Err(TriggerError::Closed) => break,
            },
            Ok(OperatorInput::Status) => print_status(&preview),
            Ok(OperatorInput::Quit) => {
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(err) => println!("{}", err),
        }
    }
    log::debug!("operator console closed");
}

fn print_status(preview: &PreviewHandle) {
    let snapshot = preview.snapshot();
    println!("profile: {}", snapshot.profile);
    println!("busy: {}", snapshot.busy);
    match (&snapshot.outcome, snapshot.sequence) {
        (Some(outcome), Some(sequence)) => println!("last result (#{}): {}", sequence, outcome),
        (Some(outcome), None) => println!("last result: {}", outcome),
        _ => println!("last result: none"),
    }
    println!(
        "runs: {} ok: {} api errors: {} local failures: {}",
        snapshot.stats.runs,
        snapshot.stats.successes,
        snapshot.stats.api_errors,
        snapshot.stats.local_failures
    );
}
