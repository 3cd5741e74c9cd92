//! classify_image - classify one JPEG file and print the outcome
//!
//! With `--replay`, a recorded HTTP response is fed back instead of
//! contacting the endpoint.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use trashcam::{
    config::TrashcamConfig,
    ingest::{FileSource, FrameSource},
    ui::{Ui, UiMode},
    upload_frame, BraceScan, CapturedFrame, Connector, ReplayConnector, TlsConnector,
    TlsVerification,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JPEG file to classify.
    image: PathBuf,
    /// JSON or TOML config file.
    #[arg(long, env = "TRASHCAM_CONFIG")]
    config: Option<PathBuf>,
    /// Recorded HTTP response to replay instead of connecting.
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,
    /// Prompt sent with the image.
    #[arg(long)]
    prompt: Option<String>,
    /// Model identifier.
    #[arg(long)]
    model: Option<String>,
    /// TLS verification: disabled, webpki, or ca:<path>.
    #[arg(long, value_name = "MODE")]
    tls_verify: Option<TlsVerification>,
    /// Brace counting for JSON extraction: naive or string-aware.
    #[arg(long, value_name = "SCAN")]
    brace_scan: Option<BraceScan>,
    /// Print the outcome as JSON.
    #[arg(long)]
    json: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui, std::io::stderr().is_terminal());

    let mut config = TrashcamConfig::load_from(args.config.as_deref())?;
    if let Some(prompt) = args.prompt {
        config.prompt = prompt;
    }
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(mode) = args.tls_verify {
        config.tls = mode;
    }
    if let Some(scan) = args.brace_scan {
        config.brace_scan = scan;
    }
    if args.replay.is_some() && !config.has_api_key() {
        config.set_api_key("replay".to_string());
    }
    let target = config.api_target()?;

    let frame = {
        let _stage = ui.stage("load image");
        let path = args
            .image
            .to_str()
            .ok_or_else(|| anyhow!("image path is not valid UTF-8"))?;
        let mut source = FileSource::new(path, config.source.settings)?;
        let loaned = source
            .acquire_frame(Duration::from_secs(1))?
            .ok_or_else(|| anyhow!("no image read from {}", args.image.display()))?;
        let data = loaned.bytes().to_vec();
        let format = loaned.format();
        source.release_frame(loaned);
        CapturedFrame::new(data, format, 1, config.source.settings.profile)?
    };
    log::info!("{} bytes, sha256 {}", frame.len(), frame.fingerprint());

    let connector: Box<dyn Connector> = match &args.replay {
        Some(path) => Box::new(ReplayConnector::from_file(path)?),
        None => Box::new(TlsConnector::new(config.tls.clone())?),
    };

    let outcome = {
        let mut progress = ui.progress();
        let outcome = upload_frame(
            &frame,
            &target,
            &config.upload_settings(),
            connector.as_ref(),
            &mut |stage| progress.enter(stage),
        );
        progress.finish();
        outcome
    };

    if args.json {
        let report = serde_json::json!({
            "kind": outcome.kind(),
            "text": outcome.to_string(),
            "reason_code": outcome.reason_code(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", outcome);
    }

    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
