use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use iris_gateway::capture::{ImageLimits, validate_image};
use iris_gateway::config::{SpeechProvider, VisionProvider};
use iris_gateway::events::{Event, EventKind, EventPayload};
use iris_gateway::speech::{HttpSpeechClient, MockSpeech};
use iris_gateway::vision::{HttpVisionClient, MockVision};
use iris_gateway::{
    Collaborators, Config, DeviceSimulator, InMemoryTransport, Orchestrator, SpeechSynthesizer,
    VisionAnalyzer,
};

const DEMO_DEVICE: &str = "esp32-demo";

/// How long a phrase may take to trigger before it counts as ignored
const TRIGGER_WAIT: Duration = Duration::from_secs(1);

/// Iris - voice and vision gateway for camera-equipped edge devices
#[derive(Parser)]
#[command(name = "iris", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "IRIS_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline against a simulated device
    Demo {
        /// Phrases the device "hears", in order
        #[arg(default_values_t = ["what do I see".to_string()])]
        phrases: Vec<String>,

        /// Memory utilization the device reports before speaking (0.0-1.0)
        #[arg(long)]
        memory: Option<f64>,

        /// Capture requests the simulated camera leaves unanswered
        #[arg(long, default_value = "0")]
        drop_captures: u32,
    },
    /// Run capture validation on an image file
    CheckImage {
        /// Path to a JPEG or PNG file
        path: PathBuf,
    },
    /// Print the effective configuration (secrets redacted)
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,iris_gateway=info",
        1 => "info,iris_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    match cli.command {
        Command::Demo {
            phrases,
            memory,
            drop_captures,
        } => demo(&config, &phrases, memory, drop_captures).await,
        Command::CheckImage { path } => check_image(&config, &path),
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}

fn collaborators(config: &Config, transport: &InMemoryTransport) -> anyhow::Result<Collaborators> {
    let vision: Arc<dyn VisionAnalyzer> = match config.vision.provider {
        VisionProvider::Mock => Arc::new(MockVision::new(config.vision.mock_answer.clone())),
        VisionProvider::Anthropic => Arc::new(
            HttpVisionClient::from_config(&config.vision).context("vision provider unavailable")?,
        ),
    };
    let speech: Arc<dyn SpeechSynthesizer> = match config.speech.provider {
        SpeechProvider::Mock => Arc::new(MockSpeech::new(config.speech.sample_rate)),
        SpeechProvider::OpenAi => Arc::new(
            HttpSpeechClient::from_config(&config.speech).context("speech provider unavailable")?,
        ),
    };

    tracing::info!(vision = vision.name(), speech = speech.name(), "collaborators ready");
    Ok(Collaborators {
        transport: Arc::new(transport.clone()),
        vision,
        speech,
    })
}

/// Whether an event ends a request from the demo's point of view
fn ends_request(event: &Event) -> bool {
    matches!(
        event.kind(),
        EventKind::LockReleased | EventKind::RequestRejected | EventKind::MemoryLow
    )
}

fn describe(event: &Event) -> String {
    match &event.payload {
        EventPayload::AsrFinal { text, .. } => format!("heard {text:?}"),
        EventPayload::QuestionDetected {
            question,
            confidence,
            ..
        } => format!("question {question:?} (confidence {confidence:.2})"),
        EventPayload::TriggerFired {
            matched_keyword, ..
        } => format!("keyword {matched_keyword:?}"),
        EventPayload::CaptureRequested { retry_count, .. } => format!("retry {retry_count}"),
        EventPayload::CaptureReceived { image, .. } => format!("{} bytes", image.len()),
        EventPayload::VisionResult { text, is_error, .. } => {
            if *is_error {
                format!("fallback {text:?}")
            } else {
                format!("{text:?}")
            }
        }
        EventPayload::SynthesisRequired { text, .. } => format!("voice {text:?}"),
        EventPayload::AudioReady {
            audio, sample_rate, ..
        } => format!("{} bytes @ {sample_rate} Hz", audio.len()),
        EventPayload::PlaybackError { error, .. } => error.clone(),
        EventPayload::Error(payload) => format!("{} - {}", payload.error_type, payload.message),
        EventPayload::LockReleased { held_ms, .. } => format!("held {held_ms} ms"),
        EventPayload::RequestRejected { reason, .. } => reason.clone(),
        EventPayload::MemoryLow {
            memory_usage,
            threshold,
            ..
        } => format!("{memory_usage:.2} >= {threshold:.2}"),
        _ => String::new(),
    }
}

async fn demo(
    config: &Config,
    phrases: &[String],
    memory: Option<f64>,
    drop_captures: u32,
) -> anyhow::Result<()> {
    let transport = InMemoryTransport::new();
    let orchestrator = Arc::new(Orchestrator::new(config, collaborators(config, &transport)?));
    let cancel = CancellationToken::new();

    let (device_tx, device_rx) = mpsc::unbounded_channel();
    let mut device = DeviceSimulator::connect(DEMO_DEVICE, &transport, device_tx)
        .ignoring_captures(drop_captures);
    let device_task = device
        .spawn(cancel.child_token())
        .context("simulated device already running")?;
    orchestrator.register_device(DEMO_DEVICE);

    let mut events = orchestrator.bus().subscribe_all();
    let mut listeners = orchestrator.start(&cancel);
    listeners.push(orchestrator.serve_device_events(device_rx, cancel.child_token()));

    if let Some(usage) = memory {
        device.report_memory(usage);
    }

    // Worst case: every capture attempt times out, then vision and speech
    // run to their deadlines twice
    let attempts = config.capture.max_retries + 1;
    let request_budget = config.capture.timeout * attempts
        + config.vision.timeout
        + config.speech.timeout * 2
        + Duration::from_secs(5);

    for phrase in phrases {
        println!("\n> {phrase}");
        device.say(phrase);

        let mut deadline = TRIGGER_WAIT;
        let mut triggered = false;
        loop {
            let Ok(Some(event)) = tokio::time::timeout(deadline, events.recv()).await else {
                if !triggered {
                    println!("  (no trigger: not a trigger phrase, or cooldown active)");
                }
                break;
            };

            println!(
                "  {:<24} {:<38} {}",
                event.kind().as_str(),
                event.request_id().unwrap_or("-"),
                describe(&event)
            );

            if matches!(event.kind(), EventKind::QuestionDetected | EventKind::TriggerFired) {
                triggered = true;
                deadline = request_budget;
            }
            if ends_request(&event) {
                break;
            }
        }
    }

    // Let any voiced error message finish playing
    tokio::time::sleep(Duration::from_millis(500)).await;

    println!("\n{}", serde_json::to_string_pretty(&orchestrator.stats())?);

    cancel.cancel();
    for listener in listeners {
        listener.await.context("listener task panicked")?;
    }
    let played = device_task.await.context("device task panicked")?;
    println!("\ndevice played {} clip(s)", played.len());
    for clip in played {
        println!(
            "  {} - {} bytes in {} chunk(s), {} @ {} Hz",
            clip.request_id,
            clip.audio.len(),
            clip.chunks,
            clip.format,
            clip.sample_rate
        );
    }

    Ok(())
}

fn check_image(config: &Config, path: &Path) -> anyhow::Result<()> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let limits = ImageLimits::from(&config.capture);

    match validate_image(&data, &limits) {
        Ok(info) => {
            println!(
                "ok: {} {}x{}, {} bytes (limits {}x{}, {} bytes)",
                info.format.as_str(),
                info.width,
                info.height,
                info.size,
                limits.max_width,
                limits.max_height,
                limits.max_bytes
            );
            Ok(())
        }
        Err(e) => anyhow::bail!("rejected: {e}"),
    }
}
