use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use parley_assistant::chat::OpenAiChat;
use parley_assistant::config::InputKind;
use parley_assistant::opcua_client::OpcUaClient;
use parley_assistant::telemetry::{TelemetrySink, TracingSink};
use parley_assistant::tools::{KnowledgeBase, NodeRead, ToolRegistry, Weather};
use parley_assistant::voice::{
    AudioPlayback, MicrophoneRecorder, OpenAiSynthesizer, OpenAiTranscriber, Recorder,
    SpeakerOutput,
};
use parley_assistant::{Config, Session, SessionParts, input};

/// Parley - push-to-talk voice assistant
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/parley/config.toml)
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Use a right Joy-Con instead of the keyboard
    #[arg(long)]
    joycon: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speech synthesis and speaker output
    TestSpeaker {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info",
        1 => "info,parley_assistant=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(Command::TestMic { duration }) = cli.command {
        return test_mic(duration).await;
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if cli.joycon {
        config.input.kind = InputKind::Gamepad;
    }

    if let Some(Command::TestSpeaker { text }) = cli.command {
        return test_speaker(&config, &text).await;
    }

    tracing::info!(
        input = ?config.input.kind,
        chat_model = %config.chat.model,
        knowledge_base = config.database.is_some(),
        opcua = config.opcua.as_ref().map(|ua| ua.url.as_str()),
        telemetry = config.telemetry.enabled,
        "starting parley"
    );

    let opcua = config.opcua.as_ref().map(|ua| Arc::new(OpcUaClient::new(&ua.url)));

    let scratch = tempfile::Builder::new().prefix("parley-").tempdir()?;
    tracing::debug!(path = %scratch.path().display(), "scratch directory");

    // Cancelled by the keyboard source on Ctrl+C while the terminal is raw
    let quit = CancellationToken::new();

    let parts = SessionParts {
        input: input::from_config(&config.input, quit.clone()),
        recorder: Arc::new(MicrophoneRecorder::new(scratch.path())),
        transcriber: Arc::new(OpenAiTranscriber::new(
            &config.api_base,
            &config.api_key,
            &config.transcription_model,
        )?),
        chat: Arc::new(OpenAiChat::new(
            &config.api_base,
            &config.api_key,
            &config.chat.model,
        )),
        playback: playback(&config)?,
        tools: build_tools(&config, opcua.clone())?,
        telemetry: telemetry_sink(&config, opcua),
        telemetry_config: config.telemetry.clone(),
    };
    let mut session = Session::new(parts, &config.chat.prompt)?;

    let result = tokio::select! {
        result = session.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
            Ok(())
        }
        () = quit.cancelled() => {
            tracing::info!("quit requested from input device");
            Ok(())
        }
    };

    session.shutdown().await;
    result?;
    Ok(())
}

fn playback(config: &Config) -> anyhow::Result<AudioPlayback> {
    let synthesizer = OpenAiSynthesizer::new(
        &config.api_base,
        &config.api_key,
        &config.speech.model,
        &config.speech.voice,
        config.speech.instructions.clone(),
    )?;
    Ok(AudioPlayback::new(Arc::new(synthesizer), Arc::new(SpeakerOutput)))
}

/// Publish to the OPC UA server when one is configured, else to the log
fn telemetry_sink(
    config: &Config,
    opcua: Option<Arc<OpcUaClient>>,
) -> Option<Arc<dyn TelemetrySink>> {
    if !config.telemetry.enabled {
        return None;
    }
    let sink: Arc<dyn TelemetrySink> = match opcua {
        Some(client) => client,
        None => Arc::new(TracingSink),
    };
    Some(sink)
}

fn build_tools(
    config: &Config,
    opcua: Option<Arc<OpcUaClient>>,
) -> anyhow::Result<ToolRegistry> {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(Weather::new()?))?;

    if let Some(database) = &config.database {
        tools.register(Arc::new(KnowledgeBase::new(
            database,
            &config.api_base,
            &config.api_key,
        )))?;
    }

    match opcua {
        Some(client) if !config.node_categories.is_empty() => {
            let categories = config.node_categories.clone();
            tools.register(Arc::new(NodeRead::new(client, categories)))?;
        }
        None if !config.node_categories.is_empty() => {
            tracing::warn!(
                categories = config.node_categories.len(),
                "node categories configured without an [opcua] server; get_opcua_nodes disabled"
            );
        }
        _ => {}
    }

    Ok(tools)
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let dir = std::env::temp_dir();
    let recorder = MicrophoneRecorder::new(&dir);
    let stop = CancellationToken::new();

    let timer = {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration)).await;
            stop.cancel();
        })
    };

    let recording = tokio::task::spawn_blocking(move || recorder.record(stop)).await?;
    timer.abort();

    let Some(path) = recording else {
        anyhow::bail!("no audio captured");
    };

    let samples = hound::WavReader::open(&path)?
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()?;
    let (rms, peak) = levels(&samples);

    println!("---");
    println!("Samples: {}", samples.len());
    println!("RMS: {rms:.4} | Peak: {peak:.4}");
    println!("Saved to {}", path.display());

    if peak < 0.01 {
        println!("\nNo signal detected. Check your microphone.");
    }
    Ok(())
}

/// RMS and peak of 16-bit samples, normalized to [0, 1]
#[allow(clippy::cast_precision_loss)]
fn levels(samples: &[i16]) -> (f32, f32) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let normalized = samples.iter().map(|&s| f32::from(s) / 32768.0);
    let sum_sq: f32 = normalized.clone().map(|s| s * s).sum();
    let peak = normalized.map(f32::abs).fold(0.0f32, f32::max);
    ((sum_sq / samples.len() as f32).sqrt(), peak)
}

/// Test speech synthesis and speaker output
async fn test_speaker(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Speaking: \"{text}\"");

    let outcome = playback(config)?.play(text, &CancellationToken::new()).await?;
    println!("Played {} chunks", outcome.chunks());
    Ok(())
}
