use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sous_gateway::api::ApiServerBuilder;
use sous_gateway::client::{ClientSessionTransport, SessionParams, TransportEvent, live_cooking_url};
use sous_gateway::relay::RelaySessionManager;
use sous_gateway::store::{MemoryRecipeStore, RecipeStore, SqliteRecipeStore};
use sous_gateway::upstream::GeminiConnector;
use sous_gateway::voice::{
    AudioFrameSource, AudioSink, DEFAULT_QUEUE_FRAMES, FrameCallback, LevelCallback,
    encode_pcm16, write_wav,
};
use sous_gateway::{AudioFormat, AudioFrame, Config, ConnectionState, ControlMessage};

/// Sous - live voice relay for a hands-free cooking assistant
#[derive(Parser)]
#[command(name = "sous", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "SOUS_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (default)
    Serve,
    /// Hold a live conversation about a recipe
    Talk {
        /// Recipe id
        #[arg(short, long)]
        recipe: Uuid,
        /// Zero-based step you are on
        #[arg(short, long, default_value = "0")]
        step: u32,
        /// Specific recipe version
        #[arg(long)]
        version: Option<Uuid>,
        /// Relay base URL (overrides config)
        #[arg(long)]
        relay: Option<String>,
        /// Bearer token (overrides config)
        #[arg(long, env = "SOUS_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Record from the microphone and save a WAV
    TestMic {
        /// Seconds to record
        #[arg(short, long, default_value = "5")]
        seconds: u64,
        /// Where to write the captured audio
        #[arg(short, long, default_value = "sous-mic-test.wav")]
        out: PathBuf,
    },
    /// Play a tone on the speaker
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn,sous_gateway=info",
        1 => "info,sous_gateway=debug",
        2 => "debug,tower_http=debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Talk {
            recipe,
            step,
            version,
            relay,
            token,
        } => {
            let params = SessionParams {
                recipe_id: recipe,
                step_index: step,
                version_id: version,
            };
            let relay = relay.unwrap_or_else(|| config.client.relay_url.clone());
            let token = token
                .map(SecretString::from)
                .or_else(|| config.client.token.clone())
                .ok_or_else(|| anyhow::anyhow!("no token: pass --token or set SOUS_TOKEN"))?;
            talk(&relay, &token, params).await
        }
        Command::TestMic { seconds, out } => test_mic(seconds, &out).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// Run the relay until interrupted
async fn serve(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn RecipeStore> = if let Some(path) = &config.server.db_path {
        tracing::info!(path = %path.display(), "opening recipe database");
        Arc::new(SqliteRecipeStore::open(path)?)
    } else {
        tracing::warn!("no database configured, serving an empty in-memory recipe store");
        Arc::new(MemoryRecipeStore::new())
    };

    let connector = Arc::new(GeminiConnector::new(
        config.upstream.url.clone(),
        config.credential_cache()?,
    ));

    let manager = RelaySessionManager::new(
        store,
        config.authenticator(),
        connector,
        config.bridge(),
        config.heartbeat,
    );

    tracing::info!(
        port = config.server.port,
        model = %config.upstream.model,
        heartbeat_secs = config.heartbeat.interval.as_secs(),
        "starting sous gateway"
    );

    let server = ApiServerBuilder::new(Arc::new(manager))
        .port(config.server.port)
        .rate_limit(config.server.rate_limit_per_minute)
        .build();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}

/// Live conversation through the relay
#[allow(clippy::future_not_send)]
async fn talk(relay: &str, token: &SecretString, params: SessionParams) -> anyhow::Result<()> {
    let url = live_cooking_url(relay, &params)?;
    let sink = AudioSink::new(DEFAULT_QUEUE_FRAMES)?;

    let mut transport = ClientSessionTransport::new();
    let mut events = transport.connect(&url, token).await?;
    let sender = transport
        .sender()
        .ok_or_else(|| anyhow::anyhow!("transport has no sender"))?;

    let mut source = AudioFrameSource::new();
    let on_frame: FrameCallback = Arc::new(move |frame: AudioFrame| {
        sender.send(frame);
    });
    let on_level: LevelCallback = Arc::new(|level: f32| tracing::trace!(level, "mic level"));
    let handle = source.start(on_frame, on_level)?;

    println!("Connecting to {}...", url.host_str().unwrap_or("relay"));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(TransportEvent::Audio(frame)) => sink.schedule(&frame),
                Some(TransportEvent::Control(ControlMessage::SetupAck)) => {
                    println!("Assistant ready. Start talking, Ctrl-C to stop.\n");
                }
                Some(TransportEvent::Control(ControlMessage::TextUtterance { text })) => {
                    println!("  {text}");
                }
                Some(TransportEvent::Control(ControlMessage::TurnComplete)) => {
                    tracing::debug!(speaking = sink.is_speaking(), "turn complete");
                }
                Some(TransportEvent::Control(ControlMessage::Error { message })) => {
                    eprintln!("error: {message}");
                }
                None => break,
            },
        }
    }

    source.stop(handle);
    transport.close(1000, "user ended session").await;

    if let ConnectionState::Failed(reason) = transport.state() {
        anyhow::bail!("session ended: {reason}");
    }
    Ok(())
}

/// Capture a few seconds of audio, show levels, and save it
#[allow(clippy::future_not_send)]
async fn test_mic(seconds: u64, out: &std::path::Path) -> anyhow::Result<()> {
    println!("Recording {seconds}s from the default microphone. Say something.");

    let captured = Arc::new(Mutex::new(Vec::<u8>::new()));
    let level = Arc::new(AtomicU32::new(0));

    let mut source = AudioFrameSource::new();
    let on_frame: FrameCallback = {
        let captured = Arc::clone(&captured);
        Arc::new(move |frame: AudioFrame| {
            captured
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&frame.data);
        })
    };
    let on_level: LevelCallback = {
        let level = Arc::clone(&level);
        Arc::new(move |l: f32| level.store(l.to_bits(), Ordering::Relaxed))
    };
    let handle = source.start(on_frame, on_level)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    for elapsed in 1..=seconds {
        ticker.tick().await;
        let rms = f32::from_bits(level.load(Ordering::Relaxed));
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bars = (rms * 200.0).clamp(0.0, 40.0) as usize;
        println!("{elapsed:>3}s  {rms:.4}  {}", "#".repeat(bars));
    }

    source.stop(handle);

    let pcm = std::mem::take(&mut *captured.lock().unwrap_or_else(PoisonError::into_inner));
    write_wav(out, &pcm, AudioFormat::CAPTURE.sample_rate)?;

    println!(
        "Saved {} samples ({} Hz mono) to {}",
        pcm.len() / 2,
        AudioFormat::CAPTURE.sample_rate,
        out.display()
    );
    if pcm.is_empty() {
        println!("No audio arrived. Check the default input device and its permissions.");
    }

    Ok(())
}

/// Play a short tone through the playback path
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    const TONE_HZ: f32 = 440.0;
    const TONE_SECS: u32 = 2;

    println!("Playing a {TONE_HZ} Hz tone for {TONE_SECS}s on the default output.");

    let sink = AudioSink::new(DEFAULT_QUEUE_FRAMES)?;
    let rate = AudioFormat::PLAYBACK.sample_rate;

    #[allow(clippy::cast_precision_loss)]
    let tone: Vec<f32> = (0..rate * TONE_SECS)
        .map(|n| (std::f32::consts::TAU * TONE_HZ * n as f32 / rate as f32).sin() * 0.25)
        .collect();

    // 100 ms chunks, like speech arriving from the relay
    for (seq, chunk) in (0u64..).zip(tone.chunks((rate / 10) as usize)) {
        sink.schedule(&AudioFrame::inbound(seq, encode_pcm16(chunk)));
    }

    let give_up = tokio::time::Instant::now() + Duration::from_secs(u64::from(TONE_SECS) * 2);
    while sink.is_speaking() && tokio::time::Instant::now() < give_up {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("Done. Silence means the default output device is not the one you expect.");
    Ok(())
}
