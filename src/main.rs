use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use voxlink::session::SessionEvent;
use voxlink::transport::{ProtocolProfile, TranscriptRole};
use voxlink::voice::{AudioSink, AudioSource, MicCapture, PlaybackItem, SpeakerOutput};
use voxlink::{Config, SessionController};

/// voxlink - real-time voice sessions over WebSocket
#[derive(Parser)]
#[command(name = "voxlink", version, about)]
struct Cli {
    /// Voice service WebSocket URL
    #[arg(long, env = "VOXLINK_URL")]
    url: Option<String>,

    /// Agent to route the session to
    #[arg(long, env = "VOXLINK_AGENT_ID")]
    agent_id: Option<String>,

    /// Protocol preset ("json" or "binary")
    #[arg(long, env = "VOXLINK_PROFILE")]
    profile: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run an interactive session (Enter toggles, Ctrl+C exits)
    Run,
    /// Test microphone capture
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info",
        1 => "info,voxlink=debug",
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
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_session(config).await,
        Command::TestMic { duration } => test_mic(config, duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::Config => {
            print_config(&config);
            Ok(())
        }
    }
}

/// Layer command-line flags over the loaded configuration
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load()?;

    if let Some(url) = &cli.url {
        config.endpoint.clone_from(url);
    }
    if let Some(agent_id) = &cli.agent_id {
        config.agent_id.clone_from(agent_id);
    }
    if let Some(name) = &cli.profile {
        let preset = ProtocolProfile::by_name(name)
            .ok_or_else(|| anyhow::anyhow!("unknown protocol profile: {name}"))?;
        // Keep any field overrides from the config file
        config.profile.name = preset.name;
        config.profile.audio_framing = preset.audio_framing;
    }

    config.validate()?;
    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

async fn run_session(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        endpoint = %config.endpoint,
        agent_id = %config.agent_id,
        profile = %config.profile.name,
        "starting voxlink"
    );

    let controller = SessionController::from_config(config);
    let mut events = controller.subscribe();

    println!("Press Enter to start or stop a session, Ctrl+C to quit.\n");

    if let Err(e) = controller.start().await {
        println!("! {}", e.kind().user_message());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(_)) => {
                    if let Err(e) = controller.toggle().await {
                        println!("! {}", e.kind().user_message());
                    }
                }
                // stdin closed; keep running until Ctrl+C
                Ok(None) => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => return Err(e.into()),
            },
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    controller.stop().await;
    println!("\nbye");
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => println!("[{state}]"),
        SessionEvent::Transcript { role, text } => match role {
            TranscriptRole::Input => println!("you:   {text}"),
            TranscriptRole::Output => println!("agent: {text}"),
        },
        SessionEvent::ResponseText(text) => println!("agent: {text}"),
        SessionEvent::Failed { message, .. } => println!("! {message}"),
        SessionEvent::PlaybackError(error) => tracing::warn!(error = %error, "playback error"),
        SessionEvent::Pong => {}
    }
}

fn print_config(config: &Config) {
    let path = voxlink::config::file::config_file_path()
        .map_or_else(|| "(none)".to_string(), |p| p.display().to_string());

    println!("config file:      {path}");
    println!("endpoint:         {}", config.endpoint);
    println!("agent id:         {}", config.agent_id);
    println!("profile:          {}", config.profile.name);
    println!("  audio framing:  {:?}", config.profile.audio_framing);
    println!("  session field:  {}", config.profile.fields.session_id);
    println!("  agent field:    {}", config.profile.fields.agent_id);
    println!("  audio field:    {}", config.profile.fields.audio);
    println!("  session ack:    {}", config.profile.await_session_ack);
    println!(
        "capture:          {} Hz, {} ch, {} samples/frame",
        config.capture.sample_rate, config.capture.channel_count, config.capture.frame_size
    );
    println!(
        "  dsp hints:      aec={} ns={} agc={}",
        config.capture.echo_cancellation,
        config.capture.noise_suppression,
        config.capture.auto_gain_control
    );
    println!("playback rate:    {} Hz", config.playback.default_sample_rate);
    println!(
        "timing:           connect {}ms (poll {}ms), keepalive {}s",
        config.timing.connect_timeout.as_millis(),
        config.timing.connect_poll.as_millis(),
        config.timing.keepalive.as_secs()
    );
}

/// Test microphone capture through the frame pipeline
async fn test_mic(config: Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let capture = MicCapture::new(config.capture.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start(tx).await.map_err(|e| {
        anyhow::anyhow!("{} ({e})", e.kind().user_message())
    })?;

    println!(
        "Capture rate: {} Hz, {} samples per frame",
        capture.sample_rate(),
        config.capture.frame_size
    );
    println!("---");

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    for i in 0..duration {
        ticker.tick().await;

        let mut frames = 0usize;
        let mut samples = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames += 1;
            samples.extend(frame.samples().iter().map(|&s| f32::from(s) / 32768.0));
        }
        let energy = calculate_rms(&samples);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] frames: {frames:2} | RMS: {energy:.4} | [{meter}]", i + 1);
    }

    capture.stop()?;

    println!("\n---");
    println!("About 8 frames per second means capture is running at 16 kHz.");
    println!("If RMS stayed near 0, check your input device and its levels.");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let speaker = SpeakerOutput::new();

    let sample_rate = voxlink::config::DEFAULT_PLAYBACK_RATE;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    speaker
        .play(PlaybackItem {
            samples,
            sample_rate,
        })
        .await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check the default output device.");

    Ok(())
}
