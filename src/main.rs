use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use voicebot_researcher::audio::{AudioCapture, rms_energy};
use voicebot_researcher::config::CaptureSettings;
use voicebot_researcher::feedback::LogFeedback;
use voicebot_researcher::{Config, SessionController, SessionState};

/// Voicebot - spoken literature research assistant
#[derive(Parser)]
#[command(name = "voicebot", version, about)]
struct Cli {
    /// Backend base URL serving the session and tool endpoints
    #[arg(long, env = "VOICEBOT_API_BASE")]
    api_base: Option<String>,

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
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voicebot_researcher=info",
        1 => "info,voicebot_researcher=debug",
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
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
        };
    }

    let mut config = Config::load()?;
    if let Some(api_base) = cli.api_base {
        config.api_base = api_base;
    }
    tracing::debug!(?config, "loaded configuration");

    let controller = SessionController::new(config, Arc::new(LogFeedback));

    // Print state transitions as they happen
    let mut state_rx = controller.subscribe();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            println!("  [{state:?}]");
        }
    });

    println!("Voicebot ready. Press Enter to toggle the session, Ctrl+C to quit.");
    if let Err(e) = Arc::clone(&controller).start().await {
        tracing::error!("session start failed: {e}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(_) => {
                        if controller.state() == SessionState::Idle {
                            if let Err(e) = Arc::clone(&controller).start().await {
                                tracing::error!("session start failed: {e}");
                            }
                        } else {
                            controller.stop().await;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.stop().await;
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let far_end = Arc::new(AtomicBool::new(false));
    let mut capture = AudioCapture::open(&CaptureSettings::default(), far_end)?;
    let mut frames = capture
        .take_frames()
        .ok_or_else(|| anyhow::anyhow!("capture frames unavailable"))?;
    println!("---");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut second: Vec<f32> = Vec::new();
    let mut elapsed = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(frame) => second.extend_from_slice(&frame),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                elapsed += 1;
                let energy = rms_energy(&second);
                let peak = second.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

                // Visual meter
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let meter_len = (energy * 100.0).min(50.0) as usize;
                let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

                println!("[{elapsed:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]");
                second.clear();

                if tokio::time::Instant::now() >= deadline {
                    break;
                }
            }
        }
    }

    capture.stop();
    println!("\nMicrophone test complete.");
    Ok(())
}
