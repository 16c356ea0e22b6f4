//! # Exam Voice Engine - Command-Line Entry Point
//!
//! Runs one spoken exam against the Live endpoint from the terminal.
//!
//! ## What happens on startup:
//! 1. Load `.env`, initialize tracing, load and validate configuration
//! 2. Read the syllabus and build the exam description
//! 3. Open the microphone and speaker named in `[devices]`
//! 4. Spawn the session controller and start the exam
//!
//! ## Keyboard Commands (one per line):
//! - `a`: start answering (opens the microphone gate)
//! - `s`: stop answering
//! - `i`: interrupt the examiner
//! - `v`: print the current output spectrum
//! - `?`: print a session snapshot as JSON
//! - `q`: end the exam
//!
//! SIGINT/SIGTERM end the exam the same way `q` does.

use anyhow::{Context, Result};
use exam_voice_engine::audio::device::{open_microphone, open_speaker};
use exam_voice_engine::config::AppConfig;
use exam_voice_engine::session::{SessionController, SessionHandle, SessionNotification, SessionState};
use exam_voice_engine::transport::LiveClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handler task; polled by the main loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    // TLS for wss:// endpoints; a second install (e.g. by a library) is harmless
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting exam-voice-engine v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.endpoint.model,
        questions = config.exam.total_questions,
        language = %config.exam.language,
        "Configuration loaded"
    );
    if config.endpoint.api_key.is_empty() {
        warn!("No API key configured (set GEMINI_API_KEY); the endpoint will likely refuse the session");
    }

    let syllabus = tokio::fs::read_to_string(&config.exam.syllabus_path)
        .await
        .with_context(|| format!("failed to read syllabus from {}", config.exam.syllabus_path))?;
    let exam = config.exam_config(&syllabus)?;

    let microphone = open_microphone(&config.devices.input)?;
    let speaker = open_speaker(&config.devices.output)?;
    let connector = Arc::new(LiveClient::from_config(&config.endpoint));

    let (controller, handle, mut notifications) = SessionController::new(
        exam,
        config.engine_settings(),
        connector,
        microphone,
        speaker,
    );
    info!(session_id = %controller.session_id(), "Exam session created");

    let mut session = tokio::spawn(controller.run());
    let printer = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            print_notification(&notification);
        }
    });

    setup_signal_handlers();
    handle.start()?;
    println!("Commands: a = answer, s = stop answering, i = interrupt, v = spectrum, ? = status, q = quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let summary = loop {
        tokio::select! {
            result = &mut session => break result?,
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, ending exam...");
                let _ = handle.end();
                break (&mut session).await?;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_input(&handle, line.trim()).await,
                Ok(None) => {
                    info!("stdin closed; the exam continues until it ends or a signal arrives");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    };

    let _ = printer.await;

    println!(
        "Exam {}: {}/{} correct ({:.0}%), {} questions graded",
        summary.final_state,
        summary.correct_count,
        summary.total_questions,
        summary.percentage(),
        summary.questions_asked
    );
    if let Some(reason) = &summary.error {
        println!("Reason: {}", reason);
    }
    info!(summary = %serde_json::to_string(&summary)?, "Session summary");

    Ok(())
}

async fn handle_input(handle: &SessionHandle, input: &str) {
    let result = match input {
        "a" => handle.start_answering(),
        "s" => handle.stop_answering(),
        "i" => handle.interrupt(),
        "q" => handle.end(),
        "v" => handle.spectrum().await.map(|bins| {
            let bars: String = bins
                .iter()
                .step_by(4)
                .map(|&b| match b {
                    0..=31 => ' ',
                    32..=95 => '.',
                    96..=159 => ':',
                    160..=223 => '|',
                    _ => '#',
                })
                .collect();
            println!("[{}]", bars);
        }),
        "?" => handle.snapshot().await.map(|snapshot| {
            match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to render snapshot: {}", e),
            }
        }),
        "" => Ok(()),
        other => {
            println!("Unknown command '{}'", other);
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("Command '{}' not delivered: {}", input, e);
    }
}

fn print_notification(notification: &SessionNotification) {
    match notification {
        SessionNotification::StatusChanged(SessionState::Errored(e)) => {
            println!("[status] errored ({})", e.code())
        }
        SessionNotification::StatusChanged(state) => println!("[status] {}", state.as_str()),
        SessionNotification::ScoreUpdated(score) => println!(
            "[score] {} correct of {} graded",
            score.correct_count, score.questions_asked
        ),
        SessionNotification::Feedback(text) => println!("[feedback] {}", text),
        SessionNotification::Error(message) => println!("[error] {}", message),
        SessionNotification::ActivityChanged(activity) => println!("[examiner] {}", activity.as_str()),
    }
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "exam_voice_engine=trace")
/// - If not set, defaults to "exam_voice_engine=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "exam_voice_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown flag, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
