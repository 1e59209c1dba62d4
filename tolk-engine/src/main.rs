//! # Tolk Interpretation Engine (tolk-engine)
//!
//! Real-time speech interpretation daemon: captures live speech,
//! conditions and segments it, drives a remote bidirectional
//! speech-to-speech service, and plays back translated audio while
//! streaming recognized and translated text.
//!
//! **Architecture:** capture → conditioner (DSP + echo cancellation) →
//! VAD/segmenter → dual-path processing over one full-duplex socket →
//! ordered playback, all as cooperating tokio tasks.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tolk_common::config::{EngineSettings, SessionConfig};
use tolk_common::events::InterpreterEvent;
use tolk_engine::audio::capture::CpalSource;
use tolk_engine::playback::{CpalSink, NullSink, OutputSink};
use tolk_engine::{EngineError, InterpreterEngine};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code for invalid configuration
const EXIT_CONFIG: u8 = 2;
/// Exit code for a refused socket at session start
const EXIT_SOCKET: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "tolk-engine")]
#[command(about = "Tolk - real-time speech interpretation engine")]
#[command(version)]
struct Args {
    /// Path to configuration file (environment variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target language (overrides config file and environment)
    #[arg(short, long)]
    target_lang: Option<String>,

    /// Disable translated-audio playback (text results still stream)
    #[arg(long)]
    no_playback: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tolk_engine=debug,tolk_common=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    info!("Starting Tolk interpretation engine");
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration invalid: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run_session(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(EngineError::Link(e)) => {
            error!("Could not reach the speech service: {}", e);
            ExitCode::from(EXIT_SOCKET)
        }
        Err(e) => {
            error!("Session failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> tolk_common::Result<SessionConfig> {
    let mut settings = EngineSettings::load(args.config.as_deref())?;
    if let Some(lang) = &args.target_lang {
        settings.target_lang = Some(lang.clone());
    }
    if args.no_playback {
        settings.playback_enabled = Some(false);
    }
    settings.into_session_config()
}

async fn run_session(config: SessionConfig) -> tolk_engine::Result<()> {
    // Open the socket first: a refused connection must fail fast
    let (link, routes) = tolk_engine::link::connect(&config.realtime_url, &config.auth_token).await?;

    let source = Box::new(CpalSource::new(config.vad_mode)?);
    let sink: Box<dyn OutputSink> = if config.playback_enabled {
        match CpalSink::open() {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                warn!("No output device ({}); translated audio will be dropped", e);
                Box::new(NullSink)
            }
        }
    } else {
        Box::new(NullSink)
    };

    let engine = InterpreterEngine::new(config);

    // UI adapter: envelopes in segment-id order as structured log lines
    let mut events = engine.event_bus().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                InterpreterEvent::SegmentCompleted { envelope, .. } => {
                    info!(
                        segment = envelope.id,
                        lang = envelope.source_lang.as_deref().unwrap_or("?"),
                        source = envelope.source_text.as_deref().unwrap_or(""),
                        translated = envelope.translated_text.as_deref().unwrap_or(""),
                        audio = envelope.translated_audio_played,
                        error = envelope.error.as_deref().unwrap_or(""),
                        "segment result"
                    );
                }
                InterpreterEvent::SessionEnded { category, .. } => {
                    info!("Session ended: {:?}", category);
                    break;
                }
                _ => {}
            }
        }
    });

    // Ctrl-C is the host's stop signal
    let stopper = tokio::signal::ctrl_c();
    let run = engine.run(source, link, routes, sink);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = stopper => {
            info!("Stop requested");
            engine.stop();
            run.await
        }
    };

    let _ = printer.await;
    result.map(|_| ())
}
