use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use kisaan_bot::chatbot::{
    AudioNormalizer, ConversationEngine, Database, FfmpegConverter, KnowledgeStore, SessionStore, SpeechApiClient,
    Transcriber,
};
use kisaan_bot::config::{Config, TranscriptionConfig};
use kisaan_bot::console;

/// Sender used for console lines without a `sender:` prefix.
const DEFAULT_SENDER: &str = "console";

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "kisaan.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    std::fs::create_dir_all(&config.log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_dir.join("kisaan-bot.log"))
        .expect("Failed to open log file");
    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting kisaan-bot...");
    info!("Loaded config from {config_path}");

    if let Err(e) = run(config).await {
        error!("Fatal: {e}");
        drop(guard);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let knowledge = Arc::new(KnowledgeStore::load(&config.data_dir, config.fuzzy_threshold)?);

    if let Some(parent) = config.session_db.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let database = Database::open(&config.session_db)?;
    let sessions = Arc::new(SessionStore::new(database, config.session_ttl, config.session_lock_wait));

    let audio = build_normalizer(&config)?;
    let mut engine = ConversationEngine::new(knowledge, sessions, audio);
    engine.start_sweeper(config.sweep_interval);

    serve_console(Arc::new(engine)).await;
    info!("👋 Bye");
    Ok(())
}

fn build_normalizer(config: &Config) -> Result<Option<Arc<AudioNormalizer>>, Box<dyn std::error::Error>> {
    let backend: Arc<dyn Transcriber> = match &config.transcription {
        None => {
            info!("Voice transcription disabled (no transcription config)");
            return Ok(None);
        }
        Some(TranscriptionConfig::Api { endpoint, api_key, model, language }) => {
            if api_key.is_none() {
                warn!("No API key for {endpoint}, sending unauthenticated requests");
            }
            Arc::new(SpeechApiClient::new(endpoint, api_key.clone(), model.clone(), language.clone()))
        }
        #[cfg(feature = "whisper")]
        Some(TranscriptionConfig::Whisper { model_path, language }) => {
            Arc::new(kisaan_bot::chatbot::Whisper::new(model_path, language.clone())?)
        }
        #[cfg(not(feature = "whisper"))]
        Some(TranscriptionConfig::Whisper { .. }) => {
            return Err("whisper backend configured but the `whisper` feature is off".into());
        }
    };

    info!("Voice transcription via {} (timeout {:?})", backend.name(), config.transcription_timeout);
    let converter = Arc::new(FfmpegConverter::new(&config.ffmpeg_path));
    Ok(Some(Arc::new(AudioNormalizer::new(converter, backend, config.transcription_timeout))))
}

/// Read messages from stdin until EOF or Ctrl-C, one task per message.
async fn serve_console(engine: Arc<ConversationEngine>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                tasks.abort_all();
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read stdin: {e}");
                        break;
                    }
                };
                let command = match console::parse_line(&line, DEFAULT_SENDER) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        eprintln!("{e}");
                        continue;
                    }
                };
                let engine = engine.clone();
                tasks.spawn(async move {
                    let (sender_id, payload) = match command.into_payload().await {
                        Ok(parts) => parts,
                        Err(e) => {
                            eprintln!("could not read voice file: {e}");
                            return;
                        }
                    };
                    let reply = engine.handle_message(&sender_id, payload).await;
                    println!("[{sender_id}] {reply}");
                });
            }
        }
    }

    while tasks.join_next().await.is_some() {}
}
