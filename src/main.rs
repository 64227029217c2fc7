//! callwatch: realtime contact-center supervision plane
//!
//! One binary, four roles: the ingest/stream API server (default), the
//! Genesys notification connector, the AudioHook media listener, and a
//! one-shot subscription topic builder.

mod alerts;
mod audio;
mod audiohook;
mod bus;
mod codec;
mod config;
mod error;
mod genesys;
mod handlers;
mod ingest;
mod model;
mod repository;
mod retry;
mod routes;
mod status;
mod stream;
mod tests;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use audio::LiveAudioStore;
use audiohook::listener::AudioHookListener;
use bus::EventBus;
use config::Config;
use genesys::connector::GenesysConnector;
use repository::RealtimeRepository;

pub use error::{Error, Result};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repository: Arc<RealtimeRepository>,
    pub audio: Arc<LiveAudioStore>,
    pub bus: Arc<EventBus>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let audio = LiveAudioStore::new(
            config.realtime.audio_dir.clone(),
            config.realtime.audio_window_seconds,
            config.realtime.audio_max_chunk_bytes,
        );
        Self {
            config: Arc::new(config),
            repository: Arc::new(RealtimeRepository::new()),
            audio: Arc::new(audio),
            bus: Arc::new(EventBus::new()),
        }
    }
}

#[derive(Parser)]
#[command(name = "callwatch", version, about = "Realtime call supervision plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log filter when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingest API, SSE streamer, and health endpoints (default)
    Serve,

    /// Run the Genesys Cloud notification connector
    RunGenesysConnector {
        /// Connect and parse events but do not forward them
        #[arg(long)]
        dry_run: bool,
        /// Override the target ingest URL for this run
        #[arg(long)]
        target_ingest_url: Option<String>,
    },

    /// Run the AudioHook media listener
    RunGenesysAudiohookListener {
        /// Accept and decode media but do not forward it
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        path: Option<String>,
    },

    /// Build subscription topic presets from org queues/users
    BuildGenesysTopics {
        /// Builder mode: queues_users (default), queues, users, manual/off
        #[arg(long)]
        mode: Option<String>,
        /// Queue name contains filter (repeatable)
        #[arg(long = "queue-filter")]
        queue_filter: Vec<String>,
        /// User display name contains filter (repeatable)
        #[arg(long = "user-filter")]
        user_filter: Vec<String>,
        /// User email domain filter (repeatable), e.g. company.com
        #[arg(long = "email-domain")]
        email_domain: Vec<String>,
        #[arg(long)]
        max_queues: Option<usize>,
        #[arg(long)]
        max_users: Option<usize>,
        /// Optional file path for the full JSON preview
        #[arg(long)]
        output_file: Option<PathBuf>,
        /// Print only the GENESYS_SUBSCRIPTION_TOPICS=... line
        #[arg(long)]
        as_env: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::RunGenesysConnector {
            dry_run,
            target_ingest_url,
        } => run_genesys_connector(config, dry_run, target_ingest_url).await,
        Command::RunGenesysAudiohookListener {
            dry_run,
            host,
            port,
            path,
        } => run_audiohook_listener(config, dry_run, host, port, path).await,
        Command::BuildGenesysTopics {
            mode,
            queue_filter,
            user_filter,
            email_domain,
            max_queues,
            max_users,
            output_file,
            as_env,
        } => {
            build_genesys_topics(
                config,
                mode,
                queue_filter,
                user_filter,
                email_domain,
                max_queues,
                max_users,
                output_file,
                as_env,
            )
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Config(message)) => {
            error!("configuration error: {message}");
            ExitCode::from(1)
        }
        Err(err) => {
            error!("fatal: {err}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(config: Config) -> Result<()> {
    let address = config
        .bind_address()
        .map_err(|err| Error::Config(err.to_string()))?;
    let state = AppState::new(config);
    let bus = state.bus.clone();

    let app = routes::create_router(state);
    let listener = TcpListener::bind(address).await?;
    info!(address = %address, "callwatch API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Final envelope to any open SSE stream before the process exits
    bus.shutdown();
    info!("server stopped gracefully");
    Ok(())
}

async fn run_genesys_connector(
    mut config: Config,
    dry_run: bool,
    target_ingest_url: Option<String>,
) -> Result<()> {
    if let Some(url) = target_ingest_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
    {
        config.genesys.target_ingest_url = url;
    }
    config.genesys.validate(dry_run)?;

    let connector = Arc::new(GenesysConnector::new(config.genesys.clone(), dry_run)?);
    connector.run(watch_shutdown()).await
}

async fn run_audiohook_listener(
    mut config: Config,
    dry_run: bool,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
) -> Result<()> {
    if let Some(host) = host.map(|host| host.trim().to_string()).filter(|host| !host.is_empty()) {
        config.audiohook.host = host;
    }
    if let Some(port) = port {
        config.audiohook.port = port;
    }
    if let Some(path) = path.map(|path| path.trim().to_string()).filter(|path| !path.is_empty()) {
        config.audiohook.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
    }
    config.audiohook.validate(dry_run)?;

    let listener = Arc::new(AudioHookListener::new(
        config.audiohook.clone(),
        config.realtime.audio_default_sample_rate,
        config.realtime.audio_default_channels,
        dry_run,
        watch_shutdown(),
    )?);
    listener.run().await
}

#[allow(clippy::too_many_arguments)]
async fn build_genesys_topics(
    mut config: Config,
    mode: Option<String>,
    queue_filter: Vec<String>,
    user_filter: Vec<String>,
    email_domain: Vec<String>,
    max_queues: Option<usize>,
    max_users: Option<usize>,
    output_file: Option<PathBuf>,
    as_env: bool,
) -> Result<()> {
    if let Some(mode) = mode.map(|mode| mode.trim().to_lowercase()).filter(|mode| !mode.is_empty())
    {
        config.genesys.topic_builder_mode = mode;
    }
    if !queue_filter.is_empty() {
        config.genesys.topic_builder_queue_name_filters = queue_filter;
    }
    if !user_filter.is_empty() {
        config.genesys.topic_builder_user_name_filters = user_filter;
    }
    if !email_domain.is_empty() {
        config.genesys.topic_builder_user_email_domain_filters = email_domain;
    }
    if let Some(max) = max_queues {
        config.genesys.topic_builder_max_queues = max;
    }
    if let Some(max) = max_users {
        config.genesys.topic_builder_max_users = max;
    }
    config.genesys.validate(true)?;

    let connector = Arc::new(GenesysConnector::new(config.genesys.clone(), true)?);
    let preview = connector.build_topics_preview(true).await?;

    let rendered = serde_json::to_string_pretty(&preview)
        .map_err(|err| Error::Internal(err.to_string()))?;
    if let Some(path) = output_file {
        std::fs::write(&path, &rendered)?;
        info!(path = %path.display(), "topic preview written");
    }

    if as_env {
        println!("GENESYS_SUBSCRIPTION_TOPICS={}", preview.topics.join(","));
    } else {
        println!("{rendered}");
    }
    Ok(())
}

/// Flips to true when the process receives SIGINT or SIGTERM
fn watch_shutdown() -> watch::Receiver<bool> {
    let (sender, receiver) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = sender.send(true);
    });
    receiver
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
