use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use shared::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

mod cancel;
mod controller;
mod decoder;
mod mindmap;
mod server;
mod slot;
mod storage;

use controller::JobController;
use decoder::chat::OpenAiChat;
use server::AppState;
use storage::UploadStore;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "scribe-daemon")]
#[command(about = "Transcription and summary service")]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/scribe/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Write the default config to the config path and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.init_config {
        let path = args
            .config
            .or_else(Config::default_path)
            .context("No config directory available; pass --config")?;
        Config::default().save(&path)?;
        info!("Wrote default config to {:?}", path);
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    info!("Starting scribe daemon");

    let transcriber = decoder::build_transcriber(&config.transcription)?;
    if config.llm.api_key().is_none() {
        warn!(
            "{} is not set; summary, chat and mindmap requests will fail",
            config.llm.api_key_env
        );
    }
    let chat = Arc::new(OpenAiChat::new(&config.llm));
    let store = UploadStore::new(&config.server.upload_dir).with_context(|| {
        format!("Failed to create upload directory {:?}", config.server.upload_dir)
    })?;
    info!("Storing uploads in {:?}", store.dir());
    let controller = Arc::new(JobController::new(transcriber, config.jobs.stop_grace()));

    let idle = Arc::clone(&controller);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(IDLE_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            idle.release_idle().await;
        }
    });

    let state = AppState {
        controller,
        chat,
        store: Arc::new(store),
        llm: Arc::new(config.llm.clone()),
    };
    let app = server::router(state, &config);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
