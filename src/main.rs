//! CLI entry point: per-project server startup, singleton enforcement,
//! graceful shutdown.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agentsmithy::chat::ChatService;
use agentsmithy::config::{LogFormat, Settings};
use agentsmithy::dialogs::DialogStore;
use agentsmithy::llm::OpenAiProvider;
use agentsmithy::project::{ensure_singleton_and_select_port, Project, ScanStatus, ServerStatus};
use agentsmithy::rag::{EmbeddingsClient, RagStore};
use agentsmithy::server::{self, AppState};

#[derive(Parser)]
#[command(name = "agentsmithy")]
#[command(about = "Per-project self-hosted coding assistant server")]
struct Cli {
    /// Project directory; `.agentsmithy/` state is created here.
    #[arg(long)]
    workdir: PathBuf,

    /// IDE identifier injected into the system prompt.
    #[arg(long)]
    ide: Option<String>,
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    match settings.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.workdir);
    settings.ide = cli.ide.clone();
    init_logging(&settings);

    let project = match Project::open(&cli.workdir) {
        Ok(project) => Arc::new(project),
        Err(e) => {
            error!(error = %e, "Failed to open project");
            eprintln!("error: {e}");
            return ExitCode::from(3);
        }
    };

    let status = Arc::new(project.status_manager());

    // Singleton check and port probe; writes server_status = "starting".
    let port = match ensure_singleton_and_select_port(
        &project,
        &status,
        &settings.host,
        settings.base_port,
    ) {
        Ok(port) => port,
        Err(e) => {
            error!(error = %e, "Startup refused");
            eprintln!("error: {e}");
            return ExitCode::from(4);
        }
    };

    // Config problems are surfaced through status.json, never fatal: a
    // missing API key just means chat requests will fail until it is set.
    let config_errors = settings.validate();
    status.update_config_status(config_errors.is_empty(), &config_errors);
    for problem in &config_errors {
        info!(problem = %problem, "Config validation");
    }

    let store = match DialogStore::open(&project.dialog_db_path()).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open dialog database");
            status.update_server_status(ServerStatus::Error, None, None, Some(&e.to_string()));
            return ExitCode::from(5);
        }
    };

    let api_key = settings.api_key.clone().unwrap_or_default();
    let provider = Arc::new(OpenAiProvider::new(
        &api_key,
        &settings.base_url,
        &settings.model,
        Duration::from_secs(settings.llm_chunk_timeout_secs),
    ));
    let embeddings = settings
        .api_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .map(|key| EmbeddingsClient::new(key, &settings.base_url, &settings.embedding_model));
    let rag = Arc::new(RagStore::new(
        &project.rag_dir(),
        project.root(),
        embeddings,
    ));

    // Initial index reconciliation, surfaced through the scan fields.
    {
        let rag = rag.clone();
        let status = status.clone();
        tokio::spawn(async move {
            status.update_scan_status(ScanStatus::Scanning, Some(0), None);
            match rag.full_sync().await {
                Ok(stats) => {
                    info!(
                        checked = stats.checked,
                        reindexed = stats.reindexed,
                        removed = stats.removed,
                        "Initial RAG sync complete"
                    );
                    status.update_scan_status(ScanStatus::Done, Some(100), None);
                }
                Err(e) => {
                    status.update_scan_status(ScanStatus::Error, None, Some(&e.to_string()));
                }
            }
        });
    }

    let shutdown = CancellationToken::new();
    let chat = Arc::new(ChatService::new(
        project.clone(),
        store.clone(),
        provider,
        rag,
        settings.clone(),
        shutdown.clone(),
    ));

    let state = AppState {
        project: project.clone(),
        chat,
        store,
        settings: Arc::new(settings.clone()),
        status: status.clone(),
        shutdown: shutdown.clone(),
        port,
    };

    // Signal handler: mark stopping, then cancel everything. Active SSE
    // streams notice the token and emit error{shutdown} + done before the
    // transport closes.
    {
        let status = status.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping server");
            status.update_server_status(ServerStatus::Stopping, None, None, None);
            shutdown.cancel();
        });
    }

    let result = server::run(state, &settings.host, port).await;

    match result {
        Ok(()) => {
            status.update_server_status(ServerStatus::Stopped, None, None, None);
            info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            status.update_server_status(ServerStatus::Error, None, None, Some(&e.to_string()));
            ExitCode::from(6)
        }
    }
}
