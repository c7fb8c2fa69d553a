//! `tmuxdeck`: session server plus a small client for scripting it.

mod cli;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tmuxdeck_pty::{
    build_router,
    notify::Notifier,
    store::{JsonProjectStore, MemoryProjectStore, ProjectStore},
    AppState, Config, Registry, DEFAULT_PORT,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tmuxdeck")]
#[command(about = "Run and watch assistant CLI sessions under tmux")]
#[command(version)]
struct Cli {
    /// Server URL for client commands
    #[arg(
        short = 'S',
        long,
        env = "TMUXDECK_URL",
        default_value = "http://localhost:39383"
    )]
    server: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session server
    Server {
        /// Host to bind to
        #[arg(long, env = "TMUXDECK_HOST", default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, env = "TMUXDECK_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Config file (defaults to the OS config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List sessions
    #[command(visible_alias = "ls")]
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start (or restart) a session
    Start {
        /// Session id, usually the project id
        session: String,

        /// Working directory (defaults to the current directory)
        #[arg(short, long)]
        cwd: Option<PathBuf>,

        /// Command to launch inside the session
        #[arg(long, default_value = "claude")]
        command: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Launch the assistant without permission prompts
        #[arg(long)]
        bypass_permissions: bool,
    },

    /// Stop one or more sessions
    #[command(visible_alias = "kill")]
    Stop {
        #[arg(required = true)]
        sessions: Vec<String>,
    },

    /// Send text to a session
    Send {
        session: String,

        text: String,

        /// Don't press Enter after the text
        #[arg(long)]
        no_enter: bool,
    },

    /// Resize a session's terminal
    Resize {
        session: String,

        #[arg(short = 'x', long)]
        cols: u16,

        #[arg(short = 'y', long)]
        rows: u16,
    },

    /// Attach to a session's output (Ctrl-] detaches)
    Attach {
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Server { host, port, config }) => {
            run_server(&host, port, config).await
        }

        // No command = server mode
        None => {
            let host = env::var("TMUXDECK_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
            let port = match env::var("TMUXDECK_PORT") {
                Ok(raw) => raw.parse().context("Invalid TMUXDECK_PORT")?,
                Err(_) => DEFAULT_PORT,
            };
            run_server(&host, port, None).await
        }

        Some(Commands::List { json }) => cli::cmd_list(&cli.server, json).await,

        Some(Commands::Start {
            session,
            cwd,
            command,
            name,
            bypass_permissions,
        }) => {
            cli::cmd_start(
                &cli.server,
                cli::StartArgs {
                    session,
                    cwd,
                    command,
                    name,
                    bypass_permissions,
                },
            )
            .await
        }

        Some(Commands::Stop { sessions }) => cli::cmd_stop(&cli.server, &sessions).await,

        Some(Commands::Send {
            session,
            text,
            no_enter,
        }) => cli::cmd_send(&cli.server, &session, &text, !no_enter).await,

        Some(Commands::Resize {
            session,
            cols,
            rows,
        }) => cli::cmd_resize(&cli.server, &session, cols, rows).await,

        Some(Commands::Attach { session }) => cli::cmd_attach(&cli.server, &session).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(host: &str, port: u16, config_path: Option<PathBuf>) -> Result<()> {
    init_tracing();

    let config = Config::load(config_path.as_deref());
    let projects: Arc<dyn ProjectStore> = match config.projects_path() {
        Some(path) => {
            info!("Project metadata at {}", path.display());
            Arc::new(JsonProjectStore::new(path))
        }
        None => Arc::new(MemoryProjectStore::default()),
    };

    let registry = Registry::with_pty(config);
    let notifier = Notifier::new();
    notifier.spawn(registry.subscribe_status());

    let state = Arc::new(AppState::new(registry.clone(), notifier, projects));
    let app = build_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("tmuxdeck server running on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    registry.shutdown().await;
    Ok(())
}
