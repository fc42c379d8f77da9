//! `questload` binary entry point — resolves configuration, opens the
//! storage backend, wires `EngineContext`, and branches into one of three
//! shells: direct CLI dispatch (default), `serve` (HTTP + reapers), or
//! `mcp` (stdio JSON-RPC tool server). No single shell is privileged; all
//! three dispatch through the same command registry (`spec.md` §6).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use questload::command::CommandRegistry;
use questload::config::EngineConfig;
use questload::storage::memory::InMemoryStorageProvider;
use questload::storage::sqlite::SqliteStorageProvider;
use questload::storage::StorageProvider;
use questload::{cli, mcp, rest, EngineContext};

#[derive(Parser)]
#[command(name = "questload", disable_help_subcommand = true)]
struct TopLevel {
    /// Override the engine's data directory (holds the SQLite database and
    /// config.toml).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    http_port: Option<u16>,
    #[arg(long, global = true)]
    log: Option<String>,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(clap::Subcommand)]
enum Mode {
    /// Run the HTTP API and the background reapers until killed.
    Serve,
    /// Run the MCP tool server over stdio until stdin closes.
    Mcp,
    /// Run a single command (everything that isn't `serve`/`mcp`), e.g.
    /// `questload create-project demo`.
    #[command(external_subcommand)]
    Command(Vec<String>),
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let top = TopLevel::parse_from(std::iter::once("questload".to_string()).chain(args.clone()));

    let config = EngineConfig::new(top.data_dir.clone(), top.http_port, top.log.clone());
    init_tracing(&config.log);

    let storage = match open_storage(&config).await {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("failed to open storage: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = storage.init().await {
        eprintln!("failed to initialize storage: {e}");
        std::process::exit(1);
    }

    let ctx = Arc::new(EngineContext::new(storage));

    let exit_code = match top.mode {
        Mode::Serve => {
            if let Err(e) = ctx.reapers.start_all_reapers().await {
                tracing::error!(error = %e, "failed to start reapers");
            }
            let state = rest::RestState::new(ctx.clone(), &config);
            tokio::spawn(rest::run_session_sweeper(state.clone()));
            match rest::serve(state, config.http_port).await {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "HTTP shell exited");
                    1
                }
            }
        }
        Mode::Mcp => match mcp::run_stdio(ctx.clone(), CommandRegistry::new()).await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "MCP shell exited");
                1
            }
        },
        Mode::Command(command_args) => {
            let registry = CommandRegistry::new();
            cli::run(ctx.clone(), &registry, command_args).await
        }
    };

    ctx.storage.close().await.ok();
    std::process::exit(exit_code);
}

async fn open_storage(config: &EngineConfig) -> anyhow::Result<Arc<dyn StorageProvider>> {
    if config.in_memory {
        return Ok(Arc::new(InMemoryStorageProvider::new()));
    }
    let storage = SqliteStorageProvider::connect(&config.data_dir).await?;
    Ok(Arc::new(storage))
}

fn init_tracing(filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}
