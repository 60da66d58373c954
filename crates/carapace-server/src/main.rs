//! `carapace-server` -- the thin in-scope slice of the externally-specified
//! CLI surface (spec.md §1): just enough to load configuration and wire it
//! into [`carapace_server::Server`]. Concrete transport bindings and
//! container runtimes are supplied by the caller (spec.md §1, §4.1); this
//! binary uses the in-memory fakes so `serve` is runnable standalone for
//! local smoke-testing without a real container backend.

use std::path::PathBuf;
use std::sync::Arc;

use carapace_containers::FakeRuntime;
use carapace_core::dispatcher::InMemorySessionIdStore;
use carapace_core::CarapaceConfig;
use carapace_server::{Server, Transport};
use carapace_transport::{FakeBus, FakeHub};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "carapace", about = "Carapace host-side agent broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load config, wire the server, and run until interrupted.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse a config file and report whether it's well-formed, without
    /// starting anything.
    ValidateConfig {
        config: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<CarapaceConfig, String> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("reading {}: {e}", path.display()))?;
            CarapaceConfig::from_toml(&raw).map_err(|e| format!("parsing {}: {e}", path.display()))?
        }
        None => CarapaceConfig::default(),
    };
    Ok(config.apply_env_overrides())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::ValidateConfig { config } => match load_config(Some(&config)) {
            Ok(_) => {
                println!("{} is valid", config.display());
                std::process::ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{err}");
                std::process::ExitCode::FAILURE
            }
        },
        Command::Serve { config } => {
            let config = match load_config(config.as_ref()) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("{err}");
                    return std::process::ExitCode::FAILURE;
                }
            };

            // Demo transport + runtime: the real Router/Dealer socket
            // bindings and container runtime are external integrations
            // (spec.md §1, §4.1); this lets `serve` run end-to-end without
            // one for local smoke-testing.
            let hub = FakeHub::new();
            let bus = FakeBus::new();
            let transport = Transport {
                router: Arc::new(hub.router()),
                publisher: Arc::new(bus.publisher()),
                subscriber: Arc::new(bus.subscriber().await),
            };
            let runtime = Arc::new(FakeRuntime::new());
            let session_store = Arc::new(InMemorySessionIdStore::new());

            let server = match Server::start(config, transport, runtime, session_store).await {
                Ok(server) => server,
                Err(err) => {
                    eprintln!("failed to start: {err}");
                    return std::process::ExitCode::FAILURE;
                }
            };

            if tokio::signal::ctrl_c().await.is_err() {
                eprintln!("failed to listen for ctrl-c; shutting down anyway");
            }
            info!("shutdown signal received");
            server.stop().await;
            std::process::ExitCode::SUCCESS
        }
    }
}
