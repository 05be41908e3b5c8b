#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use agentwire::broker::Broker;
use agentwire::config::Config;
use agentwire::store::{ProjectStore, SqliteStore};
use agentwire::sync::SyncHandler;
use agentwire::{gateway, simulator, TokenCommands};
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `AgentWire` - dispatch work to registered agents over one socket each.
#[derive(Parser, Debug)]
#[command(name = "agentwire")]
#[command(version)]
#[command(about = "Bidirectional connection broker for local agents.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway server
    Serve {
        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Listen host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// SQLite database path (overrides config)
        #[arg(long)]
        db: Option<String>,
    },
    /// Run a reference agent against a gateway
    #[command(long_about = "Run a reference agent against a gateway.\n\n\
        The agent performs the object sync handshake, then answers dispatched\n\
        tasks until disconnected.\n\n\
        Examples:\n  \
        agentwire simulate --token aw_...\n  \
        agentwire simulate --url ws://127.0.0.1:4076/ws/agent --token aw_...")]
    Simulate {
        /// Gateway WebSocket endpoint
        #[arg(long, default_value = "ws://127.0.0.1:4076/ws/agent")]
        url: String,
        /// Issued agent token
        #[arg(long)]
        token: String,
    },
    /// Manage agent tokens
    Token {
        #[command(subcommand)]
        token_command: TokenCommands,
    },
    /// Print the config file JSON schema
    Schema,
    /// Generate shell completions
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for Rustls TLS. Without this, rustls
    // cannot pick between ring and aws-lc-rs when both end up enabled.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    // Completions must remain stdout-only and should not load config or
    // initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    match cli.command {
        Commands::Serve { port, host, db } => {
            let mut config = Config::load().await?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(db) = db {
                config.storage.db_path = db;
            }
            serve(config).await
        }

        Commands::Simulate { url, token } => simulator::run(&url, &token).await,

        Commands::Token { token_command } => {
            let config = Config::load().await?;
            let store = SqliteStore::open(config.resolved_db_path())?;
            match token_command {
                TokenCommands::Issue { project } => {
                    let token = store.issue_token(&project).await?;
                    println!("{token}");
                }
                TokenCommands::List => {
                    for agent in store.list_agents().await? {
                        let presence = if agent.online { "online" } else { "offline" };
                        println!("{}\t{}\t{}", agent.token, agent.project, presence);
                    }
                }
            }
            Ok(())
        }

        Commands::Schema => {
            let schema = schemars::schema_for!(Config);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }

        Commands::Completions { .. } => unreachable!(),
    }
}

async fn serve(config: Config) -> Result<()> {
    let store: Arc<dyn ProjectStore> = Arc::new(SqliteStore::open(config.resolved_db_path())?);
    let handler = Arc::new(SyncHandler::new(store.clone()));
    let broker = Broker::new(store.clone(), handler);

    // Ctrl+C cancels the reader loops and the HTTP accept loop together.
    let shutdown_broker = broker.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {e}");
            return;
        }
        tracing::info!("shutting down");
        shutdown_broker.shutdown().await;
    });

    gateway::run_gateway(&config, broker, store).await
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
