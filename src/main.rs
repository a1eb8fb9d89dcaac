use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodeimage_auth::{config, gateway, security};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Authentication gateway for the NodeImage backend.
#[derive(Parser, Debug)]
#[command(name = "nodeimage-auth", version, about)]
struct Cli {
    /// Path to a TOML config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Hash a password read from stdin with the configured Argon2id parameters
    HashPassword,
    /// Load and validate the configuration, then exit
    VerifyConfig,
}

fn init_logging(production: bool) {
    let default_level = if production { "info" } else { "debug" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!production)
        .with_target(!production)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let production =
        config::environment_is_production(cli.config.as_deref(), |key| std::env::var(key).ok());
    init_logging(production);

    let mut cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                cfg.http.host = host;
            }
            if let Some(port) = port {
                cfg.http.port = port;
            }
            gateway::run_gateway(cfg).await
        }
        Commands::HashPassword => {
            let mut password = String::new();
            std::io::stdin()
                .read_to_string(&mut password)
                .context("failed to read password from stdin")?;
            let password = password.trim_end_matches(['\r', '\n']);
            if password.is_empty() {
                anyhow::bail!("empty password on stdin");
            }
            let hash = security::hash_password(password, &cfg.password)?;
            println!("{hash}");
            Ok(())
        }
        Commands::VerifyConfig => {
            println!("{cfg:#?}");
            println!("configuration OK");
            Ok(())
        }
    }
}
