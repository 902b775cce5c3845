use clap::Parser;
use tracing_subscriber::EnvFilter;

use itwillsync::cli::{handlers, Cli, Commands, HubCommands};
use itwillsync::{Config, Result};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load();

    // Logs go to stderr; stdout carries the PTY mirror (sessions) or the
    // readiness line (hub daemon).
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("itwillsync=info")
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    let exit_code = match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(mut cli: Cli, config: Config) -> Result<i32> {
    match cli.command.take() {
        Some(Commands::Setup) => {
            handlers::setup(&config)?;
            Ok(0)
        }
        Some(Commands::Hub { command }) => match command {
            HubCommands::Run => {
                itwillsync::hub::run_hub().await?;
                Ok(0)
            }
            HubCommands::Info => {
                handlers::hub_info();
                Ok(0)
            }
            HubCommands::Status => {
                handlers::hub_status().await;
                Ok(0)
            }
            HubCommands::Stop => {
                handlers::hub_stop();
                Ok(0)
            }
        },
        None if cli.hub_info => {
            handlers::hub_info();
            Ok(0)
        }
        None if cli.hub_status => {
            handlers::hub_status().await;
            Ok(0)
        }
        None if cli.hub_stop => {
            handlers::hub_stop();
            Ok(0)
        }
        None => handlers::run_session(cli, config).await,
    }
}
