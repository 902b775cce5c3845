use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "itwillsync")]
#[command(about = "Share terminal AI agents with your phone", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Starting port for the session server (scans upward from here)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bind to 127.0.0.1 only
    #[arg(long)]
    pub localhost: bool,

    /// Use tailscale networking for this session
    #[arg(long)]
    pub tailscale: bool,

    /// Use local-network mode for this session
    #[arg(long)]
    pub local: bool,

    /// Skip QR code rendering
    #[arg(long = "no-qr")]
    pub no_qr: bool,

    /// Display name for this session on the dashboard
    #[arg(long)]
    pub name: Option<String>,

    /// Print hub connection info and exit
    #[arg(long = "hub-info")]
    pub hub_info: bool,

    /// Print hub status and exit
    #[arg(long = "hub-status")]
    pub hub_status: bool,

    /// Stop the hub daemon and exit
    #[arg(long = "hub-stop")]
    pub hub_stop: bool,

    /// Agent command and its arguments (defaults to your shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub agent: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default config file
    Setup,
    /// Hub management
    Hub {
        #[command(subcommand)]
        command: HubCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum HubCommands {
    /// Show hub connection info
    Info,
    /// Show hub status and registered sessions
    Status,
    /// Stop the hub daemon
    Stop,
    /// Run the hub daemon in the foreground (spawned internally)
    #[command(hide = true)]
    Run,
}
