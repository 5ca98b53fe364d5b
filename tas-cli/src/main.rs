//! tas-cli - Command-line interface for TAS servers
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tas_client::{Client, ConnectionConfig, Endpoint, ResetMode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tas-cli")]
#[command(about = "Command-line interface for TAS debug servers")]
#[command(version)]
struct Cli {
    /// Server endpoint (host[:port])
    #[arg(short, long, env = "TAS_SERVER", default_value = "localhost")]
    server: String,

    /// Link timeout in milliseconds
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,

    #[command(flatten)]
    binding: Binding,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Target session used by commands that touch a device.
#[derive(Args, Debug, Clone, Default)]
pub struct Binding {
    /// Target identifier
    #[arg(short, long, env = "TAS_TARGET")]
    pub target: Option<String>,

    /// Session label shared by all clients of the target
    #[arg(long, env = "TAS_SESSION", default_value = "")]
    pub session: String,

    /// Session password
    #[arg(long, env = "TAS_SESSION_PW", default_value = "", hide_env_values = true)]
    pub password: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Show server info
    Info,

    /// List targets
    Targets,

    /// List the clients attached to a target
    Clients {
        /// Target identifier
        target: String,
    },

    /// Ping the bound target and show its connection info
    Ping,

    /// Read device memory
    Read {
        /// Start address (decimal or 0x-prefixed)
        #[arg(value_parser = commands::parse_u64)]
        addr: u64,

        /// Number of bytes
        #[arg(value_parser = commands::parse_u32)]
        len: u32,
    },

    /// Write device memory
    Write {
        /// Start address (decimal or 0x-prefixed)
        #[arg(value_parser = commands::parse_u64)]
        addr: u64,

        /// Data as a hex string
        data: String,
    },

    /// Fill device memory with a repeated pattern
    Fill {
        /// Start address, 8-byte aligned
        #[arg(value_parser = commands::parse_u64)]
        addr: u64,

        /// Pattern value
        #[arg(value_parser = commands::parse_u64)]
        pattern: u64,

        /// Number of bytes, a multiple of 8
        #[arg(value_parser = commands::parse_u32)]
        len: u32,

        /// Treat the pattern as 64 bits wide
        #[arg(long)]
        wide: bool,
    },

    /// Reset and/or halt the device
    Reset {
        #[arg(value_enum, default_value = "reset")]
        mode: ResetArg,
    },

    /// Send a text message on a channel
    ChlSend {
        /// Channel id
        chl: u8,

        /// Message text
        text: String,
    },

    /// Wait for one message on a channel
    ChlRecv {
        /// Channel id
        chl: u8,

        /// Receive timeout in milliseconds
        #[arg(long, default_value = "1000")]
        timeout_ms: u32,
    },

    /// Print the identity hash of a device id
    HashId {
        /// Four device id words
        #[arg(num_args = 4, value_parser = commands::parse_u32)]
        words: Vec<u32>,
    },
}

impl Commands {
    /// Returns true when the command needs a bound session.
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            Commands::Ping
                | Commands::Read { .. }
                | Commands::Write { .. }
                | Commands::Fill { .. }
                | Commands::Reset { .. }
                | Commands::ChlSend { .. }
                | Commands::ChlRecv { .. }
        )
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetArg {
    /// Attach without touching the running device
    Hot,
    Reset,
    Halt,
}

impl From<ResetArg> for ResetMode {
    fn from(arg: ResetArg) -> Self {
        match arg {
            ResetArg::Hot => ResetMode::HotAttach,
            ResetArg::Reset => ResetMode::Reset,
            ResetArg::Halt => ResetMode::ResetAndHalt,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Handle hash-id locally (no server connection needed)
    if let Some(Commands::HashId { words }) = &cli.command {
        println!("{}", commands::hash_id(words)?);
        return Ok(());
    }

    let endpoint: Endpoint = cli.server.parse()?;
    let config = ConnectionConfig::new(endpoint)
        .with_client_name("tas-cli")
        .with_user_name(std::env::var("USER").unwrap_or_default())
        .with_request_timeout(std::time::Duration::from_millis(cli.timeout_ms));

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(config, cli.binding).await?;
        }
        Some(Commands::HashId { .. }) => unreachable!(), // Already handled above
        Some(cmd) => {
            let client = Client::connect(config).await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let result = commands::execute(&client, &cli.binding, cmd).await;
            let _ = client.close().await;

            match result {
                Ok(output) => println!("{}", output),
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
