// Spindle daemon binary

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use spindle::config::Config;
use spindle::ipc::client::IpcClient;
use spindle::ipc::{Request, Response};

#[derive(Parser)]
#[command(name = "spindle")]
#[command(about = "Automated disc ripping, encoding, and library organization", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/spindle/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Start,

    /// Show daemon and queue status
    Status,

    /// Ask a running daemon to shut down
    Stop,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start => {
            spindle::daemon::run(config)?;
        }
        Commands::Status => {
            let response = IpcClient::send(&config.socket_path(), &Request::Status)?;
            match response {
                Response::Status(status) => {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                Response::Error { kind, message } => {
                    anyhow::bail!("daemon error ({}): {}", kind, message);
                }
                other => anyhow::bail!("unexpected response: {:?}", other),
            }
        }
        Commands::Stop => {
            let response = IpcClient::send(&config.socket_path(), &Request::Stop)?;
            match response {
                Response::Ok => println!("Daemon stopping"),
                Response::Error { kind, message } => {
                    anyhow::bail!("daemon error ({}): {}", kind, message);
                }
                other => anyhow::bail!("unexpected response: {:?}", other),
            }
        }
    }

    Ok(())
}
