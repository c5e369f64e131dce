use crate::app::App;
use crate::config::load_config;
use crate::vault::VaultDaemon;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_INTERRUPT: i32 = 130;

#[derive(Parser)]
#[command(name = "adjutant", version = crate::VERSION, about = "Personal AI assistant runtime")]
struct Cli {
    /// Path to adjutant.toml (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start every configured channel plus the gateway (default)
    Run,
    /// Send one message and print the reply
    Chat {
        message: String,
    },
    /// Internal: the out-of-process secret vault
    #[command(hide = true)]
    VaultDaemon {
        #[arg(long)]
        dir: PathBuf,
    },
}

/// Parse arguments and run. Returns the process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let result = match command {
        Command::VaultDaemon { dir } => Arc::new(VaultDaemon::new(dir)).run().await,
        Command::Run => run_app(cli.config.as_deref()).await,
        Command::Chat { message } => {
            return chat_once(cli.config.as_deref(), &message).await;
        }
    };

    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("error: {:#}", e);
            EXIT_ERROR
        }
    }
}

async fn run_app(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let app = App::build(config).await?;
    app.run_until_shutdown().await
}

async fn chat_once(config_path: Option<&std::path::Path>, message: &str) -> i32 {
    let build = async {
        let config = load_config(config_path)?;
        App::build(config).await
    };
    let mut app = match build.await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return EXIT_ERROR;
        }
    };

    let code = tokio::select! {
        result = app.one_shot(message) => match result {
            Ok(reply) => {
                println!("{}", reply);
                EXIT_OK
            }
            Err(e) => {
                eprintln!("error: {:#}", e);
                EXIT_ERROR
            }
        },
        _ = tokio::signal::ctrl_c() => EXIT_INTERRUPT,
    };
    app.shutdown().await;
    code
}
