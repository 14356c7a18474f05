//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use settle_core::{config, logging};

mod commands;

#[derive(Parser)]
#[command(name = "settle")]
#[command(version)]
#[command(about = "Chat with a wallet agent and track settlement of submitted operations")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Agent runtime base URL (overrides SETTLE_AGENT_URL and config)
    #[arg(long, global = true, value_name = "URL")]
    agent_url: Option<String>,

    /// Read the wallet private key from this environment variable
    #[arg(long, global = true, value_name = "VAR")]
    key_env: Option<String>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Interactive chat over stdin (the default)
    Chat {
        /// On exit, wait for in-flight settlements instead of abandoning them
        #[arg(long)]
        wait: bool,
    },
    /// Sends a single prompt and prints the conversation
    Send {
        /// The prompt to send to the agent
        #[arg(short, long)]
        prompt: String,

        /// Wait for settlements started by the prompt before exiting
        #[arg(long)]
        wait: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // held until exit so buffered file logs are flushed
    let _log_guard = logging::init();

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli {
        command,
        agent_url,
        key_env,
    } = cli;

    let open = || -> Result<commands::Context> {
        let config = config::Config::load().context("load config")?;
        commands::Context::new(config, agent_url.as_deref(), key_env.clone())
    };

    // default to chat mode
    let Some(command) = command else {
        return commands::chat::run(&open()?, false).await;
    };

    match command {
        Commands::Chat { wait } => commands::chat::run(&open()?, wait).await,
        Commands::Send { prompt, wait } => commands::send::run(&open()?, &prompt, wait).await,
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}
