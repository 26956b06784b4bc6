//! Load Fleet CLI
//!
//! A command-line tool for inspecting agents, running liveness sweeps and
//! driving load-test executions through the fleet server API.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{agents, executions, heartbeat, plans};
use output::OutputFormat;

/// Load Fleet CLI
#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about = "CLI for the Load Fleet orchestrator", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via FLEET_API_URL env var)
    #[arg(long, env = "FLEET_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and test agents
    #[command(subcommand)]
    Agents(AgentCommands),

    /// Manage load-test executions
    #[command(subcommand)]
    Executions(ExecutionCommands),

    /// Liveness sweeps and fleet status
    #[command(subcommand)]
    Heartbeat(HeartbeatCommands),

    /// Allocation plans
    #[command(subcommand)]
    Plans(PlanCommands),

    /// Persisted CLI settings
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// List agents
    List {
        /// Filter by status (online, offline, maintenance)
        #[arg(long)]
        status: Option<String>,
    },

    /// Show agent details
    Show {
        /// Agent ID
        id: u64,
    },

    /// Test connectivity and refresh hardware facts
    Test {
        /// Agent ID
        id: u64,
    },
}

#[derive(Subcommand)]
pub enum ExecutionCommands {
    /// List executions
    List {
        /// Filter by status (pending, running, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,

        /// Filter by agent
        #[arg(long)]
        agent: Option<u64>,

        /// Maximum number of executions
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show execution details and results
    Show {
        /// Execution ID
        id: u64,
    },

    /// Start a pending execution
    Start {
        /// Execution ID
        id: u64,
    },

    /// Stop a pending or running execution
    Stop {
        /// Execution ID
        id: u64,

        /// Reason recorded on the execution
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum HeartbeatCommands {
    /// Run a liveness sweep now
    Check,

    /// Queue a liveness sweep in the background
    CheckAsync,

    /// Show fleet liveness counts
    Status,

    /// Mark agents with stale heartbeats offline
    Cleanup {
        /// Staleness threshold in minutes (server default if omitted)
        #[arg(long)]
        threshold_minutes: Option<i64>,

        /// Queue the sweep instead of waiting for it
        #[arg(long)]
        background: bool,
    },

    /// Show a queued sweep
    Task {
        /// Task ID returned by check-async or cleanup --background
        task_id: String,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// List allocation plans
    List {
        /// Filter by agent
        #[arg(long)]
        agent: Option<u64>,
    },

    /// Re-validate a plan against its agent's capacity
    Validate {
        /// Plan ID
        id: u64,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective settings
    Show,

    /// Persist the API URL
    SetUrl {
        /// API endpoint URL
        url: String,
    },

    /// Persist the default output format
    SetFormat {
        /// Output format
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = config::Config::load()?;
    let api_url = settings.resolve_api_url(cli.api_url.as_deref());
    let format = cli
        .format
        .or_else(|| {
            settings
                .default_format
                .as_deref()
                .and_then(OutputFormat::from_name)
        })
        .unwrap_or_default();

    if cli.verbose {
        output::print_info(&format!("Using API at {}", api_url));
    }

    let command = match cli.command {
        Commands::Config(cmd) => return run_config(cmd, settings, &api_url, format),
        other => other,
    };

    // Initialize client
    let client = client::ApiClient::new(&api_url)?;

    // Execute command
    match command {
        Commands::Agents(cmd) => match cmd {
            AgentCommands::List { status } => agents::list_agents(&client, status, format).await?,
            AgentCommands::Show { id } => agents::show_agent(&client, id, format).await?,
            AgentCommands::Test { id } => agents::test_agent(&client, id, format).await?,
        },
        Commands::Executions(cmd) => match cmd {
            ExecutionCommands::List {
                status,
                agent,
                limit,
            } => executions::list_executions(&client, status, agent, limit, format).await?,
            ExecutionCommands::Show { id } => {
                executions::show_execution(&client, id, format).await?
            }
            ExecutionCommands::Start { id } => {
                executions::start_execution(&client, id, format).await?
            }
            ExecutionCommands::Stop { id, reason } => {
                executions::stop_execution(&client, id, reason, format).await?
            }
        },
        Commands::Heartbeat(cmd) => match cmd {
            HeartbeatCommands::Check => heartbeat::check(&client, format).await?,
            HeartbeatCommands::CheckAsync => heartbeat::check_async(&client, format).await?,
            HeartbeatCommands::Status => heartbeat::status(&client, format).await?,
            HeartbeatCommands::Cleanup {
                threshold_minutes,
                background,
            } => heartbeat::cleanup(&client, threshold_minutes, background, format).await?,
            HeartbeatCommands::Task { task_id } => {
                heartbeat::task(&client, &task_id, format).await?
            }
        },
        Commands::Plans(cmd) => match cmd {
            PlanCommands::List { agent } => plans::list_plans(&client, agent, format).await?,
            PlanCommands::Validate { id } => plans::validate_plan(&client, id, format).await?,
        },
        Commands::Config(_) => {}
    }

    Ok(())
}

fn run_config(
    cmd: ConfigCommands,
    mut settings: config::Config,
    api_url: &str,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            output::print_field("API URL", api_url);
            output::print_field("Format", format!("{:?}", format).to_lowercase());
            output::print_field("Config file", config::Config::config_path()?.display());
        }
        ConfigCommands::SetUrl { url } => {
            client::ApiClient::new(&url)?;
            settings.api_url = Some(url);
            let path = settings.save()?;
            output::print_success(&format!("Saved API URL to {}", path.display()));
        }
        ConfigCommands::SetFormat { format } => {
            settings.default_format = Some(format!("{:?}", format).to_lowercase());
            let path = settings.save()?;
            output::print_success(&format!("Saved default format to {}", path.display()));
        }
    }
    Ok(())
}
