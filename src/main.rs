mod admin;
mod balancer;
mod channel;
mod config;
mod error;
mod logging;
mod metrics;
mod policy;
mod pool;
mod result;
mod server;
mod signal;
mod supervisor;
mod utils;
mod worker;

use std::{path::PathBuf, process};

use channel::{Backend, ConfigChannel, MemoryChannel, RedisChannel, SERVERS_KEY};
use clap::{Parser, Subcommand};
use config::AppConfig;
use result::Result;
use supervisor::Supervisor;
use tracing::{info_span, warn, Instrument};

#[derive(Parser)]
#[command(name = "load-balancer")]
#[command(about = "HTTP load balancer with runtime switchable policies", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one worker process per CPU (default)
    Serve,
    /// Run a single worker in this process
    #[command(hide = true)]
    Worker,
    #[command(flatten)]
    Admin(AdminCommand),
}

/// Commands writing to the configuration channel.
#[derive(Subcommand)]
enum AdminCommand {
    /// Manage the shared server list
    Servers {
        #[command(subcommand)]
        command: ServersCommand,
    },
    /// Ask workers to switch to RoundRobin or LeastConnection
    Policy { name: String },
    /// Remove every key from the configuration store
    Reset,
}

#[derive(Subcommand)]
enum ServersCommand {
    /// Add comma-separated addresses to the server list
    Add { addresses: String },
    /// Delete the stored server list
    Clear,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    let _log_guard = logging::init(&config.log);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if config.channel.backend == Backend::Memory && config.supervisor.worker_count() > 1 {
                warn!("memory channel is per process, workers will not share updates");
            }
            let supervisor = Supervisor::new(config.supervisor.clone(), cli.config.as_deref())?;
            supervisor
                .run()
                .instrument(info_span!("supervisor", pid = process::id()))
                .await
        }
        Commands::Worker => run_worker(config)
            .instrument(info_span!("worker", pid = process::id()))
            .await,
        Commands::Admin(command) => match config.channel.backend {
            Backend::Redis => {
                let channel = RedisChannel::connect(&config.channel.url).await?;
                run_admin(&channel, command).await
            }
            Backend::Memory => {
                warn!("memory channel is per process, changes are not visible to workers");
                run_admin(&MemoryChannel::new(), command).await
            }
        },
    }
}

async fn run_worker(config: AppConfig) -> Result<()> {
    match config.channel.backend {
        Backend::Redis => {
            let channel = RedisChannel::connect(&config.channel.url).await?;
            worker::run(config, channel).await
        }
        Backend::Memory => {
            let channel = MemoryChannel::new();
            if !config.channel.servers.is_empty() {
                let servers = config.channel.servers.join(",");
                channel.put(SERVERS_KEY, &servers, None).await?;
            }
            worker::run(config, channel).await
        }
    }
}

async fn run_admin<C: ConfigChannel>(channel: &C, command: AdminCommand) -> Result<()> {
    match command {
        AdminCommand::Servers {
            command: ServersCommand::Add { addresses },
        } => {
            let (list, receivers) = admin::add_servers(channel, &addresses).await?;
            println!("servers: {list}");
            println!("delivered to {receivers} subscribers");
        }
        AdminCommand::Servers {
            command: ServersCommand::Clear,
        } => {
            admin::clear_servers(channel).await?;
            println!("server list cleared");
        }
        AdminCommand::Policy { name } => {
            let policy = admin::set_policy(channel, &name).await?;
            println!("policy set to {policy}");
        }
        AdminCommand::Reset => {
            admin::reset(channel).await?;
            println!("configuration store cleared");
        }
    }

    Ok(())
}
