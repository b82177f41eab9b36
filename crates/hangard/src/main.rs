//! hangard: the Hangar daemon.
//!
//! Single binary for both sides of the fleet:
//! - `coordinator`: store, scheduler, sync + instance gRPC, HTTP API
//! - `agent`: per-host VM lifecycle, guest IP endpoint, sync client
//! - `vm`: maintenance commands over the local VM bundles
//!
//! # Usage
//!
//! ```text
//! hangard coordinator --grpc-addr 0.0.0.0:50051
//! hangard agent --server-addr coordinator:50051 --max-runners 2
//! hangard vm list
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use hangar_core::config::HangarConfig;
use tracing_subscriber::EnvFilter;

use hangard::{agent_mode, control_plane, vm_cmd};

#[derive(Parser)]
#[command(name = "hangard", about = "Hangar runner fleet daemon")]
struct Cli {
    /// TOML config file; flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator.
    Coordinator {
        /// gRPC listen address for agents and the autoscaler.
        #[arg(long)]
        grpc_addr: Option<String>,

        /// HTTP API listen address.
        #[arg(long)]
        http_addr: Option<String>,
    },

    /// Run the host agent.
    Agent {
        /// Coordinator gRPC address.
        #[arg(long)]
        server_addr: Option<String>,

        /// Hostname advertised to the coordinator.
        #[arg(long)]
        hostname: Option<String>,

        /// Concurrent runners on this host (1 or 2).
        #[arg(long)]
        max_runners: Option<u32>,

        #[arg(long)]
        template_path: Option<PathBuf>,

        #[arg(long)]
        runners_path: Option<PathBuf>,

        /// Private key used to reach guests over SSH.
        #[arg(long)]
        ssh_key: Option<PathBuf>,

        /// Listen address for guest IP announcements.
        #[arg(long)]
        ip_notify_addr: Option<String>,
    },

    /// Inspect or act on local VMs.
    Vm {
        #[arg(long)]
        runners_path: Option<PathBuf>,

        #[command(subcommand)]
        action: VmAction,
    },
}

#[derive(Subcommand)]
enum VmAction {
    /// List VM bundles.
    List,
    /// Stop a VM (graceful first, then forced).
    Stop { runner_id: String },
    /// Stop and remove a VM.
    Delete { runner_id: String },
    /// Run a command inside a VM through the guest shim.
    Exec {
        runner_id: String,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hangard=debug,hangar=debug".parse().unwrap());
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => HangarConfig::from_file(path)?,
        None => HangarConfig::default(),
    };

    match cli.command {
        Command::Coordinator {
            grpc_addr,
            http_addr,
        } => {
            let coordinator = &mut config.coordinator;
            if let Some(addr) = grpc_addr {
                coordinator.grpc_addr = addr;
            }
            if let Some(addr) = http_addr {
                coordinator.http_addr = addr;
            }
            control_plane::run_coordinator(config.coordinator).await
        }
        Command::Agent {
            server_addr,
            hostname,
            max_runners,
            template_path,
            runners_path,
            ssh_key,
            ip_notify_addr,
        } => {
            let agent = &mut config.agent;
            if let Some(addr) = server_addr {
                agent.server_addr = addr;
            }
            if hostname.is_some() {
                agent.hostname = hostname;
            }
            if let Some(n) = max_runners {
                agent.max_runners = n;
            }
            if let Some(path) = template_path {
                agent.template_path = path;
            }
            if let Some(path) = runners_path {
                agent.runners_path = path;
            }
            if ssh_key.is_some() {
                agent.ssh_key_path = ssh_key;
            }
            if let Some(addr) = ip_notify_addr {
                agent.ip_notify_addr = addr;
            }
            agent_mode::run_agent(config.agent).await
        }
        Command::Vm {
            runners_path,
            action,
        } => {
            if let Some(path) = runners_path {
                config.agent.runners_path = path;
            }
            let agent = &config.agent;
            match action {
                VmAction::List => vm_cmd::list(&agent.runners_path),
                VmAction::Stop { runner_id } => vm_cmd::stop(agent, &runner_id).await,
                VmAction::Delete { runner_id } => vm_cmd::delete(agent, &runner_id).await,
                VmAction::Exec {
                    runner_id,
                    command,
                    args,
                } => {
                    let code = vm_cmd::exec(agent, &runner_id, &command, &args).await?;
                    std::process::exit(code);
                }
            }
        }
    }
}
