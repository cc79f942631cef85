use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tiny_docker::commands::{self, RunOptions};
use tiny_docker::config::{Config, DEFAULT_CONFIG_FILE};
use tiny_docker::{daemon, init};

#[derive(Parser)]
#[command(name = "tiny-docker")]
#[command(about = "A minimal container engine")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Overrides the state root from the configuration
    #[arg(long, global = true)]
    volume: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Daemon {
        /// Serve in this process instead of detaching
        #[arg(long)]
        foreground: bool,
    },
    /// Run a command in a new container
    Run {
        /// Attach a terminal
        #[arg(short = 'i', long = "it")]
        interactive: bool,
        /// Run in the background
        #[arg(short, long)]
        detach: bool,
        /// Memory limit, e.g. 100m
        #[arg(short, long)]
        memory: Option<String>,
        /// CPU limit in cores, e.g. 0.5
        #[arg(short, long)]
        cpu: Option<String>,
        /// Environment variable KEY=VALUE
        #[arg(short, long = "env")]
        env: Vec<String>,
        /// Network to connect to
        #[arg(long)]
        network: Option<String>,
        /// Image archive
        image: PathBuf,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Container init phase, run inside the new namespaces
    #[command(hide = true)]
    Init {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// List containers
    Ps {
        /// Include exited containers
        #[arg(short, long)]
        all: bool,
    },
    /// Stop containers
    Stop {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Print the output of a detached container
    Logs { id: String },
    /// Pack a container's filesystem into an archive
    Commit { id: String, dst: PathBuf },
    /// Run a command in a running container
    Exec {
        /// Keep stdin attached
        #[arg(short, long)]
        interactive: bool,
        id: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Manage networks
    #[command(subcommand)]
    Network(NetworkCommands),
}

#[derive(Subcommand)]
enum NetworkCommands {
    Create { name: String },
    Rm { name: String },
    Inspect { name: String },
    Ls,
    /// Connect a running container to a network
    Connect { name: String, id: String },
}

fn init_tracing(filter: EnvFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Global flags a re-executed daemon needs to see the same state.
fn forwarded_args(cli: &Cli) -> Vec<String> {
    let mut args = vec![
        "--config".to_string(),
        cli.config.to_string_lossy().into_owned(),
    ];
    if let Some(volume) = &cli.volume {
        args.push("--volume".to_string());
        args.push(volume.to_string_lossy().into_owned());
    }
    args
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Runs inside the container, whose output belongs to the user command.
    if let Commands::Init { command } = &cli.command {
        init_tracing(EnvFilter::new("error"));
        init::run_init(command).context("container init failed")?;
        return Ok(());
    }
    init_tracing(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tiny_docker=info")),
    );

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?
        .with_root(cli.volume.clone());

    let code = match &cli.command {
        Commands::Daemon { foreground: true } => {
            daemon::serve_foreground(config).context("daemon failed")?;
            0
        }
        Commands::Daemon { foreground: false } => {
            let pid = daemon::spawn_detached(&config, &forwarded_args(&cli))
                .context("failed to start daemon")?;
            println!("daemon started with pid {pid}");
            0
        }
        Commands::Run {
            interactive,
            detach,
            memory,
            cpu,
            env,
            network,
            image,
            command,
        } => {
            let options = RunOptions {
                image: image.clone(),
                command: command.clone(),
                interactive: *interactive,
                detach: *detach,
                memory: memory.clone(),
                cpu: cpu.clone(),
                env: env.clone(),
                network: network.clone(),
            };
            commands::run(&config, &options).context("run failed")?
        }
        Commands::Init { .. } => unreachable!("init is handled before loading the config"),
        Commands::Ps { all } => {
            print!("{}", commands::ps(&config, *all)?);
            0
        }
        Commands::Stop { ids } => {
            commands::stop(&config, ids)?;
            0
        }
        Commands::Logs { id } => {
            print!("{}", commands::logs(&config, id)?);
            0
        }
        Commands::Commit { id, dst } => {
            let dst = commands::commit(&config, id, dst)?;
            println!("{}", dst.display());
            0
        }
        Commands::Exec {
            interactive,
            id,
            command,
        } => commands::exec(&config, id, command, *interactive).context("exec failed")?,
        Commands::Network(network) => {
            let client = commands::daemon_client(&config);
            match network {
                NetworkCommands::Create { name } => print_json(&client.network_create(name)?)?,
                NetworkCommands::Rm { name } => print_json(&client.network_rm(name)?)?,
                NetworkCommands::Inspect { name } => print_json(&client.network_inspect(name)?)?,
                NetworkCommands::Ls => print!("{}", commands::format_networks(&client.network_list()?)),
                NetworkCommands::Connect { name, id } => {
                    let container = commands::find_container(&config, id)?;
                    print_json(&client.network_connect(name, &container.id, container.pid)?)?
                }
            }
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
