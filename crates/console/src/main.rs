//! ForensicVM console - Main Entry Point
//!
//! Attaches to the VM of a forensic case on a ForensicVM server and drives it
//! through conversion, start/stop, evidence collection and deletion.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forensicvm_console::commands::{
    artifact, config, iso, memory, network, plugin, snapshot, ssh, vm, watch, CaseArgs, Context,
};
use forensicvm_console::config::ConsoleConfig;
use forensicvm_console::output::{self, print_error};

/// ForensicVM console - forensic image to VM, from the examiner's workstation
#[derive(Parser)]
#[command(name = "forensicvm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "FORENSICVM_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    case: CaseArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the server once and show the VM phase and available actions
    Status,

    /// Print the VM id derived from the case
    Id,

    /// Print the server's web console URLs
    Urls,

    /// Run the reconciliation loop and accept commands on stdin
    Watch,

    #[command(flatten)]
    Lifecycle(vm::LifecycleCommands),

    /// Manage snapshots
    #[command(subcommand)]
    Snapshot(snapshot::SnapshotCommands),

    /// Show or change the VM memory size
    #[command(subcommand)]
    Memory(memory::MemoryCommands),

    /// Control network traffic capture
    #[command(subcommand)]
    Tap(network::TapCommands),

    /// Manage ISO images and the CD-ROM drive
    #[command(subcommand)]
    Iso(iso::IsoCommands),

    /// List and run server plugins
    #[command(subcommand)]
    Plugin(plugin::PluginCommands),

    /// Download an artifact produced by the VM
    Download(artifact::DownloadArgs),

    /// SSH key management
    #[command(subcommand)]
    Ssh(ssh::SshCommands),

    /// Show or edit the configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(forensicvm_common::default_config_path);
    let config = ConsoleConfig::load(&config_path)?;

    let ctx = Context {
        config,
        config_path,
        format: cli.format,
        case_args: cli.case,
    };

    match cli.command {
        Commands::Status => vm::status(&ctx).await,
        Commands::Id => vm::id(&ctx),
        Commands::Urls => vm::urls(&ctx),
        Commands::Watch => watch::execute(&ctx).await,
        Commands::Lifecycle(cmd) => vm::execute(cmd, &ctx).await,
        Commands::Snapshot(cmd) => snapshot::execute(cmd, &ctx).await,
        Commands::Memory(cmd) => memory::execute(cmd, &ctx).await,
        Commands::Tap(cmd) => network::execute(cmd, &ctx).await,
        Commands::Iso(cmd) => iso::execute(cmd, &ctx).await,
        Commands::Plugin(cmd) => plugin::execute(cmd, &ctx).await,
        Commands::Download(args) => artifact::execute(args, &ctx).await,
        Commands::Ssh(cmd) => ssh::execute(cmd, &ctx).await,
        Commands::Config(cmd) => config::execute(cmd, &ctx).await,
    }
}
