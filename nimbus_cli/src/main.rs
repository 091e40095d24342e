use crate::init_config::CmdConfig;
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::InfoLevel;
use directories::ProjectDirs;
use std::path::PathBuf;

mod cmd;
mod config;
mod helpers;
mod init_config;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// config file to use instead of the per-user default
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modify the nimbus config
    Config {
        #[command(subcommand)]
        cmd: CmdConfig,
    },
    /// Manage principals of the pool
    Principal {
        #[command(subcommand)]
        cmd: PrincipalCmd,
    },
    /// List a folder
    Ls {
        /// Folder path below your root; defaults to the root itself
        path: Option<String>,
    },
    /// Create a folder
    Mkdir {
        path: String,
        /// Create missing parent folders as well
        #[arg(short, long)]
        parents: bool,
    },
    /// Copy a local file into the pool, adding a new snapshot if it exists
    Put { local: PathBuf, path: String },
    /// Print a file to stdout
    Cat {
        path: String,
        /// Read this snapshot instead of the newest one
        #[arg(long, value_name = "ID")]
        snapshot: Option<u64>,
    },
    /// Create a symbolic link at `path` pointing to `target`
    Ln { target: String, path: String },
    /// Move or rename a file or folder
    Mv { from: String, to: String },
    /// Move a file or folder to the trash
    Rm { path: String },
    /// Inspect and manage the trash
    Trash {
        #[command(subcommand)]
        cmd: TrashCmd,
    },
    /// Snapshot history of a file
    Snapshots {
        #[command(subcommand)]
        cmd: SnapshotsCmd,
    },
    /// Share folders and files with other principals
    Share {
        #[command(subcommand)]
        cmd: ShareCmd,
    },
}

#[derive(Subcommand)]
enum PrincipalCmd {
    /// Register a principal and write its unlock secret to a key file
    Add {
        name: String,
        /// Where to write the generated secret; defaults to `<name>.secretkey`
        /// next to the config file
        #[arg(long, value_name = "FILE")]
        secret_key_file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum TrashCmd {
    /// List trashed items, most recently trashed first
    List,
    /// Put a trashed item back where it came from
    Restore {
        /// Node id as shown by `trash list`
        id: u64,
    },
    /// Permanently delete one trashed item
    Purge { id: u64 },
    /// Permanently delete everything in the trash
    Empty,
}

#[derive(Subcommand)]
enum SnapshotsCmd {
    /// List snapshots of a file, newest first
    List { path: String },
    /// Create a snapshot continuing `base` (required once the file has history)
    Create {
        path: String,
        #[arg(long, value_name = "ID")]
        base: Option<u64>,
    },
    /// Delete a snapshot and reclaim chunks nothing else references
    Delete { path: String, id: u64 },
}

#[derive(Subcommand)]
enum ShareCmd {
    /// Give another principal access to a folder or file
    Grant {
        path: String,
        principal: String,
        #[arg(short, long, value_enum, default_value_t = ShareLevel::Read)]
        level: ShareLevel,
    },
    /// Withdraw a previous grant
    Revoke { path: String, principal: String },
    /// List what other principals shared with you
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum ShareLevel {
    Read,
    Write,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let dirs = ProjectDirs::from("", "", "nimbus")
        .context("failed to determine the config and data directories")?;

    let config_file = cli
        .config
        .unwrap_or_else(|| dirs.config_dir().join("config.toml"));

    cmd::run_command(&dirs, config_file, cli.cmd).await
}
