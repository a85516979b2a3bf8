//! CLI argument definitions using clap derive

use clap::{ArgAction, ArgGroup, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Stowage - content-addressed bundle unpack cache
///
/// Resolves OCI images and `.tar.gz` archives into immutable, digest-keyed
/// directory trees and reclaims superseded generations.
#[derive(Parser, Debug)]
#[command(name = "stowage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STOWAGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cache root (overrides cache.root)
    #[arg(long, global = true)]
    pub cache_root: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Unpack a bundle into the cache
    Unpack(UnpackArgs),

    /// Remove every generation of a bundle except one
    Gc(GcArgs),

    /// Remove a bundle and all of its generations
    Cleanup(CleanupArgs),

    /// List cached bundles or the generations of one bundle
    List(ListArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the unpack command
#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("declared").required(true).args(["file", "name"])))]
pub struct UnpackArgs {
    /// Bundle declaration file (TOML)
    #[arg(short, long, conflicts_with_all = ["image", "tgz"])]
    pub file: Option<PathBuf>,

    /// Bundle name
    #[arg(short, long, requires = "location")]
    pub name: Option<String>,

    /// OCI image reference
    #[arg(long, group = "location")]
    pub image: Option<String>,

    /// URL of a .tar.gz archive
    #[arg(long, group = "location")]
    pub tgz: Option<String>,

    /// Remove superseded generations after a successful unpack
    #[arg(long)]
    pub gc: bool,

    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the gc command
#[derive(Parser, Debug)]
pub struct GcArgs {
    /// Bundle name
    pub name: String,

    /// Digest of the generation to keep (algo:hex)
    #[arg(short, long)]
    pub keep: String,
}

/// Arguments for the cleanup command
#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Bundle name
    pub name: String,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Show generations of this bundle only
    pub name: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for unpack and list
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
