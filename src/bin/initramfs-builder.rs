//! initramfs-builder - deterministic, cached initramfs assembly.
//!
//! CLI entry point that dispatches to subcommands.

mod commands;

use clap::{ArgAction, Args, Parser, Subcommand};
use initramfs_builder::artifact::initramfs::DEFAULT_MODULE_DIR;
use initramfs_builder::artifact::Compression;
use initramfs_builder::artifact_store::default_cache_dir;
use initramfs_builder::build::context::default_jobs;
use initramfs_builder::build::request::parse_extra;
use initramfs_builder::{BuildError, BuildSettings};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit code for failures that carry no error class.
const EXIT_UNCLASSIFIED: u8 = 1;

/// Build initramfs archives from an init binary and kernel modules.
///
/// Modules are ordered by their declared dependencies and archives are
/// cached by a fingerprint of every input.
#[derive(Parser, Debug)]
#[command(name = "initramfs-builder")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Cache directory
    #[arg(long, global = true, env = "INITRAMFS_BUILDER_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Seconds before an external tool is killed
    #[arg(long, global = true, value_name = "SECS", default_value_t = 60, env = "INITRAMFS_BUILDER_TOOL_TIMEOUT")]
    tool_timeout: u64,

    /// Seconds to wait for another build of the same archive
    #[arg(long, global = true, value_name = "SECS", default_value_t = 600, env = "INITRAMFS_BUILDER_LOCK_TIMEOUT")]
    lock_timeout: u64,

    /// Module inspection workers [default: available CPUs]
    #[arg(short, long, global = true, env = "INITRAMFS_BUILDER_JOBS")]
    jobs: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an artifact
    Build(BuildArgs),

    /// Inspect and maintain the archive cache
    Cache(CacheArgs),
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[command(subcommand)]
    target: BuildTarget,
}

#[derive(Subcommand, Debug)]
enum BuildTarget {
    /// Build an initramfs archive
    Initramfs(InitramfsArgs),
}

#[derive(Args, Debug)]
pub(crate) struct InitramfsArgs {
    /// The binary to place at /init
    pub init: PathBuf,

    /// Kernel module to include (repeatable; .ko, .ko.gz, .ko.xz, .ko.zst)
    #[arg(short = 'm', long = "module", value_name = "PATH")]
    pub modules: Vec<PathBuf>,

    /// Extra binary to place at /bin/NAME (repeatable)
    #[arg(long = "extra", value_name = "NAME=PATH", value_parser = parse_extra)]
    pub extras: Vec<(String, PathBuf)>,

    /// Output archive path [default: initramfs.cpio plus the compression suffix]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Whole-archive compression: none, gzip, xz or zstd
    #[arg(long, default_value = "none")]
    pub compress: Compression,

    /// Directory for modules inside the image
    #[arg(long, default_value = DEFAULT_MODULE_DIR)]
    pub moddir: String,

    /// Do not prefix module files with their load position
    #[arg(long)]
    pub no_order_prefix: bool,

    /// Build straight to the output without reading or writing the cache
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Args, Debug)]
pub(crate) struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CacheAction {
    /// Print the cache directory
    Path,

    /// List cached archives, newest first
    List {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show entry and size totals
    Status,

    /// Show one entry and the inputs it was built from
    Show {
        /// Fingerprint or unique prefix (at least 4 hex digits)
        fingerprint: String,
    },

    /// Remove all but the newest entries
    Prune {
        /// Number of entries to keep
        #[arg(long, value_name = "N")]
        keep_last: usize,
    },

    /// Remove orphaned archives and abandoned temp files
    Gc,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

/// 0 = warn, 1 = info, 2+ = debug. `RUST_LOG` wins when set.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "initramfs_builder=warn",
        1 => "initramfs_builder=info",
        _ => "initramfs_builder=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = BuildSettings {
        cache_dir: cli.cache_dir.unwrap_or_else(default_cache_dir),
        tool_timeout: Duration::from_secs(cli.tool_timeout),
        lock_timeout: Duration::from_secs(cli.lock_timeout),
        jobs: cli.jobs.unwrap_or_else(default_jobs),
    };

    match cli.command {
        Commands::Build(BuildArgs {
            target: BuildTarget::Initramfs(args),
        }) => commands::build::execute(args, &settings).map_err(Into::into),
        Commands::Cache(args) => commands::cache::execute(args, &settings),
    }
}

/// Print `error[<kind>]: <message>` and pick the exit code.
fn report(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<BuildError>() {
        Some(build) => {
            eprintln!("error[{}]: {}", build.kind(), err);
            if let Some(hint) = build.hint() {
                eprintln!("hint: {hint}");
            }
            ExitCode::from(build.class().exit_code())
        }
        None => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_UNCLASSIFIED)
        }
    }
}
