//! `gitfs` command line interface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gitfs_git::GitObjectStore;
use gitfs_vfs::{build_union, serve, GitFs, MountOptions, Strategy, UnionFs};

#[derive(Parser)]
#[command(name = "gitfs", version, about = "Mount a git revision as a writable filesystem")]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a revision; blocks until unmounted or interrupted.
    Mount(MountArgs),
}

#[derive(Args)]
struct MountArgs {
    /// Directory to mount at.
    mountpoint: PathBuf,

    /// Revision to mount (anything rev-parse accepts).
    #[arg(default_value = "HEAD")]
    revision: String,

    /// Path of the git repository.
    #[arg(long, default_value = ".")]
    git_dir: PathBuf,

    /// Directory for the writable layer. Defaults to `upper` inside the
    /// repository path.
    #[arg(long)]
    upper_dir: Option<PathBuf>,

    /// Stream every read from the object database (the default).
    #[arg(long, conflicts_with = "disk")]
    lazy: bool,

    /// Extract file content to local disk on first open instead of
    /// streaming every read from the object database.
    #[arg(long)]
    disk: bool,

    /// Scratch directory root for --disk extraction.
    #[arg(long)]
    tempdir: Option<PathBuf>,

    /// Seconds the kernel may cache entries and attributes.
    #[arg(long, default_value_t = 1.0)]
    entry_ttl: f64,

    /// Seconds a lookup miss is cached.
    #[arg(long, default_value_t = 1.0)]
    negative_ttl: f64,

    /// Seconds resolved paths and directory listings are cached.
    #[arg(long = "branchcache-ttl", default_value_t = 5.0)]
    branch_cache_ttl: f64,

    /// Seconds the deletion record snapshot is cached.
    #[arg(long = "delcache-ttl", default_value_t = 5.0)]
    delete_cache_ttl: f64,

    /// Name of the deletion record directory inside the upper layer.
    #[arg(long, default_value = ".gitfs-deleted")]
    deletion_dirname: String,

    /// Seconds to wait for unmount before terminating the process.
    #[arg(long, default_value_t = 3.0)]
    unmount_grace: f64,

    /// Filesystem name reported to the kernel.
    #[arg(long, default_value = "gitfs")]
    fsname: String,
}

#[derive(Args)]
struct LogArgs {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug.
    #[arg(long, global = true)]
    debug: bool,
}

fn main() {
    let cli: Cli = Cli::parse();

    let level: &str = if cli.log.debug {
        "debug"
    } else {
        &cli.log.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Command::Mount(args) => run_mount(args),
    };
    if let Err(e) = result {
        eprintln!("gitfs: {}", e);
        std::process::exit(1);
    }
}

fn run_mount(args: MountArgs) -> Result<(), Box<dyn std::error::Error>> {
    // --lazy and --disk are mutually exclusive; lazy is the default.
    let strategy: Strategy = match (args.lazy, args.disk) {
        (_, true) => Strategy::Disk,
        _ => Strategy::Lazy,
    };
    let options: MountOptions = MountOptions {
        fsname: args.fsname.clone(),
        entry_ttl: Duration::from_secs_f64(args.entry_ttl),
        negative_ttl: Duration::from_secs_f64(args.negative_ttl),
        branch_ttl: Duration::from_secs_f64(args.branch_cache_ttl),
        delete_ttl: Duration::from_secs_f64(args.delete_cache_ttl),
        strategy,
        scratch_dir: args.tempdir.clone(),
        deletion_dirname: args.deletion_dirname.clone(),
        unmount_grace: Duration::from_secs_f64(args.unmount_grace),
    };
    let upper_dir: PathBuf = args
        .upper_dir
        .clone()
        .unwrap_or_else(|| args.git_dir.join("upper"));

    let store: Arc<GitObjectStore> = Arc::new(GitObjectStore::open(&args.git_dir)?);

    let runtime: tokio::runtime::Runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let union: Arc<UnionFs> = runtime.block_on(build_union(
        store,
        &args.revision,
        &upper_dir,
        &options,
    ))?;
    info!(
        revision = %args.revision,
        upper = %upper_dir.display(),
        lazy = !args.disk,
        "revision resolved"
    );

    let fs: GitFs = {
        let _guard = runtime.enter();
        GitFs::new(union, &options)?
    };

    let shutdown: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let handler_flag: Arc<AtomicBool> = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })?;

    serve(fs, &args.mountpoint, &options, shutdown)?;
    Ok(())
}
