use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use buildwatch::{load_config, Config, MergeOpts};

#[derive(Parser)]
#[command(
    name = "buildwatch",
    about = "Watches repositories for new commits and reports them to the build dashboard"
)]
struct Opts {
    /// Path to a TOML config file (optional)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repository URL of the main repository
    #[arg(long)]
    repo_url: Option<String>,

    /// Dashboard URL (must end in /)
    #[arg(long)]
    dash_url: Option<String>,

    /// Build dashboard key file
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Remote repo poll interval in seconds
    #[arg(long)]
    poll_interval_seconds: Option<u64>,

    /// Enable network calls (disable for testing)
    #[arg(long)]
    network: Option<bool>,

    /// Whether to mirror to the destination host
    #[arg(long)]
    mirror: Option<bool>,

    /// Comma-separated list of directories or files to watch for new
    /// commits (only works on the main repo); empty watches everything
    #[arg(long)]
    filter: Option<String>,

    /// Comma-separated list of branches to watch; empty watches changes
    /// on every branch
    #[arg(long)]
    branches: Option<String>,

    /// If non-empty, the listen address to run an HTTP server on
    #[arg(long)]
    http_addr: Option<String>,

    /// Report updates to the build dashboard (false for development
    /// dry-run mode)
    #[arg(long)]
    report: Option<bool>,

    /// Clone cache directory, reused across restarts when present
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let opts = Opts::parse();
    let merge = MergeOpts {
        config_path: opts.config,
        cli_repo_url: opts.repo_url,
        cli_dash_url: opts.dash_url,
        cli_key_file: opts.key_file,
        cli_poll_interval_seconds: opts.poll_interval_seconds,
        cli_network: opts.network,
        cli_mirror: opts.mirror,
        cli_filter: opts.filter,
        cli_branches: opts.branches,
        cli_http_addr: opts.http_addr,
        cli_report: opts.report,
        cli_cache_dir: opts.cache_dir,
    };
    let cfg = match load_config(Config::default(), merge) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "invalid configuration");
            std::process::exit(1);
        }
    };

    tracing::info!("running watcher role");
    match buildwatch::supervisor::run(cfg).await {
        Ok(()) => tracing::info!("watcher exiting"),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "watcher exiting after failure");
            std::process::exit(1);
        }
    }
}
