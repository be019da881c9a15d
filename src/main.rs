// lv-catalog: keeps a media catalog in sync with a directory tree.
// Usage: lv-catalog [--config FILE] <scan|watch|list|status|tag|bookmark|unbookmark> ROOT ...

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")");

mod cli;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lv_catalog::Config;

#[derive(Parser, Debug)]
#[command(name = "lv-catalog", version = VERSION, about = "Media catalog kept in sync with a directory tree")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Parallel metadata extractions per pass
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Watcher debounce window in milliseconds
    #[arg(long, global = true)]
    debounce_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass and print what changed
    Scan { root: PathBuf },
    /// Reconcile, then keep watching (stdin: r = refresh, s = status, q = quit)
    Watch { root: PathBuf },
    /// Print the catalog
    List { root: PathBuf },
    /// Show catalog statistics
    Status { root: PathBuf },
    /// Replace the tags of a file
    Tag {
        root: PathBuf,
        file: PathBuf,
        tags: Vec<String>,
    },
    /// Add a bookmark to a video
    Bookmark {
        root: PathBuf,
        file: PathBuf,
        /// Position in seconds
        #[arg(long)]
        at: f64,
        #[arg(long, default_value = "")]
        desc: String,
    },
    /// Remove the bookmarks at a position
    Unbookmark {
        root: PathBuf,
        file: PathBuf,
        #[arg(long)]
        at: f64,
    },
}

fn load_config(args: &Cli) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).context("loading config")?,
        None => Config::default(),
    };
    if let Some(w) = args.workers {
        config.extract_workers = w.max(1);
    }
    if let Some(ms) = args.debounce_ms {
        config.debounce_ms = ms;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    tracing::debug!(?config, "config loaded");

    match args.command {
        Commands::Scan { root } => cli::scan(config, &root),
        Commands::Watch { root } => cli::watch(config, &root),
        Commands::List { root } => cli::list(&config, &root),
        Commands::Status { root } => cli::status(&config, &root),
        Commands::Tag { root, file, tags } => cli::tag(config, &root, &file, tags),
        Commands::Bookmark {
            root,
            file,
            at,
            desc,
        } => cli::bookmark(config, &root, &file, at, &desc),
        Commands::Unbookmark { root, file, at } => cli::unbookmark(config, &root, &file, at),
    }
}
