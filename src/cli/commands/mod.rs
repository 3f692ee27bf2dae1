//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod helpers;
mod init;
mod scrape;
mod state;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions};

#[derive(Parser)]
#[command(name = "kolharvest")]
#[command(about = "Authenticated browser scrape sessions with response interception")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides config file)
    #[arg(long, short = 'd', global = true, env = "KOLHARVEST_DATA_DIR")]
    data: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run the browser without a window (interactive login will not work)
    #[arg(long, global = true)]
    headless: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and database
    Init,

    /// Open the browser and log in, saving the session for later runs
    Login,

    /// Queue entity keys for a detail job, one per line (`key` or `key,label`)
    Enqueue {
        /// Job name (see `kolharvest jobs`)
        job: String,
        /// File with one key per line; `-` reads stdin
        file: PathBuf,
    },

    /// Work through the pending queue of a detail job
    Scrape {
        /// Job name
        job: String,
        /// Stop after this many items
        #[arg(short, long)]
        limit: Option<usize>,
        /// Put failed items back in the queue first
        #[arg(long)]
        retry_failed: bool,
    },

    /// Page through a listing job until it runs out of new rows
    Listing {
        /// Job name
        job: String,
        /// Override the page cap for this run
        #[arg(long)]
        max_pages: Option<usize>,
    },

    /// Show queue and record counts
    Status {
        /// Restrict to one job
        job: Option<String>,
    },

    /// List configured jobs
    Jobs,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        data: cli.data,
    };
    let (settings, mut config) = load_settings_with_options(options).await?;
    if cli.headless {
        config.browser.headless = true;
    }

    match cli.command {
        Commands::Init => init::cmd_init(&settings, &config).await,
        Commands::Login => init::cmd_login(&settings, &config).await,
        Commands::Enqueue { job, file } => state::cmd_enqueue(&settings, &config, &job, &file).await,
        Commands::Scrape {
            job,
            limit,
            retry_failed,
        } => scrape::cmd_scrape(&settings, &config, &job, limit, retry_failed).await,
        Commands::Listing { job, max_pages } => {
            if let Some(max_pages) = max_pages {
                config.pagination.max_pages = max_pages;
            }
            scrape::cmd_listing(&settings, &config, &job).await
        }
        Commands::Status { job } => state::cmd_status(&settings, job.as_deref()).await,
        Commands::Jobs => state::cmd_jobs(&config),
    }
}
