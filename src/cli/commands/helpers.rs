//! Shared helper functions for CLI commands.

use std::time::Duration;

use anyhow::Context;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;

use crate::browser::ChromiumDriver;
use crate::config::{Config, Settings};
use crate::orchestrator::{RunSummary, WorkOutcome};
use crate::repository::DbContext;
use crate::session::{SessionManager, SessionStore};

pub fn spinner(message: impl Into<String>) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message.into());
    Ok(pb)
}

/// Open the database, creating tables on first use.
pub async fn open_db(settings: &Settings) -> anyhow::Result<DbContext> {
    settings
        .ensure_directories()
        .with_context(|| format!("Failed to create {}", settings.data_dir.display()))?;
    let db = settings.create_db_context();
    db.init_schema()
        .await
        .with_context(|| format!("Failed to open database {}", settings.database_url()))?;
    Ok(db)
}

/// Launch the browser, retrying transient startup failures.
pub async fn launch_browser(config: &Config) -> anyhow::Result<ChromiumDriver> {
    let pb = spinner("Starting browser...")?;
    let driver = config
        .rate_limit
        .retry
        .run("launch browser", |_| ChromiumDriver::launch(config.browser.clone()))
        .await;
    pb.finish_and_clear();
    driver.context("Failed to start the browser")
}

pub fn session_manager(settings: &Settings, config: &Config) -> SessionManager {
    SessionManager::new(SessionStore::new(settings.session_path()), config.session.clone())
}

/// Watch channel flipped to true on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{} Stopping after the current step (Ctrl-C again to abort)",
                style("!").yellow()
            );
            let _ = tx.send(true);
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });
    rx
}

pub fn print_summary(summary: &RunSummary) {
    println!();
    let counts = summary.by_outcome();
    for outcome in [
        WorkOutcome::Succeeded,
        WorkOutcome::SucceededPartial,
        WorkOutcome::NoData,
        WorkOutcome::Failed,
    ] {
        let count = counts.get(&outcome).copied().unwrap_or(0);
        if count == 0 {
            continue;
        }
        let marker = match outcome {
            WorkOutcome::Succeeded => style("✓").green(),
            WorkOutcome::SucceededPartial => style("~").yellow(),
            WorkOutcome::NoData => style("○").dim(),
            WorkOutcome::Failed => style("✗").red(),
        };
        println!("  {} {:<10} {}", marker, outcome.to_string(), count);
    }
    println!(
        "{:<20} {} created, {} updated",
        "Records:", summary.records_created, summary.records_updated
    );
    if summary.pages > 0 {
        match summary.stop_reason {
            Some(reason) => println!("{:<20} {} ({})", "Pages:", summary.pages, reason),
            None => println!("{:<20} {}", "Pages:", summary.pages),
        }
    }
    if summary.failed_batches > 0 {
        println!(
            "{} {} batches could not be written",
            style("!").yellow(),
            summary.failed_batches
        );
    }
    if summary.reauthentications > 0 {
        println!("{:<20} {}", "Re-logins:", summary.reauthentications);
    }
    println!(
        "{:<20} {:.1}s (rate limit {:.1}s)",
        "Elapsed:",
        summary.elapsed.as_secs_f64(),
        summary.rate_limit_wait.as_secs_f64()
    );
    if summary.cancelled {
        println!("{} Run was cancelled; unfinished items stay queued", style("!").yellow());
    }
}
