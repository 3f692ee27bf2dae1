//! Initialize and login commands.

use console::style;

use crate::browser::PageDriver;
use crate::config::{Config, Settings};
use crate::session::Liveness;

use super::helpers::{launch_browser, open_db, session_manager};

/// Initialize the data directory and database.
pub async fn cmd_init(settings: &Settings, config: &Config) -> anyhow::Result<()> {
    let db = open_db(settings).await?;
    let tables = db.list_tables().await?;

    println!(
        "{} Initialized kolharvest in {}",
        style("✓").green(),
        settings.data_dir.display()
    );
    println!("  {} Tables: {}", style("→").dim(), tables.join(", "));
    println!(
        "  {} Jobs: {}",
        style("→").dim(),
        config.all_jobs().keys().cloned().collect::<Vec<_>>().join(", ")
    );
    if config.source_path.is_none() {
        println!(
            "{} No kolharvest config file found; using built-in defaults",
            style("!").yellow()
        );
    }
    Ok(())
}

/// Reuse the saved session if it still works, otherwise log in interactively.
pub async fn cmd_login(settings: &Settings, config: &Config) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let session = session_manager(settings, config);
    let mut driver = launch_browser(config).await?;

    println!(
        "{} Log in in the browser window if asked (up to {}s)",
        style("→").cyan(),
        config.session.login_timeout
    );
    let result = session.ensure_session(&mut driver).await;
    if let Err(e) = driver.close().await {
        tracing::warn!("Failed to close browser: {}", e);
    }

    match result? {
        Liveness::Authenticated => println!(
            "{} Session saved to {}",
            style("✓").green(),
            settings.session_path().display()
        ),
        other => println!(
            "{} Session reused without confirmation ({:?})",
            style("!").yellow(),
            other
        ),
    }
    Ok(())
}
