//! Scrape and listing commands.

use anyhow::bail;
use console::style;

use crate::browser::PageDriver;
use crate::config::{Config, Settings};
use crate::orchestrator::{DbWorkSource, JobKind, Orchestrator, RunSummary};

use super::helpers::{cancel_on_ctrl_c, launch_browser, open_db, print_summary, session_manager};

/// Work through the pending queue of a detail job.
pub async fn cmd_scrape(
    settings: &Settings,
    config: &Config,
    job_name: &str,
    limit: Option<usize>,
    retry_failed: bool,
) -> anyhow::Result<()> {
    let job = config.job(job_name)?;
    if job.config.kind != JobKind::Detail {
        bail!(
            "{} is a listing job; run `kolharvest listing {}` instead",
            job_name,
            job_name
        );
    }

    let db = open_db(settings).await?;
    let queue = db.work_items();
    let stale = queue.reset_stale(job_name).await?;
    if stale > 0 {
        println!(
            "{} Requeued {} items left in progress by an earlier run",
            style("↻").cyan(),
            stale
        );
    }
    if retry_failed {
        let requeued = queue.requeue_failed(job_name).await?;
        println!("{} Requeued {} failed items", style("↻").cyan(), requeued);
    }

    let pending: i64 = queue
        .counts(Some(job_name))
        .await?
        .iter()
        .filter(|c| c.status == "pending")
        .map(|c| c.count)
        .sum();
    if pending == 0 {
        println!("{} No pending items for {}", style("!").yellow(), job_name);
        println!(
            "  {} Queue some with `kolharvest enqueue {} <file>`",
            style("→").dim(),
            job_name
        );
        return Ok(());
    }
    println!(
        "{} Scraping {} ({} pending{})",
        style("→").cyan(),
        job_name,
        pending,
        limit.map(|l| format!(", limit {}", l)).unwrap_or_default()
    );

    let mut source = DbWorkSource::new(queue, job_name)
        .with_limit(limit)
        .no_data_is_failure(job.config.no_data_is_failure);
    let session = session_manager(settings, config);
    let cancel = cancel_on_ctrl_c();
    let mut driver = launch_browser(config).await?;

    let result: anyhow::Result<RunSummary> = async {
        let mut orchestrator = Orchestrator::new(&mut driver, &session, db.records(), cancel)
            .with_rate_limit(&config.rate_limit)
            .with_collect(config.collect.clone())
            .with_pagination(config.pagination.clone());
        orchestrator.ensure_session().await?;
        Ok(orchestrator.run_detail(&job, &mut source).await?)
    }
    .await;

    if let Err(e) = driver.close().await {
        tracing::warn!("Failed to close browser: {}", e);
    }
    print_summary(&result?);
    Ok(())
}

/// Page through a listing job.
pub async fn cmd_listing(settings: &Settings, config: &Config, job_name: &str) -> anyhow::Result<()> {
    let job = config.job(job_name)?;
    if job.config.kind != JobKind::Listing {
        bail!(
            "{} is a detail job; queue keys and run `kolharvest scrape {}` instead",
            job_name,
            job_name
        );
    }

    let db = open_db(settings).await?;
    let session = session_manager(settings, config);
    let cancel = cancel_on_ctrl_c();
    let mut driver = launch_browser(config).await?;
    println!(
        "{} Paging {} (at most {} pages)",
        style("→").cyan(),
        job_name,
        config.pagination.max_pages
    );

    let result: anyhow::Result<RunSummary> = async {
        let mut orchestrator = Orchestrator::new(&mut driver, &session, db.records(), cancel)
            .with_rate_limit(&config.rate_limit)
            .with_collect(config.collect.clone())
            .with_pagination(config.pagination.clone());
        orchestrator.ensure_session().await?;
        Ok(orchestrator.run_listing(&job).await?)
    }
    .await;

    if let Err(e) = driver.close().await {
        tracing::warn!("Failed to close browser: {}", e);
    }
    print_summary(&result?);
    Ok(())
}
