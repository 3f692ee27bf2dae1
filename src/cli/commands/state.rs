//! Queue management and status commands.

use std::path::Path;

use anyhow::Context;
use console::style;
use tokio::io::AsyncReadExt;

use crate::config::{Config, Settings};
use crate::orchestrator::{JobKind, WorkItem};

use super::helpers::open_db;

/// Parse `key` or `key,label` lines. Blank lines and `#` comments are skipped.
fn parse_keys(contents: &str) -> Vec<(String, Option<String>)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once(',') {
            Some((key, label)) => {
                let label = label.trim();
                (
                    key.trim().to_string(),
                    (!label.is_empty()).then(|| label.to_string()),
                )
            }
            None => (line.to_string(), None),
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Queue keys from a file for a detail job.
pub async fn cmd_enqueue(
    settings: &Settings,
    config: &Config,
    job_name: &str,
    file: &Path,
) -> anyhow::Result<()> {
    let job = config.job(job_name)?;
    if job.config.kind != JobKind::Detail {
        anyhow::bail!("{} is a listing job and has no queue", job_name);
    }

    let contents = if file == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?
    };

    let items: Vec<WorkItem> = parse_keys(&contents)
        .into_iter()
        .map(|(key, label)| {
            let mut item = WorkItem::adhoc(key.clone(), job.target_url(&key));
            item.label = label;
            item
        })
        .collect();
    if items.is_empty() {
        println!("{} No keys found in {}", style("!").yellow(), file.display());
        return Ok(());
    }

    let db = open_db(settings).await?;
    let added = db.work_items().enqueue_many(job_name, &items).await?;
    println!(
        "{} Queued {} new items for {} ({} already known)",
        style("✓").green(),
        added,
        job_name,
        items.len() - added
    );
    Ok(())
}

/// Show queue counts per job and status, plus stored records per kind.
pub async fn cmd_status(settings: &Settings, job: Option<&str>) -> anyhow::Result<()> {
    if !settings.database_exists() {
        println!(
            "{} No database at {}; run `kolharvest init` first",
            style("!").yellow(),
            settings.database_path().display()
        );
        return Ok(());
    }
    let db = open_db(settings).await?;

    println!("\n{}", style("Queue").bold());
    println!("{}", "-".repeat(40));
    let counts = db.work_items().counts(job).await?;
    if counts.is_empty() {
        println!("{}", style("(empty)").dim());
    }
    for count in counts {
        let status = match count.status.as_str() {
            "succeeded" => style(count.status.clone()).green(),
            "failed" => style(count.status.clone()).red(),
            "pending" | "processing" => style(count.status.clone()).cyan(),
            _ => style(count.status.clone()).yellow(),
        };
        println!("{:<20} {:<12} {}", count.job, status, count.count);
    }

    println!("\n{}", style("Records").bold());
    println!("{}", "-".repeat(40));
    let kinds = db.records().count_by_kind().await?;
    if kinds.is_empty() {
        println!("{}", style("(none)").dim());
    }
    for (kind, count) in kinds {
        println!("{:<20} {}", kind, count);
    }
    Ok(())
}

pub fn cmd_jobs(config: &Config) -> anyhow::Result<()> {
    for (name, job) in config.all_jobs() {
        let kind = match job.kind {
            JobKind::Detail => "detail",
            JobKind::Listing => "listing",
        };
        let custom = if config.jobs.contains_key(&name) {
            style(" (config)").dim().to_string()
        } else {
            String::new()
        };
        println!("{:<20} {:<8} {}{}", style(&name).bold(), kind, job.url_template, custom);
    }
    Ok(())
}
