use anyhow::{bail, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::collector::{self, fetch, rules, Page};
use crate::db;
use crate::normalizer::Normalizer;
use crate::report::RunSummary;
use crate::settings::{Settings, Target};

/// Fetch the configured targets (or just `only`), then clean and store
/// everything they yield.
pub async fn run(conn: &Connection, settings: &Settings, only: Option<&str>) -> Result<RunSummary> {
    let targets: Vec<Target> = settings
        .targets
        .iter()
        .filter(|t| only.map_or(true, |name| t.name == name))
        .cloned()
        .collect();
    if targets.is_empty() {
        match only {
            Some(name) => bail!("no target named {:?} in config", name),
            None => bail!("no targets configured"),
        }
    }

    // Compile before fetching so a bad selector costs no requests.
    let rulebook = rules::compile(&settings.rules)?;

    let outcome = fetch::fetch_pages(settings, &targets).await?;
    let mut summary = RunSummary::new(settings.max_reported_errors);
    for e in &outcome.errors {
        summary.record_error(e);
    }
    process_pages(conn, &rulebook, &outcome.pages, &mut summary)?;
    Ok(summary)
}

/// Run already-fetched HTML through the collector, normalizer and persister.
pub fn run_pages(conn: &Connection, settings: &Settings, pages: &[Page]) -> Result<RunSummary> {
    let rulebook = rules::compile(&settings.rules)?;
    let mut summary = RunSummary::new(settings.max_reported_errors);
    process_pages(conn, &rulebook, pages, &mut summary)?;
    Ok(summary)
}

fn process_pages(
    conn: &Connection,
    rulebook: &rules::RuleBook,
    pages: &[Page],
    summary: &mut RunSummary,
) -> Result<()> {
    summary.pages += pages.len();

    // Collect + clean the whole batch first: dedup needs to see all of it.
    let mut normalizer = Normalizer::default();
    for item in collector::records(pages, rulebook) {
        match item {
            Ok(raw) => {
                summary.fetched += 1;
                normalizer.push(&raw);
            }
            Err(e) => {
                warn!("{}", e);
                summary.record_error(&e);
            }
        }
    }
    let batch = normalizer.finish();
    summary.cleaned += batch.records.len();
    summary.duplicates += batch.duplicates;
    summary.rejected += batch.rejected.len();
    for e in &batch.rejected {
        summary.record_error(e);
    }
    info!(
        "Cleaned {} records ({} duplicates, {} rejected)",
        batch.records.len(),
        batch.duplicates,
        batch.rejected.len()
    );

    for record in &batch.records {
        match db::store(conn, record) {
            Ok(_) => summary.stored += 1,
            Err(e) => {
                warn!("Store failed: {}", e);
                summary.failed += 1;
                summary.record_error(&e);
            }
        }
    }
    info!("Stored {} of {} records", summary.stored, batch.records.len());
    Ok(())
}
