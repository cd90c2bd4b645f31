use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::Page;
use crate::error::PipelineError;
use crate::settings::{Settings, Target};

/// Fetch results, in target order.
pub struct FetchOutcome {
    pub pages: Vec<Page>,
    pub errors: Vec<PipelineError>,
}

pub fn build_client(settings: &Settings) -> Result<Client> {
    let client = Client::builder()
        .timeout(Duration::from_secs(settings.fetch_timeout_secs))
        .user_agent(settings.user_agent.as_str())
        .build()?;
    Ok(client)
}

/// Fetch all targets concurrently (bounded by `settings.concurrency`).
///
/// A failing target becomes a `FetchError` in the outcome; it never stops
/// the others. No retries.
pub async fn fetch_pages(settings: &Settings, targets: &[Target]) -> Result<FetchOutcome> {
    let client = build_client(settings)?;
    let semaphore = Arc::new(Semaphore::new(settings.concurrency));
    let total = targets.len();

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    // Workers send (index, result); the loop below collects them.
    let (tx, mut rx) =
        tokio::sync::mpsc::channel::<(usize, Result<Page, PipelineError>)>(settings.concurrency * 2);

    for (idx, target) in targets.iter().cloned().enumerate() {
        let client = client.clone();
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            let result = fetch_one(&client, &target).await;
            if let Err(e) = &result {
                warn!("Fetch failed for {}: {}", target.name, e);
            }
            let _ = tx.send((idx, result)).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let mut slots: Vec<Option<Result<Page, PipelineError>>> = (0..total).map(|_| None).collect();
    while let Some((idx, result)) = rx.recv().await {
        slots[idx] = Some(result);
        pb.inc(1);
    }
    pb.finish_and_clear();

    let mut pages = Vec::new();
    let mut errors = Vec::new();
    for (slot, target) in slots.into_iter().zip(targets) {
        match slot {
            Some(Ok(page)) => pages.push(page),
            Some(Err(e)) => errors.push(e),
            None => errors.push(PipelineError::Fetch {
                url: target.url.clone(),
                reason: "fetch task did not complete".into(),
            }),
        }
    }

    info!(
        "Fetched {} pages ({} ok, {} errors)",
        total,
        pages.len(),
        errors.len()
    );
    Ok(FetchOutcome { pages, errors })
}

async fn fetch_one(client: &Client, target: &Target) -> Result<Page, PipelineError> {
    let fetch_error = |reason: String| PipelineError::Fetch {
        url: target.url.clone(),
        reason,
    };

    let start = Instant::now();
    let response = client
        .get(&target.url)
        .send()
        .await
        .map_err(|e| fetch_error(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(fetch_error(format!("HTTP {}", status)));
    }

    let html = response
        .text()
        .await
        .map_err(|e| fetch_error(e.to_string()))?;
    info!(
        "Fetched {} ({} bytes in {}ms)",
        target.url,
        html.len(),
        start.elapsed().as_millis()
    );

    Ok(Page {
        target: target.name.clone(),
        url: target.url.clone(),
        rules: target.rules.clone(),
        html,
    })
}
