use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{ErrorKind, PipelineError};

#[derive(Debug, Default, Serialize)]
pub struct ErrorTally {
    pub count: usize,
    /// First N messages only.
    pub samples: Vec<String>,
}

/// What a run did, for the operator.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub pages: usize,
    pub fetched: usize,
    pub cleaned: usize,
    pub duplicates: usize,
    pub stored: usize,
    pub rejected: usize,
    pub failed: usize,
    pub errors: BTreeMap<ErrorKind, ErrorTally>,
    #[serde(skip)]
    max_samples: usize,
}

impl RunSummary {
    pub fn new(max_samples: usize) -> Self {
        Self {
            pages: 0,
            fetched: 0,
            cleaned: 0,
            duplicates: 0,
            stored: 0,
            rejected: 0,
            failed: 0,
            errors: BTreeMap::new(),
            max_samples,
        }
    }

    pub fn record_error(&mut self, err: &PipelineError) {
        let tally = self.errors.entry(err.kind()).or_default();
        tally.count += 1;
        if tally.samples.len() < self.max_samples {
            tally.samples.push(err.to_string());
        }
    }

    pub fn error_count(&self, kind: ErrorKind) -> usize {
        self.errors.get(&kind).map_or(0, |t| t.count)
    }

    pub fn print(&self) {
        println!(
            "Pages: {} | fetched {} | cleaned {} | duplicates {} | stored {} | rejected {} | failed {}",
            self.pages,
            self.fetched,
            self.cleaned,
            self.duplicates,
            self.stored,
            self.rejected,
            self.failed,
        );
        for (kind, tally) in &self.errors {
            println!("\n{} ({}):", kind, tally.count);
            for msg in &tally.samples {
                println!("  - {}", msg);
            }
            if tally.count > tally.samples.len() {
                println!("  ... {} more", tally.count - tally.samples.len());
            }
        }
    }
}
