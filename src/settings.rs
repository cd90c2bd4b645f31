use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

const ENV_PREFIX: &str = "SOCIAL";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// How many messages of each error kind the run summary keeps.
    #[serde(default = "default_max_reported_errors")]
    pub max_reported_errors: usize,
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Rule sets keyed by page type, e.g. `profile`.
    #[serde(default)]
    pub rules: HashMap<String, PageRules>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    pub name: String,
    pub url: String,
    pub rules: String,
}

/// Selector rules for one page type. Each record kind is optional; a page
/// only yields the kinds it has rules for.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageRules {
    pub user: Option<RecordRules>,
    pub post: Option<RecordRules>,
    pub comment: Option<RecordRules>,
    pub hashtag: Option<RecordRules>,
    pub follow: Option<RecordRules>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordRules {
    pub container: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

fn default_database() -> PathBuf {
    PathBuf::from("data/social.sqlite")
}

fn default_fetch_timeout() -> u64 {
    20
}

fn default_concurrency() -> usize {
    4
}

fn default_user_agent() -> String {
    format!("social_scraper/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_reported_errors() -> usize {
    5
}

impl Settings {
    /// Load `path` (if it exists) and layer `SOCIAL_*` environment variables on top.
    pub fn load(path: &Path) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config {:?}", path))?
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        for target in &self.targets {
            if !self.rules.contains_key(&target.rules) {
                bail!(
                    "target {:?} uses unknown rule set {:?}",
                    target.name,
                    target.rules
                );
            }
        }
        Ok(())
    }
}
