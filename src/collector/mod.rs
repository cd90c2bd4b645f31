pub mod extract;
pub mod fetch;
pub mod rules;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::PipelineError;
use rules::RuleBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    User,
    Post,
    Comment,
    Hashtag,
    Follow,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::User => "user",
            RecordKind::Post => "post",
            RecordKind::Comment => "comment",
            RecordKind::Hashtag => "hashtag",
            RecordKind::Follow => "follow",
        };
        f.write_str(name)
    }
}

/// A record straight off the page: field name → extracted text, nothing
/// validated yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawRecord {
    pub kind: RecordKind,
    pub source: String,
    pub fields: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new(kind: RecordKind, source: &str) -> Self {
        Self {
            kind,
            source: source.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn with(mut self, field: &str, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }
}

/// A fetched page waiting to be parsed.
#[derive(Debug, Clone)]
pub struct Page {
    pub target: String,
    pub url: String,
    pub rules: String,
    pub html: String,
}

/// Lazily turn pages into raw records. A page is parsed only when the
/// iterator reaches it; a page that fails to parse yields a single error.
pub fn records<'a>(
    pages: &'a [Page],
    rulebook: &'a RuleBook,
) -> impl Iterator<Item = Result<RawRecord, PipelineError>> + 'a {
    pages.iter().flat_map(move |page| {
        let parsed = match rulebook.get(&page.rules) {
            Some(rules) => extract::extract_page(page, rules),
            None => Err(PipelineError::Parse {
                url: page.url.clone(),
                reason: format!("unknown rule set {:?}", page.rules),
            }),
        };
        match parsed {
            Ok(records) => records.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        }
    })
}
