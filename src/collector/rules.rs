use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use scraper::{ElementRef, Selector};

use crate::settings::{PageRules, RecordRules};

const ALL_PREFIX: &str = "all:";

/// One field extraction rule.
///
/// * `""` → text of the container itself
/// * `".caption"` → text of the first match inside the container
/// * `"img.avatar@src"` → attribute of the first match
/// * `"@data-id"` → attribute of the container itself
/// * `"all:a.tag"` → text of every match, space-joined
#[derive(Debug, Clone)]
pub struct FieldRule {
    selector: Option<Selector>,
    attr: Option<String>,
    all: bool,
}

#[derive(Debug, Clone)]
pub struct RecordRule {
    pub container: Selector,
    pub required: bool,
    pub fields: Vec<(String, FieldRule)>,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledRules {
    pub user: Option<RecordRule>,
    pub post: Option<RecordRule>,
    pub comment: Option<RecordRule>,
    pub hashtag: Option<RecordRule>,
    pub follow: Option<RecordRule>,
}

/// Compiled rule sets keyed by page type.
pub type RuleBook = HashMap<String, CompiledRules>;

pub fn compile(rules: &HashMap<String, PageRules>) -> Result<RuleBook> {
    rules
        .iter()
        .map(|(name, page)| {
            let compiled = compile_page(page).with_context(|| format!("rule set {:?}", name))?;
            Ok((name.clone(), compiled))
        })
        .collect()
}

fn compile_page(page: &PageRules) -> Result<CompiledRules> {
    let one = |rules: &Option<RecordRules>, kind: &str| -> Result<Option<RecordRule>> {
        rules
            .as_ref()
            .map(|r| RecordRule::compile(r).with_context(|| format!("{} rules", kind)))
            .transpose()
    };
    Ok(CompiledRules {
        user: one(&page.user, "user")?,
        post: one(&page.post, "post")?,
        comment: one(&page.comment, "comment")?,
        hashtag: one(&page.hashtag, "hashtag")?,
        follow: one(&page.follow, "follow")?,
    })
}

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {:?}: {:?}", css, e))
}

impl RecordRule {
    pub fn compile(rules: &RecordRules) -> Result<Self> {
        let container = parse_selector(&rules.container)?;
        let fields = rules
            .fields
            .iter()
            .map(|(name, text)| {
                let rule = FieldRule::parse(text).with_context(|| format!("field {:?}", name))?;
                Ok((name.clone(), rule))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            container,
            required: rules.required,
            fields,
        })
    }
}

impl FieldRule {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (all, text) = match text.strip_prefix(ALL_PREFIX) {
            Some(rest) => (true, rest.trim()),
            None => (false, text),
        };

        let (css, attr) = match text.rsplit_once('@') {
            Some((css, attr)) if is_attr_name(attr) => (css.trim(), Some(attr.to_string())),
            _ => (text, None),
        };

        let selector = if css.is_empty() {
            None
        } else {
            Some(parse_selector(css)?)
        };

        Ok(Self {
            selector,
            attr,
            all,
        })
    }

    /// Apply the rule inside `scope`. Empty values count as absent.
    /// `src`/`href` attributes are resolved against `base`.
    pub fn extract(&self, scope: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
        self.extract_outside(scope, base, None)
    }

    /// Like [`FieldRule::extract`], but matches at or below an element
    /// matching `nested` (a child record's container) are ignored.
    pub fn extract_outside(
        &self,
        scope: ElementRef<'_>,
        base: Option<&Url>,
        nested: Option<&Selector>,
    ) -> Option<String> {
        let own = |el: &ElementRef<'_>| nested.map_or(true, |n| !inside(*el, scope, n));
        let targets: Vec<ElementRef<'_>> = match &self.selector {
            None => vec![scope],
            Some(sel) if self.all => scope.select(sel).filter(own).collect(),
            Some(sel) => scope.select(sel).filter(own).take(1).collect(),
        };

        let values: Vec<String> = targets
            .into_iter()
            .filter_map(|el| self.value_of(el, base))
            .filter(|v| !v.is_empty())
            .collect();

        if values.is_empty() {
            None
        } else {
            Some(values.join(" "))
        }
    }

    fn value_of(&self, el: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
        match &self.attr {
            Some(attr) => {
                let raw = el.value().attr(attr)?.trim();
                if matches!(attr.as_str(), "src" | "href") {
                    Some(resolve(raw, base))
                } else {
                    Some(raw.to_string())
                }
            }
            None => Some(element_text(el)),
        }
    }
}

/// `el` or one of its ancestors below `scope` matches `container`.
fn inside(el: ElementRef<'_>, scope: ElementRef<'_>, container: &Selector) -> bool {
    container.matches(&el)
        || el
            .ancestors()
            .take_while(|n| n.id() != scope.id())
            .filter_map(ElementRef::wrap)
            .any(|a| container.matches(&a))
}

/// Visible text of an element with whitespace runs collapsed.
pub fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve(raw: &str, base: Option<&Url>) -> String {
    match base.and_then(|b| b.join(raw).ok()) {
        Some(url) => url.to_string(),
        None => raw.to_string(),
    }
}

fn is_attr_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
}
