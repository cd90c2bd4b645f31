use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::rules::{CompiledRules, RecordRule};
use super::{Page, RawRecord, RecordKind};
use crate::error::PipelineError;

/// Extract every configured record kind from one page.
///
/// Records come out users first, then posts, comments, hashtags and follows,
/// so the users a post or comment points at are always seen before it.
/// The first user on the page is its owner: posts without an `author` and
/// follows without a `followed` side are attributed to them.
pub fn extract_page(page: &Page, rules: &CompiledRules) -> Result<Vec<RawRecord>, PipelineError> {
    if page.html.trim().is_empty() {
        return Err(parse_error(page, "empty document".into()));
    }

    let doc = Html::parse_document(&page.html);
    let root = doc.root_element();
    let base = Url::parse(&page.url).ok();
    let base = base.as_ref();

    let mut users = Vec::new();
    if let Some(rule) = &rules.user {
        users = select_records(page, root, rule, RecordKind::User, base)?;
    }
    let owner = users
        .iter()
        .find_map(|u| u.get("username"))
        .map(str::to_string);

    let mut posts = Vec::new();
    let mut comments = Vec::new();
    if let Some(rule) = &rules.post {
        for el in root.select(&rule.container) {
            let nested = rules.comment.as_ref().map(|c| &c.container);
            let mut post = build_record(page, el, rule, RecordKind::Post, base, nested);
            if post.get("author").is_none() {
                if let Some(owner) = &owner {
                    post.set("author", owner.as_str());
                }
            }
            if let Some(c_rule) = &rules.comment {
                for c_el in el.select(&c_rule.container) {
                    let mut comment =
                        build_record(page, c_el, c_rule, RecordKind::Comment, base, None);
                    if let Some(author) = post.get("author") {
                        comment.set("post_author", author);
                    }
                    if let Some(caption) = post.get("caption") {
                        comment.set("post_caption", caption);
                    }
                    comments.push(comment);
                }
            }
            posts.push(post);
        }
        check_required(page, rule, RecordKind::Post, posts.len())?;
    } else if let Some(c_rule) = &rules.comment {
        comments = select_records(page, root, c_rule, RecordKind::Comment, base)?;
    }
    if let Some(c_rule) = &rules.comment {
        check_required(page, c_rule, RecordKind::Comment, comments.len())?;
    }

    let mut hashtags = Vec::new();
    if let Some(rule) = &rules.hashtag {
        hashtags = select_records(page, root, rule, RecordKind::Hashtag, base)?;
    }

    let mut follows = Vec::new();
    if let Some(rule) = &rules.follow {
        follows = select_records(page, root, rule, RecordKind::Follow, base)?;
        if let Some(owner) = &owner {
            for follow in follows.iter_mut().filter(|f| f.get("followed").is_none()) {
                follow.set("followed", owner.as_str());
            }
        }
    }

    debug!(
        "{} ({}): {} users, {} posts, {} comments, {} hashtags, {} follows",
        page.target,
        page.url,
        users.len(),
        posts.len(),
        comments.len(),
        hashtags.len(),
        follows.len()
    );

    let mut records = users;
    records.extend(posts);
    records.extend(comments);
    records.extend(hashtags);
    records.extend(follows);
    Ok(records)
}

fn select_records(
    page: &Page,
    scope: ElementRef<'_>,
    rule: &RecordRule,
    kind: RecordKind,
    base: Option<&Url>,
) -> Result<Vec<RawRecord>, PipelineError> {
    let records: Vec<RawRecord> = scope
        .select(&rule.container)
        .map(|el| build_record(page, el, rule, kind, base, None))
        .collect();
    check_required(page, rule, kind, records.len())?;
    Ok(records)
}

fn build_record(
    page: &Page,
    el: ElementRef<'_>,
    rule: &RecordRule,
    kind: RecordKind,
    base: Option<&Url>,
    nested: Option<&Selector>,
) -> RawRecord {
    let mut record = RawRecord::new(kind, &page.url);
    for (name, field) in &rule.fields {
        if let Some(value) = field.extract_outside(el, base, nested) {
            record.set(name, value);
        }
    }
    record
}

fn check_required(
    page: &Page,
    rule: &RecordRule,
    kind: RecordKind,
    found: usize,
) -> Result<(), PipelineError> {
    if rule.required && found == 0 {
        return Err(parse_error(page, format!("no {} elements found", kind)));
    }
    Ok(())
}

fn parse_error(page: &Page, reason: String) -> PipelineError {
    PipelineError::Parse {
        url: page.url.clone(),
        reason,
    }
}
