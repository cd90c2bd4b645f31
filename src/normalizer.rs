use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::collector::{RawRecord, RecordKind};
use crate::db::{self, CommentRow, FollowRow, HashtagRow, PostRow, UserRow};
use crate::error::PipelineError;

static CAPTION_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\w+)").unwrap());
static TAG_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+$").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s.]+$").unwrap());

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// A record that passed cleaning and is ready for the persister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CleanRecord {
    User(UserRow),
    Post(PostRow),
    Comment(CommentRow),
    Hashtag(HashtagRow),
    Follow(FollowRow),
}

/// Clean one raw record, or say why it can't be stored.
pub fn clean(raw: &RawRecord) -> Result<CleanRecord, PipelineError> {
    match raw.kind {
        RecordKind::User => clean_user(raw).map(CleanRecord::User),
        RecordKind::Post => clean_post(raw).map(CleanRecord::Post),
        RecordKind::Comment => clean_comment(raw).map(CleanRecord::Comment),
        RecordKind::Hashtag => clean_hashtag(raw).map(CleanRecord::Hashtag),
        RecordKind::Follow => clean_follow(raw).map(CleanRecord::Follow),
    }
}

fn clean_user(raw: &RawRecord) -> Result<UserRow, PipelineError> {
    let username = required_username(raw.get("username"), "username")?;
    let email = match clean_text(raw.get("email")) {
        Some(e) => Some(normalize_email(&e)?),
        None => None,
    };
    let bio = bounded("bio", optional(raw, "bio"), db::BIO_MAX)?;
    let profile_photo = bounded(
        "profile_photo",
        optional(raw, "profile_photo"),
        db::PROFILE_PHOTO_MAX,
    )?;
    let created_at = timestamp(raw)?;
    Ok(UserRow {
        username,
        email,
        bio,
        profile_photo,
        created_at,
    })
}

fn clean_post(raw: &RawRecord) -> Result<PostRow, PipelineError> {
    let author = required_username(raw.get("author"), "author")?;
    let caption = bounded("caption", optional(raw, "caption"), db::CAPTION_MAX)?;
    let location = bounded("location", optional(raw, "location"), db::LOCATION_MAX)?;
    let created_at = timestamp(raw)?;

    let mut hashtags = caption.as_deref().map(caption_hashtags).unwrap_or_default();
    if let Some(tags) = raw.get("tags") {
        for tag in tags.split(|c: char| c.is_whitespace() || c == ',') {
            if tag.is_empty() {
                continue;
            }
            match normalize_hashtag(tag) {
                Ok(t) if !hashtags.contains(&t) => hashtags.push(t),
                Ok(_) => {}
                Err(e) => debug!("{}: skipping post tag: {}", raw.source, e),
            }
        }
    }

    Ok(PostRow {
        author,
        caption,
        location,
        created_at,
        hashtags,
    })
}

fn clean_comment(raw: &RawRecord) -> Result<CommentRow, PipelineError> {
    let author = required_username(raw.get("author"), "author")?;
    let post_author = required_username(raw.get("post_author"), "post_author")?;
    let post_caption = bounded("caption", optional(raw, "post_caption"), db::CAPTION_MAX)?;
    let comment_text = clean_text(raw.get("comment_text"))
        .ok_or(PipelineError::MissingRequiredField("comment_text"))?;
    let comment_text = check_len("comment_text", comment_text, db::COMMENT_TEXT_MAX)?;
    let created_at = timestamp(raw)?;
    Ok(CommentRow {
        post_author,
        post_caption,
        author,
        comment_text,
        created_at,
    })
}

fn clean_hashtag(raw: &RawRecord) -> Result<HashtagRow, PipelineError> {
    let name = raw
        .get("name")
        .ok_or(PipelineError::MissingRequiredField("hashtag_name"))?;
    Ok(HashtagRow {
        name: normalize_hashtag(name)?,
    })
}

fn clean_follow(raw: &RawRecord) -> Result<FollowRow, PipelineError> {
    let follower = required_username(raw.get("follower"), "follower")?;
    let followed = required_username(raw.get("followed"), "followed")?;
    if follower == followed {
        return Err(PipelineError::invalid("followed", followed));
    }
    Ok(FollowRow { follower, followed })
}

// ── Field helpers ──

/// Trim, collapse whitespace runs, and map empty to `None`.
pub fn clean_text(raw: Option<&str>) -> Option<String> {
    let text = raw?.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn optional(raw: &RawRecord, field: &str) -> Option<String> {
    let value = clean_text(raw.get(field));
    if value.is_none() {
        debug!("{}: {} has no {}", raw.source, raw.kind, field);
    }
    value
}

/// Drop a leading `@` and any punctuation other than `_`, `.` and `-`;
/// separators are also trimmed from both ends.
pub fn normalize_username(raw: &str) -> String {
    let kept: String = raw
        .trim()
        .trim_start_matches('@')
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '-').to_string()
}

fn required_username(raw: Option<&str>, field: &'static str) -> Result<String, PipelineError> {
    let name = raw.map(normalize_username).unwrap_or_default();
    if name.is_empty() {
        return Err(PipelineError::MissingRequiredField(field));
    }
    check_len(field, name, db::USERNAME_MAX)
}

/// Lowercase, strip leading `#`s. Applying it twice changes nothing.
pub fn normalize_hashtag(raw: &str) -> Result<String, PipelineError> {
    let name = raw.trim().trim_start_matches('#').trim().to_lowercase();
    if name.is_empty() {
        return Err(PipelineError::MissingRequiredField("hashtag_name"));
    }
    if !TAG_NAME_RE.is_match(&name) {
        return Err(PipelineError::invalid("hashtag_name", raw.trim()));
    }
    check_len("hashtag_name", name, db::HASHTAG_NAME_MAX)
}

/// Normalized `#tags` from a caption, first occurrence order, no repeats.
/// Tags too long for the HASHTAGS table are skipped.
pub fn caption_hashtags(caption: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for caps in CAPTION_TAG_RE.captures_iter(caption) {
        match normalize_hashtag(&caps[1]) {
            Ok(tag) if !tags.contains(&tag) => tags.push(tag),
            Ok(_) => {}
            Err(e) => debug!("skipping caption tag: {}", e),
        }
    }
    tags
}

fn normalize_email(raw: &str) -> Result<String, PipelineError> {
    let email = raw.trim().trim_start_matches("mailto:").to_lowercase();
    if !EMAIL_RE.is_match(&email) {
        return Err(PipelineError::invalid("email", raw));
    }
    check_len("email", email, db::EMAIL_MAX)
}

fn timestamp(raw: &RawRecord) -> Result<Option<String>, PipelineError> {
    clean_text(raw.get("created_at"))
        .map(|t| parse_timestamp(&t))
        .transpose()
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` and
/// `YYYY-MM-DD`; returns SQLite's `datetime()` format in UTC.
pub fn parse_timestamp(raw: &str) -> Result<String, PipelineError> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).format(TIMESTAMP_FMT).to_string());
    }
    for fmt in [TIMESTAMP_FMT, "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.format(TIMESTAMP_FMT).to_string());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.format(TIMESTAMP_FMT).to_string())
        .ok_or_else(|| PipelineError::invalid("created_at", s))
}

fn check_len(field: &'static str, value: String, max: usize) -> Result<String, PipelineError> {
    if value.chars().count() > max {
        return Err(PipelineError::invalid(field, value));
    }
    Ok(value)
}

fn bounded(
    field: &'static str,
    value: Option<String>,
    max: usize,
) -> Result<Option<String>, PipelineError> {
    value.map(|v| check_len(field, v, max)).transpose()
}

// ── Batch dedup ──

/// First-seen-wins dedup on natural keys: username+email for users,
/// name for hashtags. Other kinds always pass.
#[derive(Debug, Default)]
pub struct Deduper {
    users: HashSet<(String, Option<String>)>,
    hashtags: HashSet<String>,
}

impl Deduper {
    /// `true` if the record is the first with its natural key.
    pub fn admit(&mut self, record: &CleanRecord) -> bool {
        match record {
            CleanRecord::User(u) => self.users.insert((u.username.clone(), u.email.clone())),
            CleanRecord::Hashtag(h) => self.hashtags.insert(h.name.clone()),
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub records: Vec<CleanRecord>,
    pub rejected: Vec<PipelineError>,
    pub duplicates: usize,
}

#[derive(Debug, Default)]
pub struct Normalizer {
    dedup: Deduper,
    batch: NormalizedBatch,
}

impl Normalizer {
    pub fn push(&mut self, raw: &RawRecord) {
        match clean(raw) {
            Ok(record) if self.dedup.admit(&record) => self.batch.records.push(record),
            Ok(record) => {
                debug!("{}: duplicate {:?}", raw.source, record);
                self.batch.duplicates += 1;
            }
            Err(e) => {
                debug!("{}: rejected {}: {}", raw.source, raw.kind, e);
                self.batch.rejected.push(e);
            }
        }
    }

    pub fn finish(self) -> NormalizedBatch {
        self.batch
    }
}

pub fn normalize_batch<'a>(raws: impl IntoIterator<Item = &'a RawRecord>) -> NormalizedBatch {
    let mut normalizer = Normalizer::default();
    for raw in raws {
        normalizer.push(raw);
    }
    normalizer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn raw(kind: RecordKind, fields: &[(&str, &str)]) -> RawRecord {
        fields
            .iter()
            .fold(RawRecord::new(kind, "test"), |r, (k, v)| r.with(k, *v))
    }

    #[test]
    fn hashtag_normalization_is_idempotent() {
        let variants = ["World", "#World", "#world", "##WORLD", "  #wOrLd "];
        for v in variants {
            let once = normalize_hashtag(v).unwrap();
            assert_eq!(once, "world");
            assert_eq!(normalize_hashtag(&once).unwrap(), once);
        }
    }

    #[test]
    fn hashtag_rejections() {
        assert_eq!(
            normalize_hashtag("#").unwrap_err().kind(),
            ErrorKind::MissingRequiredField
        );
        assert_eq!(
            normalize_hashtag("#two words").unwrap_err().kind(),
            ErrorKind::InvalidFormat
        );
        let long = "a".repeat(db::HASHTAG_NAME_MAX + 1);
        assert_eq!(normalize_hashtag(&long).unwrap_err().kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn username_punctuation() {
        assert_eq!(normalize_username("  @alice "), "alice");
        assert_eq!(normalize_username("alice!"), "alice");
        assert_eq!(normalize_username("bob_the.builder-1"), "bob_the.builder-1");
        assert_eq!(normalize_username("...carol..."), "carol");
        assert_eq!(normalize_username("(dave)"), "dave");
        assert_eq!(normalize_username("@!?"), "");
    }

    #[test]
    fn user_requires_username() {
        let err = clean(&raw(RecordKind::User, &[("email", "a@x.com")])).unwrap_err();
        assert!(matches!(err, PipelineError::MissingRequiredField("username")));
        let err = clean(&raw(RecordKind::User, &[("username", " !! ")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredField);
    }

    #[test]
    fn username_too_long() {
        let name = "x".repeat(db::USERNAME_MAX + 1);
        let err = clean(&raw(RecordKind::User, &[("username", &name)])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn user_fields_cleaned() {
        let rec = clean(&raw(
            RecordKind::User,
            &[
                ("username", "@alice"),
                ("email", " A@X.com "),
                ("bio", "  likes \n  tea  "),
                ("created_at", "2023-01-02"),
            ],
        ))
        .unwrap();
        let CleanRecord::User(u) = rec else {
            panic!("expected user")
        };
        assert_eq!(u.username, "alice");
        assert_eq!(u.email.as_deref(), Some("a@x.com"));
        assert_eq!(u.bio.as_deref(), Some("likes tea"));
        assert_eq!(u.profile_photo, None);
        assert_eq!(u.created_at.as_deref(), Some("2023-01-02 00:00:00"));
    }

    #[test]
    fn bad_email_rejected() {
        for bad in ["not-an-email", "a@b", "a b@c.com"] {
            let err = clean(&raw(RecordKind::User, &[("username", "a"), ("email", bad)]))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidFormat, "{}", bad);
        }
    }

    #[test]
    fn timestamps() {
        assert_eq!(
            parse_timestamp("2024-05-01T20:30:00+02:00").unwrap(),
            "2024-05-01 18:30:00"
        );
        assert_eq!(parse_timestamp("2024-05-01 18:30:00").unwrap(), "2024-05-01 18:30:00");
        assert_eq!(parse_timestamp("2024-05-01T18:30:00").unwrap(), "2024-05-01 18:30:00");
        assert_eq!(
            parse_timestamp("May 1").unwrap_err().kind(),
            ErrorKind::InvalidFormat
        );
    }

    #[test]
    fn post_hashtags_from_caption_and_tags() {
        let rec = clean(&raw(
            RecordKind::Post,
            &[
                ("author", "bob"),
                ("caption", "Golden hour #sunset #Pier"),
                ("tags", "#Sunset, #beach #bad-tag"),
            ],
        ))
        .unwrap();
        let CleanRecord::Post(p) = rec else {
            panic!("expected post")
        };
        assert_eq!(p.hashtags, vec!["sunset", "pier", "beach"]);
        assert_eq!(p.location, None);
    }

    #[test]
    fn overlong_caption_tag_is_skipped() {
        let long = "a".repeat(db::HASHTAG_NAME_MAX + 1);
        let fits = "b".repeat(db::HASHTAG_NAME_MAX);
        let caption = format!("Hi #{} #{}", long, fits);
        assert_eq!(caption_hashtags(&caption), vec![fits.clone()]);

        let rec = clean(&raw(
            RecordKind::Post,
            &[("author", "bob"), ("caption", caption.as_str())],
        ))
        .unwrap();
        let CleanRecord::Post(p) = rec else {
            panic!("expected post")
        };
        assert_eq!(p.hashtags, vec![fits]);
    }

    #[test]
    fn post_requires_author() {
        let err = clean(&raw(RecordKind::Post, &[("caption", "hi")])).unwrap_err();
        assert!(matches!(err, PipelineError::MissingRequiredField("author")));
    }

    #[test]
    fn comment_requires_text_and_post() {
        let no_text = raw(
            RecordKind::Comment,
            &[("author", "carol"), ("post_author", "bob")],
        );
        assert!(matches!(
            clean(&no_text).unwrap_err(),
            PipelineError::MissingRequiredField("comment_text")
        ));
        let orphan = raw(
            RecordKind::Comment,
            &[("author", "carol"), ("comment_text", "hi")],
        );
        assert!(matches!(
            clean(&orphan).unwrap_err(),
            PipelineError::MissingRequiredField("post_author")
        ));
    }

    #[test]
    fn self_follow_rejected() {
        let err = clean(&raw(
            RecordKind::Follow,
            &[("follower", "@alice"), ("followed", "alice")],
        ))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn dedup_is_first_seen_wins() {
        let first = raw(
            RecordKind::User,
            &[("username", "alice"), ("email", "a@x.com"), ("bio", "first")],
        );
        let second = raw(
            RecordKind::User,
            &[("username", "alice"), ("email", "A@X.COM"), ("bio", "second")],
        );
        let tag_a = raw(RecordKind::Hashtag, &[("name", "#World")]);
        let tag_b = raw(RecordKind::Hashtag, &[("name", "world")]);
        let broken = raw(RecordKind::Hashtag, &[("name", "##")]);

        let batch = normalize_batch([&first, &second, &tag_a, &tag_b, &broken]);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.duplicates, 2);
        assert_eq!(batch.rejected.len(), 1);
        let CleanRecord::User(u) = &batch.records[0] else {
            panic!("expected user")
        };
        assert_eq!(u.bio.as_deref(), Some("first"));
    }

    #[test]
    fn same_username_different_email_is_not_a_duplicate() {
        let a = raw(RecordKind::User, &[("username", "alice"), ("email", "a@x.com")]);
        let b = raw(RecordKind::User, &[("username", "alice"), ("email", "a@y.com")]);
        let batch = normalize_batch([&a, &b]);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.duplicates, 0);
    }
}
