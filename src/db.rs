use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use crate::error::PipelineError;

type Result<T> = std::result::Result<T, PipelineError>;

// Column sizes from the DDL. SQLite doesn't enforce NVARCHAR lengths, the
// normalizer does.
pub const USERNAME_MAX: usize = 50;
pub const EMAIL_MAX: usize = 100;
pub const BIO_MAX: usize = 500;
pub const PROFILE_PHOTO_MAX: usize = 255;
pub const CAPTION_MAX: usize = 2200;
pub const LOCATION_MAX: usize = 100;
pub const COMMENT_TEXT_MAX: usize = 1000;
pub const HASHTAG_NAME_MAX: usize = 100;

/// Open (or create) the database. `:memory:` works for throwaway runs.
pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| PipelineError::Connection(format!("{}: {}", dir.display(), e)))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS USER (
            user_id       INTEGER PRIMARY KEY AUTOINCREMENT,
            username      NVARCHAR(50) NOT NULL CHECK (length(trim(username)) > 0),
            email         NVARCHAR(100) UNIQUE,
            bio           NVARCHAR(500),
            profile_photo NVARCHAR(255),
            created_at    DATETIME NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_user_username ON USER(username);

        CREATE TABLE IF NOT EXISTS POST (
            post_id    INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id_fk INTEGER NOT NULL REFERENCES USER(user_id),
            caption    NVARCHAR(2200),
            location   NVARCHAR(100),
            created_at DATETIME NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_post_user ON POST(user_id_fk);

        CREATE TABLE IF NOT EXISTS COMMENTS (
            comment_id   INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id_fk   INTEGER NOT NULL REFERENCES POST(post_id),
            user_id_fk   INTEGER NOT NULL REFERENCES USER(user_id),
            comment_text NVARCHAR(1000) NOT NULL,
            created_at   DATETIME NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_comments_post ON COMMENTS(post_id_fk);

        CREATE TABLE IF NOT EXISTS HASHTAGS (
            hashtag_id   INTEGER PRIMARY KEY AUTOINCREMENT,
            hashtag_name NVARCHAR(100) NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS POST_TAGS (
            post_id_fk    INTEGER NOT NULL REFERENCES POST(post_id),
            hashtag_id_fk INTEGER NOT NULL REFERENCES HASHTAGS(hashtag_id),
            PRIMARY KEY (post_id_fk, hashtag_id_fk)
        );
        CREATE INDEX IF NOT EXISTS idx_post_tags_hashtag ON POST_TAGS(hashtag_id_fk);

        CREATE TABLE IF NOT EXISTS FOLLOWERS (
            follower_id_fk INTEGER NOT NULL REFERENCES USER(user_id),
            followed_id_fk INTEGER NOT NULL REFERENCES USER(user_id),
            followed_at    DATETIME NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (follower_id_fk, followed_id_fk),
            CHECK (follower_id_fk <> followed_id_fk)
        );
        ",
    )?;
    Ok(())
}

// ── Rows ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRow {
    pub username: String,
    pub email: Option<String>,
    pub bio: Option<String>,
    pub profile_photo: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostRow {
    pub author: String,
    pub caption: Option<String>,
    pub location: Option<String>,
    pub created_at: Option<String>,
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentRow {
    pub post_author: String,
    pub post_caption: Option<String>,
    pub author: String,
    pub comment_text: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashtagRow {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowRow {
    pub follower: String,
    pub followed: String,
}

/// Primary key of whatever a store call wrote (or found).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowKey {
    Id(i64),
    Pair(i64, i64),
}

// ── Users ──

/// Insert-if-absent on (username, email). A row first seen without an email
/// (e.g. as a comment author) gets the email filled in here.
pub fn upsert_user(conn: &Connection, user: &UserRow) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    let id = upsert_user_in(&tx, user)?;
    tx.commit()?;
    Ok(id)
}

fn upsert_user_in(conn: &Connection, user: &UserRow) -> Result<i64> {
    if let Some(email) = &user.email {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM USER WHERE username = ?1 AND email = ?2",
                params![user.username, email],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let placeholder: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM USER WHERE username = ?1 AND email IS NULL
                 ORDER BY user_id LIMIT 1",
                params![user.username],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = placeholder {
            conn.execute(
                "UPDATE USER SET email = ?2,
                                 bio = COALESCE(bio, ?3),
                                 profile_photo = COALESCE(profile_photo, ?4)
                 WHERE user_id = ?1",
                params![id, email, user.bio, user.profile_photo],
            )?;
            debug!("Filled in email for user {} ({})", user.username, id);
            return Ok(id);
        }
    } else if let Some(id) = find_user_by_name(conn, &user.username)? {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO USER (username, email, bio, profile_photo, created_at)
         VALUES (?1, ?2, ?3, ?4, COALESCE(?5, datetime('now')))",
        params![
            user.username,
            user.email,
            user.bio,
            user.profile_photo,
            user.created_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn find_user_by_name(conn: &Connection, username: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT user_id FROM USER WHERE username = ?1 ORDER BY user_id LIMIT 1",
            params![username],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Resolve a user referenced only by name, creating a bare row if needed.
fn ensure_user(conn: &Connection, username: &str) -> Result<i64> {
    upsert_user_in(
        conn,
        &UserRow {
            username: username.to_string(),
            email: None,
            bio: None,
            profile_photo: None,
            created_at: None,
        },
    )
}

// ── Posts ──

/// Insert-if-absent on (user_id_fk, caption). No user resolution: an unknown
/// `user_id` fails the foreign key and nothing is written.
pub fn insert_post(conn: &Connection, user_id: i64, post: &PostRow) -> Result<i64> {
    if let Some(id) = find_post(conn, user_id, post.caption.as_deref())? {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO POST (user_id_fk, caption, location, created_at)
         VALUES (?1, ?2, ?3, COALESCE(?4, datetime('now')))",
        params![user_id, post.caption, post.location, post.created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

fn find_post(conn: &Connection, user_id: i64, caption: Option<&str>) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT post_id FROM POST WHERE user_id_fk = ?1 AND caption IS ?2
             ORDER BY post_id LIMIT 1",
            params![user_id, caption],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Author, post and hashtag links in one transaction.
pub fn store_post(conn: &Connection, post: &PostRow) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    let user_id = ensure_user(&tx, &post.author)?;
    let post_id = insert_post(&tx, user_id, post)?;
    {
        let mut link = tx.prepare(
            "INSERT OR IGNORE INTO POST_TAGS (post_id_fk, hashtag_id_fk) VALUES (?1, ?2)",
        )?;
        for name in &post.hashtags {
            let hashtag_id = store_hashtag_in(&tx, name)?;
            link.execute(params![post_id, hashtag_id])?;
        }
    }
    tx.commit()?;
    Ok(post_id)
}

// ── Comments ──

/// The commented post must already be stored; a comment never creates one.
/// The commenter is resolved (or created) and the comment inserted in one
/// transaction.
pub fn store_comment(conn: &Connection, comment: &CommentRow) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    let post_id = find_user_by_name(&tx, &comment.post_author)?
        .map(|owner| find_post(&tx, owner, comment.post_caption.as_deref()))
        .transpose()?
        .flatten()
        .ok_or_else(|| {
            PipelineError::ConstraintViolation(format!(
                "comment on unknown post by {:?} ({:?})",
                comment.post_author, comment.post_caption
            ))
        })?;
    let user_id = ensure_user(&tx, &comment.author)?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT comment_id FROM COMMENTS
             WHERE post_id_fk = ?1 AND user_id_fk = ?2 AND comment_text = ?3",
            params![post_id, user_id, comment.comment_text],
            |r| r.get(0),
        )
        .optional()?;
    let id = match existing {
        Some(id) => id,
        None => {
            tx.execute(
                "INSERT INTO COMMENTS (post_id_fk, user_id_fk, comment_text, created_at)
                 VALUES (?1, ?2, ?3, COALESCE(?4, datetime('now')))",
                params![post_id, user_id, comment.comment_text, comment.created_at],
            )?;
            tx.last_insert_rowid()
        }
    };
    tx.commit()?;
    Ok(id)
}

// ── Hashtags ──

pub fn store_hashtag(conn: &Connection, hashtag: &HashtagRow) -> Result<i64> {
    store_hashtag_in(conn, &hashtag.name)
}

fn store_hashtag_in(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO HASHTAGS (hashtag_name) VALUES (?1)",
        params![name],
    )?;
    let id = conn.query_row(
        "SELECT hashtag_id FROM HASHTAGS WHERE hashtag_name = ?1",
        params![name],
        |r| r.get(0),
    )?;
    Ok(id)
}

// ── Followers ──

pub fn store_follow(conn: &Connection, follow: &FollowRow) -> Result<(i64, i64)> {
    let tx = conn.unchecked_transaction()?;
    let follower = ensure_user(&tx, &follow.follower)?;
    let followed = ensure_user(&tx, &follow.followed)?;
    insert_follow(&tx, follower, followed)?;
    tx.commit()?;
    Ok((follower, followed))
}

/// `INSERT OR IGNORE` only skips the duplicate pair; the self-follow CHECK
/// still fails.
pub fn insert_follow(conn: &Connection, follower_id: i64, followed_id: i64) -> Result<()> {
    if follower_id == followed_id {
        return Err(PipelineError::ConstraintViolation(format!(
            "user {} cannot follow themselves",
            follower_id
        )));
    }
    conn.execute(
        "INSERT OR IGNORE INTO FOLLOWERS (follower_id_fk, followed_id_fk) VALUES (?1, ?2)",
        params![follower_id, followed_id],
    )?;
    Ok(())
}

// ── Dispatch ──

pub fn store(conn: &Connection, record: &crate::normalizer::CleanRecord) -> Result<RowKey> {
    use crate::normalizer::CleanRecord;
    match record {
        CleanRecord::User(u) => upsert_user(conn, u).map(RowKey::Id),
        CleanRecord::Post(p) => store_post(conn, p).map(RowKey::Id),
        CleanRecord::Comment(c) => store_comment(conn, c).map(RowKey::Id),
        CleanRecord::Hashtag(h) => store_hashtag(conn, h).map(RowKey::Id),
        CleanRecord::Follow(f) => store_follow(conn, f).map(|(a, b)| RowKey::Pair(a, b)),
    }
}

// ── Stats ──

#[derive(Debug, Default, Serialize)]
pub struct Stats {
    pub users: usize,
    pub posts: usize,
    pub comments: usize,
    pub hashtags: usize,
    pub post_tags: usize,
    pub followers: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |table: &str| -> Result<usize> {
        let n = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
        Ok(n)
    };
    Ok(Stats {
        users: count("USER")?,
        posts: count("POST")?,
        comments: count("COMMENTS")?,
        hashtags: count("HASHTAGS")?,
        post_tags: count("POST_TAGS")?,
        followers: count("FOLLOWERS")?,
    })
}

pub struct HashtagUsage {
    pub name: String,
    pub posts: usize,
}

pub fn top_hashtags(conn: &Connection, limit: usize) -> Result<Vec<HashtagUsage>> {
    let mut stmt = conn.prepare(
        "SELECT h.hashtag_name, COUNT(pt.post_id_fk) AS n
         FROM HASHTAGS h
         LEFT JOIN POST_TAGS pt ON pt.hashtag_id_fk = h.hashtag_id
         GROUP BY h.hashtag_id
         ORDER BY n DESC, h.hashtag_name
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(HashtagUsage {
                name: row.get(0)?,
                posts: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn memory_db() -> Connection {
        let conn = connect(Path::new(":memory:")).unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn user(name: &str, email: Option<&str>) -> UserRow {
        UserRow {
            username: name.into(),
            email: email.map(String::from),
            bio: None,
            profile_photo: None,
            created_at: None,
        }
    }

    fn post(author: &str, caption: &str, tags: &[&str]) -> PostRow {
        PostRow {
            author: author.into(),
            caption: Some(caption.into()),
            location: None,
            created_at: None,
            hashtags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = memory_db();
        init_schema(&conn).unwrap();
        assert_eq!(get_stats(&conn).unwrap().users, 0);
    }

    #[test]
    fn same_user_twice_is_one_row() {
        let conn = memory_db();
        let a = upsert_user(&conn, &user("alice", Some("a@x.com"))).unwrap();
        let b = upsert_user(&conn, &user("alice", Some("a@x.com"))).unwrap();
        assert_eq!(a, b);
        assert_eq!(get_stats(&conn).unwrap().users, 1);
    }

    #[test]
    fn email_is_unique_across_usernames() {
        let conn = memory_db();
        upsert_user(&conn, &user("alice", Some("a@x.com"))).unwrap();
        let err = upsert_user(&conn, &user("mallory", Some("a@x.com"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(get_stats(&conn).unwrap().users, 1);
    }

    #[test]
    fn placeholder_user_gets_email() {
        let conn = memory_db();
        let bare = upsert_user(&conn, &user("carol", None)).unwrap();
        let full = upsert_user(&conn, &user("carol", Some("c@x.com"))).unwrap();
        assert_eq!(bare, full);
        let email: Option<String> = conn
            .query_row("SELECT email FROM USER WHERE user_id = ?1", [full], |r| r.get(0))
            .unwrap();
        assert_eq!(email.as_deref(), Some("c@x.com"));
    }

    #[test]
    fn post_for_unknown_user_is_rejected() {
        let conn = memory_db();
        let err = insert_post(&conn, 999, &post("ghost", "boo", &[])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(get_stats(&conn).unwrap().posts, 0);
    }

    #[test]
    fn store_post_links_hashtags() {
        let conn = memory_db();
        let id = store_post(&conn, &post("alice", "Hello #World", &["world", "hello"])).unwrap();
        let again = store_post(&conn, &post("alice", "Hello #World", &["world", "hello"])).unwrap();
        assert_eq!(id, again);

        let s = get_stats(&conn).unwrap();
        assert_eq!((s.users, s.posts, s.hashtags, s.post_tags), (1, 1, 2, 2));
    }

    #[test]
    fn failed_tag_link_rolls_back_post() {
        let conn = memory_db();
        conn.execute_batch(
            "CREATE TRIGGER no_links BEFORE INSERT ON POST_TAGS
             BEGIN SELECT RAISE(ABORT, 'link refused'); END;",
        )
        .unwrap();
        let err = store_post(&conn, &post("alice", "Hello #World", &["world"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);

        let s = get_stats(&conn).unwrap();
        assert_eq!((s.users, s.posts, s.hashtags, s.post_tags), (0, 0, 0, 0));
    }

    #[test]
    fn comment_resolves_post_and_users() {
        let conn = memory_db();
        let post_id = store_post(&conn, &post("bob", "Workbench", &[])).unwrap();
        let comment = CommentRow {
            post_author: "bob".into(),
            post_caption: Some("Workbench".into()),
            author: "carol".into(),
            comment_text: "Nice joinery".into(),
            created_at: Some("2024-05-02 09:00:00".into()),
        };
        let c1 = store_comment(&conn, &comment).unwrap();
        let c2 = store_comment(&conn, &comment).unwrap();
        assert_eq!(c1, c2);

        let (pid, created): (i64, String) = conn
            .query_row(
                "SELECT post_id_fk, created_at FROM COMMENTS WHERE comment_id = ?1",
                [c1],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(pid, post_id);
        assert_eq!(created, "2024-05-02 09:00:00");

        let s = get_stats(&conn).unwrap();
        assert_eq!((s.users, s.posts, s.comments), (2, 1, 1));
    }

    #[test]
    fn comment_on_unstored_post_is_rejected() {
        let conn = memory_db();
        upsert_user(&conn, &user("bob", None)).unwrap();
        let comment = CommentRow {
            post_author: "bob".into(),
            post_caption: Some("never stored".into()),
            author: "carol".into(),
            comment_text: "first!".into(),
            created_at: None,
        };
        let err = store_comment(&conn, &comment).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);

        let s = get_stats(&conn).unwrap();
        assert_eq!((s.users, s.posts, s.comments), (1, 0, 0));
    }

    #[test]
    fn self_follow_is_rejected() {
        let conn = memory_db();
        let id = upsert_user(&conn, &user("alice", None)).unwrap();
        let err = insert_follow(&conn, id, id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);

        // The table CHECK backs it up for writers that skip insert_follow.
        let raw = conn.execute(
            "INSERT INTO FOLLOWERS (follower_id_fk, followed_id_fk) VALUES (?1, ?1)",
            [id],
        );
        assert_eq!(
            PipelineError::from(raw.unwrap_err()).kind(),
            ErrorKind::ConstraintViolation
        );
        assert_eq!(get_stats(&conn).unwrap().followers, 0);
    }

    #[test]
    fn follow_pair_stored_once() {
        let conn = memory_db();
        let f = FollowRow {
            follower: "carol".into(),
            followed: "bob".into(),
        };
        let a = store_follow(&conn, &f).unwrap();
        let b = store_follow(&conn, &f).unwrap();
        assert_eq!(a, b);
        let s = get_stats(&conn).unwrap();
        assert_eq!((s.users, s.followers), (2, 1));
    }

    #[test]
    fn top_hashtags_ranked_by_posts() {
        let conn = memory_db();
        store_post(&conn, &post("a", "one", &["rust", "sqlite"])).unwrap();
        store_post(&conn, &post("a", "two", &["rust"])).unwrap();
        store_hashtag(&conn, &HashtagRow { name: "unused".into() }).unwrap();

        let top = top_hashtags(&conn, 10).unwrap();
        let ranked: Vec<(&str, usize)> = top.iter().map(|h| (h.name.as_str(), h.posts)).collect();
        assert_eq!(ranked, vec![("rust", 2), ("sqlite", 1), ("unused", 0)]);
    }

    #[test]
    fn connect_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("social.sqlite");
        let conn = connect(&path).unwrap();
        init_schema(&conn).unwrap();
        assert!(path.exists());
    }
}
