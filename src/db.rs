//! SQLite persistence for users, issues, votes and verification tokens.
//!
//! Timestamps are stored as RFC 3339 TEXT columns. Scores are maintained
//! incrementally inside vote transactions, never recomputed.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and add
//! a migration function in `run_migrations`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::model::{Issue, IssueKind, Token, User, Vote, VoteDirection};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Ordering for issue listings served to the web layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOrder {
    CreatedDesc,
    ClosedDesc,
    ScoreDesc,
    ScoreAsc,
}

impl IssueOrder {
    fn sql(&self) -> &'static str {
        match self {
            IssueOrder::CreatedDesc => "created_at DESC",
            IssueOrder::ClosedDesc => "closed_at DESC",
            IssueOrder::ScoreDesc => "score DESC",
            IssueOrder::ScoreAsc => "score ASC",
        }
    }
}

/// Filter for issue listings.
#[derive(Debug, Clone, Copy)]
pub struct IssueFilter {
    pub open: Option<bool>,
    pub order: IssueOrder,
    pub limit: Option<u32>,
}

/// Result of applying a vote, for the web layer's benefit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// A fresh vote was recorded.
    Cast,
    /// An opposite-direction vote was replaced.
    Toggled,
    /// A same-direction revote removed the existing vote.
    Withdrawn,
}

/// SQLite database behind a `Mutex` because `rusqlite::Connection` is
/// not `Sync`. Held only for the duration of each operation.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open or create the database file at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .context("Failed to enable foreign key enforcement")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                login TEXT PRIMARY KEY,
                pass_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                email TEXT NOT NULL,
                verified INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS issues (
                id INTEGER PRIMARY KEY,
                number INTEGER NOT NULL,
                title TEXT NOT NULL,
                kind TEXT NOT NULL CHECK(kind IN ('issue', 'pull_request')),
                open INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                closed_at TEXT,
                updated_at TEXT NOT NULL,
                score INTEGER NOT NULL DEFAULT 0,
                stale INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS votes (
                user_login TEXT NOT NULL REFERENCES users(login) ON DELETE CASCADE,
                issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                direction TEXT NOT NULL CHECK(direction IN ('up', 'down')),
                cast_at TEXT NOT NULL,
                PRIMARY KEY (user_login, issue_id)
            );

            CREATE TABLE IF NOT EXISTS tokens (
                user_login TEXT PRIMARY KEY REFERENCES users(login) ON DELETE CASCADE,
                value TEXT NOT NULL,
                issued_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_issues_open ON issues(open);
            CREATE INDEX IF NOT EXISTS idx_issues_closed_at ON issues(closed_at);
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }

    // --- issues ---

    pub fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let row = conn
            .query_row(
                "SELECT id, number, title, kind, open, created_at, closed_at, updated_at, \
                 score, stale FROM issues WHERE id = ?1",
                [id],
                issue_row,
            )
            .optional()
            .context("Failed to query issue")?;
        row.map(IssueRow::into_issue).transpose()
    }

    pub fn insert_issue(&self, issue: &Issue) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO issues (id, number, title, kind, open, created_at, closed_at, \
             updated_at, score, stale) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                issue.id,
                issue.number,
                issue.title,
                issue.kind.as_str(),
                issue.open,
                ts(issue.created_at),
                issue.closed_at.map(ts),
                ts(issue.updated_at),
                issue.score,
                issue.stale,
            ],
        )
        .with_context(|| format!("Failed to insert issue {}", issue.id))?;
        Ok(())
    }

    /// Update everything except `score`, which belongs to the vote
    /// transactions and would race with them otherwise.
    pub fn update_issue(&self, issue: &Issue) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let changed = conn
            .execute(
                "UPDATE issues SET number = ?2, title = ?3, kind = ?4, open = ?5, \
                 created_at = ?6, closed_at = ?7, updated_at = ?8, stale = ?9 WHERE id = ?1",
                rusqlite::params![
                    issue.id,
                    issue.number,
                    issue.title,
                    issue.kind.as_str(),
                    issue.open,
                    ts(issue.created_at),
                    issue.closed_at.map(ts),
                    ts(issue.updated_at),
                    issue.stale,
                ],
            )
            .with_context(|| format!("Failed to update issue {}", issue.id))?;
        if changed == 0 {
            anyhow::bail!("issue {} does not exist", issue.id);
        }
        Ok(())
    }

    pub fn set_stale(&self, id: i64, stale: bool) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE issues SET stale = ?2 WHERE id = ?1",
            rusqlite::params![id, stale],
        )
        .with_context(|| format!("Failed to set stale flag on issue {}", id))?;
        Ok(())
    }

    /// List issues for the web layer.
    pub fn list_issues(&self, filter: IssueFilter) -> Result<Vec<Issue>> {
        let mut sql = String::from(
            "SELECT id, number, title, kind, open, created_at, closed_at, updated_at, \
             score, stale FROM issues",
        );
        if let Some(open) = filter.open {
            sql.push_str(if open { " WHERE open = 1" } else { " WHERE open = 0" });
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(filter.order.sql());
        // Stable tie-break so repeated listings are deterministic.
        sql.push_str(", id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(&sql)
            .context("Failed to prepare issue listing")?;
        let rows = stmt
            .query_map([], issue_row)
            .context("Failed to query issues")?;

        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?.into_issue()?);
        }
        Ok(issues)
    }

    pub fn open_issues(&self) -> Result<Vec<Issue>> {
        self.list_issues(IssueFilter {
            open: Some(true),
            order: IssueOrder::CreatedDesc,
            limit: None,
        })
    }

    /// Ids of closed issues beyond the `keep` most recently closed,
    /// ordered by closed-at descending with an id-ascending tie-break so
    /// repeated runs are deterministic.
    pub fn closed_issues_beyond(&self, keep: u32) -> Result<Vec<i64>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id FROM issues WHERE open = 0 \
                 ORDER BY closed_at DESC, id ASC LIMIT -1 OFFSET ?1",
            )
            .context("Failed to prepare retention query")?;
        let rows = stmt
            .query_map([keep], |row| row.get::<_, i64>(0))
            .context("Failed to query closed issues")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read issue id")?);
        }
        Ok(ids)
    }

    /// Delete an issue and (by cascade) its votes.
    pub fn delete_issue(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute("DELETE FROM issues WHERE id = ?1", [id])
            .with_context(|| format!("Failed to delete issue {}", id))?;
        Ok(rows > 0)
    }

    // --- votes ---

    /// Apply a vote by `user_login` on `issue_id`, maintaining the
    /// issue's score incrementally inside one transaction.
    ///
    /// A same-direction revote removes the existing vote (unvote); an
    /// opposite-direction vote replaces it.
    pub fn apply_vote(
        &self,
        user_login: &str,
        issue_id: i64,
        direction: VoteDirection,
    ) -> Result<VoteOutcome> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn
            .transaction()
            .context("Failed to begin vote transaction")?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT direction FROM votes WHERE user_login = ?1 AND issue_id = ?2",
                rusqlite::params![user_login, issue_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query existing vote")?;

        let had_vote = existing.is_some();
        if let Some(dir) = existing {
            let prev = VoteDirection::parse(&dir)?;
            tx.execute(
                "UPDATE issues SET score = score - ?2 WHERE id = ?1",
                rusqlite::params![issue_id, prev.score_delta()],
            )
            .context("Failed to revert previous vote")?;
            tx.execute(
                "DELETE FROM votes WHERE user_login = ?1 AND issue_id = ?2",
                rusqlite::params![user_login, issue_id],
            )
            .context("Failed to delete previous vote")?;

            if prev == direction {
                tx.commit().context("Failed to commit unvote")?;
                return Ok(VoteOutcome::Withdrawn);
            }
        }

        tx.execute(
            "INSERT INTO votes (user_login, issue_id, direction, cast_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![user_login, issue_id, direction.as_str(), ts(Utc::now())],
        )
        .with_context(|| format!("Failed to record vote on issue {}", issue_id))?;
        tx.execute(
            "UPDATE issues SET score = score + ?2 WHERE id = ?1",
            rusqlite::params![issue_id, direction.score_delta()],
        )
        .context("Failed to apply vote to score")?;

        tx.commit().context("Failed to commit vote")?;
        Ok(if had_vote {
            VoteOutcome::Toggled
        } else {
            VoteOutcome::Cast
        })
    }

    pub fn votes_for_issue(&self, issue_id: i64) -> Result<Vec<Vote>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT user_login, issue_id, direction, cast_at FROM votes \
                 WHERE issue_id = ?1 ORDER BY cast_at DESC",
            )
            .context("Failed to prepare vote listing")?;
        let rows = stmt
            .query_map([issue_id], vote_row)
            .context("Failed to query votes")?;
        collect_votes(rows)
    }

    pub fn votes_by_user(&self, login: &str, limit: Option<u32>) -> Result<Vec<Vote>> {
        let sql = match limit {
            Some(n) => format!(
                "SELECT user_login, issue_id, direction, cast_at FROM votes \
                 WHERE user_login = ?1 ORDER BY cast_at DESC LIMIT {}",
                n
            ),
            None => "SELECT user_login, issue_id, direction, cast_at FROM votes \
                     WHERE user_login = ?1 ORDER BY cast_at DESC"
                .to_string(),
        };
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(&sql)
            .context("Failed to prepare vote listing")?;
        let rows = stmt
            .query_map([login], vote_row)
            .context("Failed to query votes")?;
        collect_votes(rows)
    }

    // --- users ---

    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO users (login, pass_hash, salt, email, verified, created_at, last_seen) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                user.login,
                user.pass_hash,
                user.salt,
                user.email,
                user.verified,
                ts(user.created_at),
                ts(user.last_seen),
            ],
        )
        .with_context(|| format!("Failed to create user '{}'", user.login))?;
        Ok(())
    }

    pub fn get_user(&self, login: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let row = conn
            .query_row(
                "SELECT login, pass_hash, salt, email, verified, created_at, last_seen \
                 FROM users WHERE login = ?1",
                [login],
                user_row,
            )
            .optional()
            .context("Failed to query user")?;
        row.map(UserRow::into_user).transpose()
    }

    /// Check credentials. On success the user's last-seen timestamp is
    /// refreshed, as any successful login counts as activity.
    pub fn authenticate(&self, login: &str, plain: &str) -> Result<bool> {
        let user = match self.get_user(login)? {
            Some(user) => user,
            None => return Ok(false),
        };
        if !user.check_password(plain) {
            return Ok(false);
        }
        self.touch_seen(login)?;
        Ok(true)
    }

    pub fn touch_seen(&self, login: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE users SET last_seen = ?2 WHERE login = ?1",
            rusqlite::params![login, ts(Utc::now())],
        )
        .with_context(|| format!("Failed to update last-seen for '{}'", login))?;
        Ok(())
    }

    /// Replace a user's password, regenerating the salt.
    pub fn update_password(&self, login: &str, plain: &str) -> Result<()> {
        let mut user = self
            .get_user(login)?
            .ok_or_else(|| anyhow!("no such user '{}'", login))?;
        user.set_password(plain)?;
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE users SET pass_hash = ?2, salt = ?3 WHERE login = ?1",
            rusqlite::params![login, user.pass_hash, user.salt],
        )
        .with_context(|| format!("Failed to update password for '{}'", login))?;
        Ok(())
    }

    /// Delete a user along with their votes and token. Issue scores are
    /// adjusted for the removed votes in the same transaction so the
    /// score invariant holds.
    pub fn delete_user(&self, login: &str) -> Result<bool> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn
            .transaction()
            .context("Failed to begin user deletion transaction")?;

        {
            let mut stmt = tx
                .prepare("SELECT issue_id, direction FROM votes WHERE user_login = ?1")
                .context("Failed to prepare vote lookup")?;
            let votes: Vec<(i64, String)> = stmt
                .query_map([login], |row| Ok((row.get(0)?, row.get(1)?)))
                .context("Failed to query user's votes")?
                .collect::<rusqlite::Result<_>>()
                .context("Failed to read user's votes")?;

            for (issue_id, dir) in votes {
                let delta = VoteDirection::parse(&dir)?.score_delta();
                tx.execute(
                    "UPDATE issues SET score = score - ?2 WHERE id = ?1",
                    rusqlite::params![issue_id, delta],
                )
                .context("Failed to revert vote during user deletion")?;
            }
        }

        // Cascades remove the votes and any token.
        let rows = tx
            .execute("DELETE FROM users WHERE login = ?1", [login])
            .with_context(|| format!("Failed to delete user '{}'", login))?;
        tx.commit().context("Failed to commit user deletion")?;
        Ok(rows > 0)
    }

    // --- tokens ---

    /// Mint a verification token for a user, superseding any existing
    /// one (one token per user, replace-on-reissue).
    pub fn issue_token(&self, login: &str) -> Result<Token> {
        let user = self
            .get_user(login)?
            .ok_or_else(|| anyhow!("no such user '{}'", login))?;
        let token = Token::generate(&user);

        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin token reissue")?;
        tx.execute("DELETE FROM tokens WHERE user_login = ?1", [login])
            .context("Failed to remove superseded token")?;
        tx.execute(
            "INSERT INTO tokens (user_login, value, issued_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![token.user_login, token.value, ts(token.issued_at)],
        )
        .with_context(|| format!("Failed to store token for '{}'", login))?;
        tx.commit().context("Failed to commit token reissue")?;

        debug!(login, "issued verification token");
        Ok(token)
    }

    pub fn get_token(&self, login: &str) -> Result<Option<Token>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let row = conn
            .query_row(
                "SELECT user_login, value, issued_at FROM tokens WHERE user_login = ?1",
                [login],
                token_row,
            )
            .optional()
            .context("Failed to query token")?;
        row.map(TokenRow::into_token).transpose()
    }

    /// Consume a verification token: on a match the user is marked
    /// verified and the token destroyed. Returns false on mismatch or
    /// when no token exists.
    pub fn verify_user(&self, login: &str, value: &str) -> Result<bool> {
        let token = match self.get_token(login)? {
            Some(token) => token,
            None => return Ok(false),
        };
        if token.value != value {
            return Ok(false);
        }

        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin verification")?;
        tx.execute("UPDATE users SET verified = 1 WHERE login = ?1", [login])
            .with_context(|| format!("Failed to mark '{}' verified", login))?;
        tx.execute("DELETE FROM tokens WHERE user_login = ?1", [login])
            .context("Failed to destroy consumed token")?;
        tx.commit().context("Failed to commit verification")?;
        Ok(true)
    }

    // --- retention queries ---

    /// All unverified users together with their token, if any.
    pub fn unverified_users(&self) -> Result<Vec<(User, Option<Token>)>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT u.login, u.pass_hash, u.salt, u.email, u.verified, u.created_at, \
                 u.last_seen, t.value, t.issued_at \
                 FROM users u LEFT JOIN tokens t ON t.user_login = u.login \
                 WHERE u.verified = 0",
            )
            .context("Failed to prepare unverified-user query")?;
        let rows = stmt
            .query_map([], |row| {
                let user = user_row(row)?;
                let value: Option<String> = row.get(7)?;
                let issued_at: Option<String> = row.get(8)?;
                Ok((user, value, issued_at))
            })
            .context("Failed to query unverified users")?;

        let mut out = Vec::new();
        for row in rows {
            let (user, value, issued_at) = row.context("Failed to read unverified user")?;
            let user = user.into_user()?;
            let token = match (value, issued_at) {
                (Some(value), Some(issued_at)) => Some(Token {
                    user_login: user.login.clone(),
                    value,
                    issued_at: parse_ts(&issued_at)?,
                }),
                _ => None,
            };
            out.push((user, token));
        }
        Ok(out)
    }

    pub fn users_not_seen_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<User>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT login, pass_hash, salt, email, verified, created_at, last_seen \
                 FROM users WHERE last_seen < ?1",
            )
            .context("Failed to prepare inactive-user query")?;
        let rows = stmt
            .query_map([ts(cutoff)], user_row)
            .context("Failed to query inactive users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?.into_user()?);
        }
        Ok(users)
    }

    /// Tokens whose owning user no longer exists. With foreign keys on
    /// these cannot normally appear; finding one is a data anomaly the
    /// cleanup jobs report rather than repair.
    pub fn orphaned_tokens(&self) -> Result<Vec<Token>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT t.user_login, t.value, t.issued_at FROM tokens t \
                 LEFT JOIN users u ON u.login = t.user_login WHERE u.login IS NULL",
            )
            .context("Failed to prepare orphan-token query")?;
        let rows = stmt
            .query_map([], token_row)
            .context("Failed to query orphaned tokens")?;
        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row.context("Failed to read token row")?.into_token()?);
        }
        Ok(tokens)
    }
}

// --- row mapping ---

struct IssueRow {
    id: i64,
    number: i64,
    title: String,
    kind: String,
    open: bool,
    created_at: String,
    closed_at: Option<String>,
    updated_at: String,
    score: i64,
    stale: bool,
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue> {
        Ok(Issue {
            id: self.id,
            number: self.number,
            title: self.title,
            kind: IssueKind::parse(&self.kind)?,
            open: self.open,
            created_at: parse_ts(&self.created_at)?,
            closed_at: self.closed_at.as_deref().map(parse_ts).transpose()?,
            updated_at: parse_ts(&self.updated_at)?,
            score: self.score,
            stale: self.stale,
        })
    }
}

fn issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRow> {
    Ok(IssueRow {
        id: row.get(0)?,
        number: row.get(1)?,
        title: row.get(2)?,
        kind: row.get(3)?,
        open: row.get(4)?,
        created_at: row.get(5)?,
        closed_at: row.get(6)?,
        updated_at: row.get(7)?,
        score: row.get(8)?,
        stale: row.get(9)?,
    })
}

struct UserRow {
    login: String,
    pass_hash: String,
    salt: String,
    email: String,
    verified: bool,
    created_at: String,
    last_seen: String,
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        Ok(User {
            login: self.login,
            pass_hash: self.pass_hash,
            salt: self.salt,
            email: self.email,
            verified: self.verified,
            created_at: parse_ts(&self.created_at)?,
            last_seen: parse_ts(&self.last_seen)?,
        })
    }
}

fn user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        login: row.get(0)?,
        pass_hash: row.get(1)?,
        salt: row.get(2)?,
        email: row.get(3)?,
        verified: row.get(4)?,
        created_at: row.get(5)?,
        last_seen: row.get(6)?,
    })
}

struct TokenRow {
    user_login: String,
    value: String,
    issued_at: String,
}

impl TokenRow {
    fn into_token(self) -> Result<Token> {
        Ok(Token {
            user_login: self.user_login,
            value: self.value,
            issued_at: parse_ts(&self.issued_at)?,
        })
    }
}

fn token_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRow> {
    Ok(TokenRow {
        user_login: row.get(0)?,
        value: row.get(1)?,
        issued_at: row.get(2)?,
    })
}

fn vote_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn collect_votes(
    rows: impl Iterator<Item = rusqlite::Result<(String, i64, String, String)>>,
) -> Result<Vec<Vote>> {
    let mut votes = Vec::new();
    for row in rows {
        let (user_login, issue_id, direction, cast_at) =
            row.context("Failed to read vote row")?;
        votes.push(Vote {
            user_login,
            issue_id,
            direction: VoteDirection::parse(&direction)?,
            cast_at: parse_ts(&cast_at)?,
        });
    }
    Ok(votes)
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Failed to parse stored timestamp '{}'", s))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_issue(id: i64, open: bool) -> Issue {
        Issue {
            id,
            number: id * 10,
            title: format!("issue {}", id),
            kind: IssueKind::Issue,
            open,
            created_at: Utc::now(),
            closed_at: if open { None } else { Some(Utc::now()) },
            updated_at: Utc::now(),
            score: 0,
            stale: false,
        }
    }

    fn make_user(db: &Db, login: &str) {
        let user = User::new(login, "longenough", &format!("{}@example.com", login)).unwrap();
        db.create_user(&user).unwrap();
    }

    #[test]
    fn test_issue_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let issue = make_issue(7, true);
        db.insert_issue(&issue).unwrap();
        let loaded = db.get_issue(7).unwrap().unwrap();
        assert_eq!(loaded.title, "issue 7");
        assert!(loaded.open);
        assert_eq!(loaded.closed_at, None);
        assert!(db.get_issue(8).unwrap().is_none());
    }

    #[test]
    fn test_update_issue_preserves_score() {
        let db = Db::open_in_memory().unwrap();
        let mut issue = make_issue(1, true);
        db.insert_issue(&issue).unwrap();
        make_user(&db, "alice");
        db.apply_vote("alice", 1, VoteDirection::Up).unwrap();

        issue.title = "renamed".to_string();
        issue.score = 999; // deliberately wrong; update must ignore it
        db.update_issue(&issue).unwrap();

        let loaded = db.get_issue(1).unwrap().unwrap();
        assert_eq!(loaded.title, "renamed");
        assert_eq!(loaded.score, 1);
    }

    #[test]
    fn test_list_issues_order_and_limit() {
        let db = Db::open_in_memory().unwrap();
        for id in 1..=4 {
            let mut issue = make_issue(id, true);
            issue.created_at = Utc::now() + Duration::seconds(id);
            db.insert_issue(&issue).unwrap();
        }
        make_user(&db, "alice");
        db.apply_vote("alice", 3, VoteDirection::Up).unwrap();

        let by_created = db
            .list_issues(IssueFilter {
                open: Some(true),
                order: IssueOrder::CreatedDesc,
                limit: Some(2),
            })
            .unwrap();
        assert_eq!(by_created.iter().map(|i| i.id).collect::<Vec<_>>(), [4, 3]);

        let by_score = db
            .list_issues(IssueFilter {
                open: Some(true),
                order: IssueOrder::ScoreDesc,
                limit: None,
            })
            .unwrap();
        assert_eq!(by_score[0].id, 3);
    }

    #[test]
    fn test_vote_toggle_semantics() {
        let db = Db::open_in_memory().unwrap();
        db.insert_issue(&make_issue(1, true)).unwrap();
        make_user(&db, "alice");

        // up, then up again: nets to no vote, score back to baseline
        assert_eq!(
            db.apply_vote("alice", 1, VoteDirection::Up).unwrap(),
            VoteOutcome::Cast
        );
        assert_eq!(db.get_issue(1).unwrap().unwrap().score, 1);
        assert_eq!(
            db.apply_vote("alice", 1, VoteDirection::Up).unwrap(),
            VoteOutcome::Withdrawn
        );
        assert_eq!(db.get_issue(1).unwrap().unwrap().score, 0);
        assert!(db.votes_for_issue(1).unwrap().is_empty());

        // up then down: -2 relative to the up-voted state
        db.apply_vote("alice", 1, VoteDirection::Up).unwrap();
        assert_eq!(
            db.apply_vote("alice", 1, VoteDirection::Down).unwrap(),
            VoteOutcome::Toggled
        );
        assert_eq!(db.get_issue(1).unwrap().unwrap().score, -1);
        assert_eq!(db.votes_for_issue(1).unwrap().len(), 1);
    }

    #[test]
    fn test_one_vote_per_user_issue_pair() {
        let db = Db::open_in_memory().unwrap();
        db.insert_issue(&make_issue(1, true)).unwrap();
        make_user(&db, "alice");
        make_user(&db, "bob");

        db.apply_vote("alice", 1, VoteDirection::Up).unwrap();
        db.apply_vote("bob", 1, VoteDirection::Up).unwrap();
        assert_eq!(db.get_issue(1).unwrap().unwrap().score, 2);
        assert_eq!(db.votes_for_issue(1).unwrap().len(), 2);
        assert_eq!(db.votes_by_user("alice", None).unwrap().len(), 1);
    }

    #[test]
    fn test_authenticate_touches_last_seen() {
        let db = Db::open_in_memory().unwrap();
        make_user(&db, "alice");
        let before = db.get_user("alice").unwrap().unwrap().last_seen;
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(db.authenticate("alice", "longenough").unwrap());
        assert!(!db.authenticate("alice", "wrongwrong").unwrap());
        assert!(!db.authenticate("nobody", "whatever12").unwrap());

        let after = db.get_user("alice").unwrap().unwrap().last_seen;
        assert!(after > before);
    }

    #[test]
    fn test_update_password_regenerates_hash() {
        let db = Db::open_in_memory().unwrap();
        make_user(&db, "alice");
        let before = db.get_user("alice").unwrap().unwrap();

        db.update_password("alice", "completely-new").unwrap();
        let after = db.get_user("alice").unwrap().unwrap();
        assert_ne!(before.pass_hash, after.pass_hash);
        assert!(db.authenticate("alice", "completely-new").unwrap());
        assert!(!db.authenticate("alice", "longenough").unwrap());
    }

    #[test]
    fn test_token_replace_on_reissue_and_verify() {
        let db = Db::open_in_memory().unwrap();
        make_user(&db, "alice");

        let first = db.issue_token("alice").unwrap();
        let second = db.issue_token("alice").unwrap();
        assert_ne!(first.value, second.value);

        // The superseded token no longer verifies.
        assert!(!db.verify_user("alice", &first.value).unwrap());
        assert!(db.verify_user("alice", &second.value).unwrap());
        assert!(db.get_user("alice").unwrap().unwrap().verified);
        // Consumed on success.
        assert!(db.get_token("alice").unwrap().is_none());
        assert!(!db.verify_user("alice", &second.value).unwrap());
    }

    #[test]
    fn test_delete_user_cascades_and_fixes_scores() {
        let db = Db::open_in_memory().unwrap();
        db.insert_issue(&make_issue(1, true)).unwrap();
        db.insert_issue(&make_issue(2, true)).unwrap();
        make_user(&db, "alice");
        db.issue_token("alice").unwrap();
        db.apply_vote("alice", 1, VoteDirection::Up).unwrap();
        db.apply_vote("alice", 2, VoteDirection::Down).unwrap();

        assert!(db.delete_user("alice").unwrap());
        assert!(db.get_user("alice").unwrap().is_none());
        assert!(db.get_token("alice").unwrap().is_none());
        assert!(db.votes_by_user("alice", None).unwrap().is_empty());
        assert_eq!(db.get_issue(1).unwrap().unwrap().score, 0);
        assert_eq!(db.get_issue(2).unwrap().unwrap().score, 0);

        assert!(!db.delete_user("alice").unwrap());
    }

    #[test]
    fn test_delete_issue_cascades_votes() {
        let db = Db::open_in_memory().unwrap();
        db.insert_issue(&make_issue(1, false)).unwrap();
        make_user(&db, "alice");
        db.apply_vote("alice", 1, VoteDirection::Up).unwrap();

        assert!(db.delete_issue(1).unwrap());
        assert!(db.votes_by_user("alice", None).unwrap().is_empty());
        assert!(!db.delete_issue(1).unwrap());
    }

    #[test]
    fn test_closed_issues_beyond_keep() {
        let db = Db::open_in_memory().unwrap();
        let base = Utc::now();
        for id in 1..=5 {
            let mut issue = make_issue(id, false);
            issue.closed_at = Some(base + Duration::seconds(id));
            db.insert_issue(&issue).unwrap();
        }
        // keep the 2 most recently closed (ids 5 and 4)
        let beyond = db.closed_issues_beyond(2).unwrap();
        assert_eq!(beyond, vec![3, 2, 1]);
        assert!(db.closed_issues_beyond(5).unwrap().is_empty());
    }

    #[test]
    fn test_unverified_users_listing() {
        let db = Db::open_in_memory().unwrap();
        make_user(&db, "alice");
        make_user(&db, "bob");
        db.issue_token("alice").unwrap();
        let token = db.issue_token("bob").unwrap();
        db.verify_user("bob", &token.value).unwrap();

        let unverified = db.unverified_users().unwrap();
        assert_eq!(unverified.len(), 1);
        let (user, token) = &unverified[0];
        assert_eq!(user.login, "alice");
        assert!(token.is_some());
    }

    #[test]
    fn test_schema_version_is_set() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn.lock().expect("mutex poisoned");
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_rejects_newer_schema_version() {
        let temp_dir = std::env::temp_dir();
        let db_path = temp_dir.join(format!("trackervote_version_{}.db", std::process::id()));

        {
            let conn = Connection::open(&db_path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .unwrap();
        }

        match Db::open(&db_path) {
            Ok(_) => panic!("should reject newer schema version"),
            Err(e) => assert!(e.to_string().contains("newer than supported")),
        }

        std::fs::remove_file(&db_path).ok();
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let temp_dir = std::env::temp_dir();
        let db_path = temp_dir.join(format!("trackervote_idempotent_{}.db", std::process::id()));

        {
            let _db = Db::open(&db_path).expect("first open should succeed");
        }
        {
            let _db = Db::open(&db_path).expect("second open should succeed");
        }

        std::fs::remove_file(&db_path).ok();
    }
}
