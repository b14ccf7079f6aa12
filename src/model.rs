//! Domain types for the issue mirror and its voters.
//!
//! Issues are identified by the upstream tracker's numeric id; users by
//! their login. Scores are maintained incrementally by the vote
//! operations in `db`, never recomputed from scratch.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sha1::{Digest, Sha1};

/// Minimum accepted password length, matching the registration form.
pub const MIN_PASSWORD_LEN: usize = 6;

/// What kind of item the upstream tracker reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Issue,
    PullRequest,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Issue => "issue",
            IssueKind::PullRequest => "pull_request",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "issue" => Ok(IssueKind::Issue),
            "pull_request" => Ok(IssueKind::PullRequest),
            other => bail!("unknown issue kind '{}'", other),
        }
    }
}

/// A locally mirrored tracker item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    /// Upstream id, stable and source-assigned.
    pub id: i64,
    /// Human-facing issue number in the upstream repository.
    pub number: i64,
    pub title: String,
    pub kind: IssueKind,
    pub open: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Last modification reported by the upstream tracker.
    pub updated_at: DateTime<Utc>,
    pub score: i64,
    /// Set when an open issue has not been touched upstream within the
    /// staleness horizon. Derived; recomputed on every sync run.
    pub stale: bool,
}

impl Issue {
    /// A closed-at timestamp implies the issue is not open.
    pub fn is_consistent(&self) -> bool {
        self.closed_at.is_none() || !self.open
    }
}

/// Direction of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    /// Contribution of a vote in this direction to an issue's score.
    pub fn score_delta(&self) -> i64 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteDirection::Up => "up",
            VoteDirection::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(VoteDirection::Up),
            "down" => Ok(VoteDirection::Down),
            other => bail!("unknown vote direction '{}'", other),
        }
    }
}

/// One user's vote on one issue. At most one exists per (user, issue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vote {
    pub user_login: String,
    pub issue_id: i64,
    pub direction: VoteDirection,
    pub cast_at: DateTime<Utc>,
}

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub login: String,
    pub pass_hash: String,
    pub salt: String,
    pub email: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl User {
    /// Create an account with a freshly salted password hash.
    pub fn new(login: &str, password: &str, email: &str) -> Result<Self> {
        let now = Utc::now();
        let mut user = User {
            login: login.to_string(),
            pass_hash: String::new(),
            salt: String::new(),
            email: email.to_string(),
            verified: false,
            created_at: now,
            last_seen: now,
        };
        user.set_password(password)?;
        Ok(user)
    }

    /// Replace the password, regenerating the per-user salt.
    pub fn set_password(&mut self, plain: &str) -> Result<()> {
        if plain.len() < MIN_PASSWORD_LEN {
            bail!(
                "password too short (min. {} characters)",
                MIN_PASSWORD_LEN
            );
        }
        self.salt = new_salt();
        self.pass_hash = salted_digest(plain, &self.salt);
        Ok(())
    }

    pub fn check_password(&self, plain: &str) -> bool {
        salted_digest(plain, &self.salt) == self.pass_hash
    }
}

/// An opaque email-verification (or password-reset) token, owned by
/// exactly one user and replaced on reissue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub user_login: String,
    pub value: String,
    pub issued_at: DateTime<Utc>,
}

impl Token {
    /// Mint a fresh token for a user. The value is a 40-char hex digest
    /// over the user's identity plus a random salt.
    pub fn generate(user: &User) -> Self {
        let salt = new_salt();
        let value = salted_digest(&format!("{}{}", user.login, user.email), &salt);
        Token {
            user_login: user.login.clone(),
            value,
            issued_at: Utc::now(),
        }
    }
}

fn new_salt() -> String {
    rand::thread_rng().gen_range(0..1_000_000u32).to_string()
}

fn salted_digest(input: &str, salt: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_is_never_stored_plain() {
        let user = User::new("alice", "hunter234", "a@example.com").unwrap();
        assert_ne!(user.pass_hash, "hunter234");
        assert_eq!(user.pass_hash.len(), 40);
        assert!(user.check_password("hunter234"));
        assert!(!user.check_password("hunter235"));
    }

    #[test]
    fn test_password_change_regenerates_salt() {
        let mut user = User::new("alice", "hunter234", "a@example.com").unwrap();
        let old_salt = user.salt.clone();
        let old_hash = user.pass_hash.clone();
        // A handful of attempts; the salt space makes a collision across
        // all of them vanishingly unlikely.
        let mut changed = false;
        for _ in 0..8 {
            user.set_password("hunter234").unwrap();
            if user.salt != old_salt {
                changed = true;
                break;
            }
        }
        assert!(changed, "salt was never regenerated");
        assert!(user.check_password("hunter234"));
        let _ = old_hash;
    }

    #[test]
    fn test_short_password_rejected() {
        assert!(User::new("bob", "short", "b@example.com").is_err());
    }

    #[test]
    fn test_token_value_shape() {
        let user = User::new("carol", "longenough", "c@example.com").unwrap();
        let token = Token::generate(&user);
        assert_eq!(token.value.len(), 40);
        assert_eq!(token.user_login, "carol");
        assert!(token.value.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_score_delta() {
        assert_eq!(VoteDirection::Up.score_delta(), 1);
        assert_eq!(VoteDirection::Down.score_delta(), -1);
    }

    #[test]
    fn test_issue_consistency() {
        let issue = Issue {
            id: 1,
            number: 10,
            title: "t".to_string(),
            kind: IssueKind::Issue,
            open: true,
            created_at: Utc::now(),
            closed_at: Some(Utc::now()),
            updated_at: Utc::now(),
            score: 0,
            stale: false,
        };
        assert!(!issue.is_consistent());
    }

    #[test]
    fn test_kind_roundtrip() {
        assert_eq!(
            IssueKind::parse(IssueKind::PullRequest.as_str()).unwrap(),
            IssueKind::PullRequest
        );
        assert!(IssueKind::parse("gadget").is_err());
    }
}
