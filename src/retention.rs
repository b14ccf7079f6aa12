//! Periodic batch deletion of expired entities: old closed issues,
//! unverified accounts past their grace window, and long-inactive
//! accounts.
//!
//! All passes are idempotent and best-effort: a record that fails to
//! delete is logged with identifying context and skipped, never aborting
//! the pass.

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use anyhow::Result;

use crate::db::Db;

/// Delete closed issues beyond the `keep` most recently closed (and
/// their votes, by cascade). Returns the number deleted.
pub fn clean_issues(db: &Db, keep: u32) -> Result<u64> {
    let beyond = db.closed_issues_beyond(keep)?;
    if beyond.is_empty() {
        return Ok(0);
    }

    let mut deleted = 0u64;
    for id in beyond {
        match db.delete_issue(id) {
            Ok(true) => deleted += 1,
            Ok(false) => warn!(issue = id, "closed issue vanished before deletion"),
            Err(e) => warn!(issue = id, error = %e, "failed to delete closed issue"),
        }
    }
    info!(deleted, keep, "cleaned old closed issues");
    Ok(deleted)
}

/// Delete unverified accounts whose verification token is older than
/// `max_token_age`, along with their votes and token. An unverified user
/// without any token is an anomaly worth reporting, not silently
/// deleting. Returns the number removed.
pub fn clean_unverified_users(db: &Db, max_token_age: Duration) -> Result<u64> {
    report_orphaned_tokens(db);

    let cutoff = Utc::now() - max_token_age;
    let mut removed = 0u64;

    for (user, token) in db.unverified_users()? {
        let Some(token) = token else {
            error!(
                login = %user.login,
                "unverified user has no verification token; skipping"
            );
            continue;
        };
        if token.issued_at >= cutoff {
            continue;
        }
        match db.delete_user(&user.login) {
            Ok(true) => removed += 1,
            Ok(false) => warn!(login = %user.login, "unverified user vanished before deletion"),
            Err(e) => warn!(login = %user.login, error = %e, "failed to delete unverified user"),
        }
    }

    info!(removed, "cleaned unverified accounts");
    Ok(removed)
}

/// Delete accounts not seen within `horizon`, along with their votes and
/// any token. Returns the number removed.
pub fn clean_inactive_users(db: &Db, horizon: Duration) -> Result<u64> {
    let cutoff = Utc::now() - horizon;
    let mut removed = 0u64;

    for user in db.users_not_seen_since(cutoff)? {
        match db.delete_user(&user.login) {
            Ok(true) => removed += 1,
            Ok(false) => warn!(login = %user.login, "inactive user vanished before deletion"),
            Err(e) => warn!(login = %user.login, error = %e, "failed to delete inactive user"),
        }
    }

    info!(removed, "cleaned inactive accounts");
    Ok(removed)
}

/// Dangling tokens indicate a bookkeeping bug somewhere; report them,
/// never auto-repair.
fn report_orphaned_tokens(db: &Db) {
    match db.orphaned_tokens() {
        Ok(tokens) => {
            for token in tokens {
                error!(login = %token.user_login, "token exists for a missing user");
            }
        }
        Err(e) => warn!(error = %e, "failed to check for orphaned tokens"),
    }
}
