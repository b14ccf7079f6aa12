//! Periodic reconciliation of the local issue mirror against the remote
//! source.
//!
//! Each run fetches open and closed issues modified since the watermark,
//! applies them to the local store, recomputes staleness over the open
//! set, and only then commits the new watermark. A transport failure
//! anywhere aborts the run without moving the watermark, so the next run
//! retries the same window. Individual record failures are logged and
//! skipped.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::db::Db;
use crate::model::{Issue, IssueKind};
use crate::tracker::{FetchState, IssueSource, RemoteIssue};

/// Counters from one sync run, for observability only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Issues seen for the first time.
    pub created: u64,
    /// Existing issues refreshed from the open fetch.
    pub updated: u64,
    /// Open-to-closed transitions.
    pub closed: u64,
    /// Open issues newly flagged stale.
    pub marked_stale: u64,
    /// Open issues whose stale flag was cleared.
    pub unmarked_stale: u64,
}

/// Reconciles the local mirror and owns the process-lifetime watermark.
pub struct SyncEngine {
    db: Arc<Db>,
    source: Arc<dyn IssueSource>,
    staleness_horizon: Duration,
    /// Start time of the last fully successful run. Not persisted; the
    /// first run after a restart fetches everything.
    watermark: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(db: Arc<Db>, source: Arc<dyn IssueSource>, staleness_horizon: Duration) -> Self {
        Self {
            db,
            source,
            staleness_horizon,
            watermark: Mutex::new(None),
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.lock().expect("mutex poisoned")
    }

    /// Run one reconciliation pass. When `since` is omitted the last
    /// watermark is used; on the very first run that means a full fetch.
    pub async fn synchronize(&self, since: Option<DateTime<Utc>>) -> Result<SyncOutcome> {
        let since = since.or_else(|| self.watermark());
        // Recorded before any network call; becomes the watermark only
        // if the whole run succeeds.
        let start = Utc::now();

        info!(?since, "updating issue mirror");
        let mut outcome = SyncOutcome::default();

        // The source returns unordered-by-page results; both sets are
        // collected in full before any record is applied.
        let open_set = self
            .source
            .fetch_issues(since, FetchState::Open)
            .await
            .context("Failed to fetch open issues")?;
        let closed_set = self
            .source
            .fetch_issues(since, FetchState::Closed)
            .await
            .context("Failed to fetch closed issues")?;

        for remote in &open_set {
            if let Err(e) = self.apply_open(remote, &mut outcome) {
                warn!(issue = remote.id, error = %e, "skipping issue record");
            }
        }
        for remote in &closed_set {
            if let Err(e) = self.apply_closed(remote, &mut outcome) {
                warn!(issue = remote.id, error = %e, "skipping issue record");
            }
        }

        self.recompute_staleness(start, &mut outcome)?;

        *self.watermark.lock().expect("mutex poisoned") = Some(start);
        info!(
            created = outcome.created,
            updated = outcome.updated,
            closed = outcome.closed,
            marked_stale = outcome.marked_stale,
            unmarked_stale = outcome.unmarked_stale,
            "issue mirror update finished"
        );
        Ok(outcome)
    }

    /// Apply a record from the open fetch. Existing issues get their
    /// mutable fields refreshed and are forced open (an issue seen open
    /// upstream was reopened if we had it closed); the open flag is
    /// never weakened here.
    fn apply_open(&self, remote: &RemoteIssue, outcome: &mut SyncOutcome) -> Result<()> {
        match self.db.get_issue(remote.id)? {
            Some(mut local) => {
                apply_mutable_fields(&mut local, remote);
                local.open = true;
                local.closed_at = None;
                self.db.update_issue(&local)?;
                outcome.updated += 1;
            }
            None => {
                let mut issue = new_issue(remote);
                issue.open = true;
                issue.closed_at = None;
                self.db.insert_issue(&issue)?;
                outcome.created += 1;
            }
        }
        Ok(())
    }

    /// Apply a record from the closed fetch. Only locally known issues
    /// are touched; the transition is counted once, on the run that
    /// first observes it. A closing issue is never stale.
    fn apply_closed(&self, remote: &RemoteIssue, outcome: &mut SyncOutcome) -> Result<()> {
        let Some(mut local) = self.db.get_issue(remote.id)? else {
            return Ok(());
        };
        let was_open = local.open;
        apply_mutable_fields(&mut local, remote);
        local.open = false;
        local.closed_at = remote.closed_at;
        local.stale = false;
        self.db.update_issue(&local)?;
        if was_open {
            outcome.closed += 1;
        }
        Ok(())
    }

    /// Full scan of the open set; acceptable because open issues are a
    /// small fraction of total traffic.
    fn recompute_staleness(&self, now: DateTime<Utc>, outcome: &mut SyncOutcome) -> Result<()> {
        let horizon = now - self.staleness_horizon;
        for issue in self.db.open_issues()? {
            let should_be_stale = issue.updated_at < horizon;
            if should_be_stale == issue.stale {
                continue;
            }
            if let Err(e) = self.db.set_stale(issue.id, should_be_stale) {
                warn!(issue = issue.id, error = %e, "skipping stale flag update");
                continue;
            }
            if should_be_stale {
                outcome.marked_stale += 1;
            } else {
                outcome.unmarked_stale += 1;
            }
        }
        Ok(())
    }
}

fn new_issue(remote: &RemoteIssue) -> Issue {
    Issue {
        id: remote.id,
        number: remote.number,
        title: remote.title.clone(),
        kind: if remote.is_pull_request {
            IssueKind::PullRequest
        } else {
            IssueKind::Issue
        },
        open: remote.is_open(),
        created_at: remote.created_at,
        closed_at: remote.closed_at,
        updated_at: remote.updated_at,
        score: 0,
        stale: false,
    }
}

fn apply_mutable_fields(local: &mut Issue, remote: &RemoteIssue) {
    local.number = remote.number;
    local.title = remote.title.clone();
    local.created_at = remote.created_at;
    local.updated_at = remote.updated_at;
}
