//! Client for the upstream issue tracker's paginated HTTP API.
//!
//! The source serves issue records filtered by state and modification
//! time: `GET {base}/issues?since=<ISO8601>&state=open|closed`. Pages
//! carry no ordering guarantee, so callers collect the full result set
//! before processing.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

/// Fixed identifying client header sent on every request.
pub const USER_AGENT: &str = concat!("trackervote/", env!("CARGO_PKG_VERSION"));

/// Page size requested from the source.
const PER_PAGE: u32 = 100;

/// Which subset of issues to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Open,
    Closed,
}

impl FetchState {
    fn as_query(&self) -> &'static str {
        match self {
            FetchState::Open => "open",
            FetchState::Closed => "closed",
        }
    }
}

/// An issue record as returned by the remote source.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteIssue {
    pub id: i64,
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub is_pull_request: bool,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RemoteIssue {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }
}

/// Seam between the sync engine and the remote source, so tests can
/// substitute a fake.
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Fetch all issues in `state` modified since `since` (everything
    /// when `since` is `None`), across all pages.
    async fn fetch_issues(
        &self,
        since: Option<DateTime<Utc>>,
        state: FetchState,
    ) -> Result<Vec<RemoteIssue>>;
}

/// HTTP client for a GitHub-style issues endpoint.
pub struct TrackerClient {
    client: Client,
    issues_url: String,
}

impl TrackerClient {
    /// `repo` is the `owner/name` pair of the mirrored repository.
    pub fn new(repo: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build tracker HTTP client")?;
        Ok(Self {
            client,
            issues_url: format!("https://api.github.com/repos/{}/issues", repo),
        })
    }

    /// Point the client at an arbitrary issues endpoint.
    pub fn with_base_url(url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build tracker HTTP client")?;
        Ok(Self {
            client,
            issues_url: url.to_string(),
        })
    }

    async fn fetch_page(
        &self,
        since: Option<DateTime<Utc>>,
        state: FetchState,
        page: u32,
    ) -> Result<Vec<RemoteIssue>> {
        let mut query: Vec<(&str, String)> = vec![
            ("state", state.as_query().to_string()),
            ("per_page", PER_PAGE.to_string()),
            ("page", page.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        let response = self
            .client
            .get(&self.issues_url)
            .query(&query)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send issue fetch request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(anyhow!(
                "Issue source returned {} for page {}: {}",
                status,
                page,
                error_text
            ));
        }

        response
            .json::<Vec<RemoteIssue>>()
            .await
            .context("Failed to parse issue page")
    }
}

#[async_trait]
impl IssueSource for TrackerClient {
    async fn fetch_issues(
        &self,
        since: Option<DateTime<Utc>>,
        state: FetchState,
    ) -> Result<Vec<RemoteIssue>> {
        let mut all = Vec::new();
        let mut page = 1;

        loop {
            let batch = self.fetch_page(since, state, page).await?;
            let len = batch.len();
            debug!(page, count = len, "fetched issue page");
            all.extend(batch);

            // A short page is the last one.
            if len < PER_PAGE as usize {
                break;
            }
            page += 1;
        }

        info!(
            state = state.as_query(),
            count = all.len(),
            "fetched issues from source"
        );
        Ok(all)
    }
}
