use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::oauth::ProviderCredentials;

#[derive(Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Remote repository to mirror, as `owner/name`.
    pub tracker_repo: String,
    pub port: u16,
    /// Public base URL used when building links in outgoing mail.
    pub base_url: String,

    pub sync_interval: Duration,
    pub issue_cleanup_interval: Duration,
    pub unverified_cleanup_interval: Duration,
    pub inactive_cleanup_interval: Duration,

    /// Open issues untouched for longer than this are marked stale.
    pub stale_after: Duration,
    /// Closed issues kept around after cleanup.
    pub issue_keep_count: u32,
    /// Unverified accounts older than this are removed.
    pub unverified_max_age: Duration,
    /// Verified accounts unseen for longer than this are removed.
    pub inactive_max_age: Duration,

    pub mail_poll_interval: Duration,
    pub mail_retry_budget: u32,
    /// SMTP relay settings; mail delivery is disabled when absent.
    pub smtp: Option<SmtpConfig>,

    pub github_oauth: Option<ProviderCredentials>,
    pub google_oauth: Option<ProviderCredentials>,
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

fn duration_var(name: &str, default_secs: u64) -> Result<Duration> {
    let secs = match env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .with_context(|| format!("{name} must be a valid number of seconds"))?,
        Err(_) => default_secs,
    };
    Ok(Duration::from_secs(secs))
}

fn oauth_vars(prefix: &str, base_url: &str, provider: &str) -> Option<ProviderCredentials> {
    let client_id = env::var(format!("{prefix}_CLIENT_ID")).ok()?;
    let client_secret = env::var(format!("{prefix}_CLIENT_SECRET")).ok()?;
    Some(ProviderCredentials {
        client_id,
        client_secret,
        redirect_url: format!("{base_url}/oauth/{provider}/callback"),
    })
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("trackervote.db"));

        let tracker_repo =
            env::var("TRACKER_REPO").unwrap_or_else(|_| "CleverRaven/Cataclysm-DDA".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let base_url =
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://localhost:{port}"));

        let sync_interval = duration_var("SYNC_INTERVAL_SECS", 3600)?;
        let issue_cleanup_interval = duration_var("ISSUE_CLEANUP_INTERVAL_SECS", 604_800)?;
        let unverified_cleanup_interval = duration_var("UNVERIFIED_CLEANUP_INTERVAL_SECS", 86_400)?;
        let inactive_cleanup_interval = duration_var("INACTIVE_CLEANUP_INTERVAL_SECS", 86_400)?;

        let stale_after = duration_var("STALE_AFTER_SECS", 604_800)?;
        let issue_keep_count = env::var("ISSUE_KEEP_COUNT")
            .unwrap_or_else(|_| "100".to_string())
            .parse::<u32>()
            .context("ISSUE_KEEP_COUNT must be a valid number")?;
        let unverified_max_age = duration_var("UNVERIFIED_MAX_AGE_SECS", 172_800)?;
        let inactive_max_age = duration_var("INACTIVE_MAX_AGE_SECS", 15_552_000)?;

        let mail_poll_interval = duration_var("MAIL_POLL_INTERVAL_SECS", 10)?;
        let mail_retry_budget = env::var("MAIL_RETRY_BUDGET")
            .unwrap_or_else(|_| "3".to_string())
            .parse::<u32>()
            .context("MAIL_RETRY_BUDGET must be a valid number")?;

        let smtp = match env::var("SMTP_HOST") {
            Ok(host) => {
                let smtp_port = env::var("SMTP_PORT")
                    .unwrap_or_else(|_| "587".to_string())
                    .parse::<u16>()
                    .context("SMTP_PORT must be a valid number")?;
                Some(SmtpConfig {
                    host,
                    port: smtp_port,
                    username: env::var("SMTP_USERNAME")
                        .context("SMTP_USERNAME is required when SMTP_HOST is set")?,
                    password: env::var("SMTP_PASSWORD")
                        .context("SMTP_PASSWORD is required when SMTP_HOST is set")?,
                    from: env::var("SMTP_FROM")
                        .context("SMTP_FROM is required when SMTP_HOST is set")?,
                })
            }
            Err(_) => None,
        };

        let github_oauth = oauth_vars("GITHUB_OAUTH", &base_url, "github");
        let google_oauth = oauth_vars("GOOGLE_OAUTH", &base_url, "google");

        Ok(Config {
            database_path,
            tracker_repo,
            port,
            base_url,
            sync_interval,
            issue_cleanup_interval,
            unverified_cleanup_interval,
            inactive_cleanup_interval,
            stale_after,
            issue_keep_count,
            unverified_max_age,
            inactive_max_age,
            mail_poll_interval,
            mail_retry_budget,
            smtp,
            github_oauth,
            google_oauth,
        })
    }
}
