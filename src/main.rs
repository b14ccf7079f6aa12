use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};

use trackervote::config::Config;
use trackervote::mailer::{self, LogOnlyTransport, MailTransport};
use trackervote::oauth::{OAuthClient, Provider};
use trackervote::retention;
use trackervote::smtp::SmtpMailer;
use trackervote::status::StatusData;
use trackervote::sync::SyncEngine;
use trackervote::tracker::TrackerClient;
use trackervote::{AppState, Db, MailQueue, Scheduler};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "trackervote"
    })))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusData> {
    Json(StatusData::new(
        trackervote::get_version(),
        state.scheduler.status(),
        state.mail_queue.status(),
    ))
}

fn job_period(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting tracker vote server");

    let config = Config::from_env().context("failed to load configuration")?;

    info!("Using database: {}", config.database_path.display());
    let db = Arc::new(Db::open(&config.database_path).context("failed to open database")?);

    let tracker = Arc::new(
        TrackerClient::new(&config.tracker_repo).context("failed to build tracker client")?,
    );
    let sync_engine = Arc::new(SyncEngine::new(
        db.clone(),
        tracker,
        job_period(config.stale_after),
    ));

    let mail_queue = Arc::new(MailQueue::new(config.mail_retry_budget));
    let transport: Arc<dyn MailTransport> = match &config.smtp {
        Some(smtp) => Arc::new(
            SmtpMailer::new(&smtp.host, smtp.port, &smtp.username, &smtp.password, &smtp.from)
                .context("failed to configure SMTP transport")?,
        ),
        None => {
            info!("SMTP_HOST not set, outgoing mail will be logged and discarded");
            Arc::new(LogOnlyTransport)
        }
    };

    let oauth = Arc::new(
        OAuthClient::new(config.github_oauth.clone(), config.google_oauth.clone())
            .context("failed to build OAuth client")?,
    );
    for provider in [Provider::GitHub, Provider::Google] {
        if oauth.is_enabled(provider) {
            info!(provider = provider.as_str(), "OAuth sign-in enabled");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mailer_handle = mailer::spawn_worker(
        mail_queue.clone(),
        transport,
        config.mail_poll_interval,
        shutdown_rx.clone(),
    );

    let mut scheduler = Scheduler::new();
    {
        let sync_engine = sync_engine.clone();
        scheduler.add_job("sync_tracker", config.sync_interval, move || {
            let sync_engine = sync_engine.clone();
            async move {
                let outcome = sync_engine.synchronize(None).await?;
                info!(
                    created = outcome.created,
                    updated = outcome.updated,
                    closed = outcome.closed,
                    marked_stale = outcome.marked_stale,
                    "sync finished"
                );
                Ok(())
            }
        });
    }
    {
        let db = db.clone();
        let keep = config.issue_keep_count;
        scheduler.add_job("clean_issues", config.issue_cleanup_interval, move || {
            let db = db.clone();
            async move {
                let removed = retention::clean_issues(&db, keep)?;
                info!(removed, "issue cleanup finished");
                Ok(())
            }
        });
    }
    {
        let db = db.clone();
        let max_age = job_period(config.unverified_max_age);
        scheduler.add_job(
            "clean_unverified_users",
            config.unverified_cleanup_interval,
            move || {
                let db = db.clone();
                async move {
                    let removed = retention::clean_unverified_users(&db, max_age)?;
                    info!(removed, "unverified-user cleanup finished");
                    Ok(())
                }
            },
        );
    }
    {
        let db = db.clone();
        let horizon = job_period(config.inactive_max_age);
        scheduler.add_job(
            "clean_inactive_users",
            config.inactive_cleanup_interval,
            move || {
                let db = db.clone();
                async move {
                    let removed = retention::clean_inactive_users(&db, horizon)?;
                    info!(removed, "inactive-user cleanup finished");
                    Ok(())
                }
            },
        );
    }

    let scheduler = Arc::new(scheduler);
    let job_handles = scheduler.start(shutdown_rx);

    let app_state = Arc::new(AppState {
        db,
        scheduler,
        mail_queue,
        oauth,
        base_url: config.base_url.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await?;

    // Stop the background workers and wait for them to drain.
    let _ = shutdown_tx.send(true);
    for handle in job_handles {
        if let Err(e) = handle.await {
            error!(error = %e, "job task terminated abnormally");
        }
    }
    if let Err(e) = mailer_handle.await {
        error!(error = %e, "mailer task terminated abnormally");
    }

    Ok(())
}
