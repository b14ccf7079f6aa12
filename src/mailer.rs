//! In-process mail queue with at-least-once delivery and bounded
//! retries.
//!
//! Request-handling code enqueues; a single background worker pops one
//! item per fixed tick and hands it to the mail transport. A failed
//! attempt re-enqueues the item at the tail with one fewer attempt
//! remaining; when the budget is exhausted the item is dropped with an
//! error log. The queue is not persisted across restarts.
//!
//! The queue's lock is its own; it is deliberately distinct from the
//! scheduler's job lock so mail delivery never contends with sync or
//! cleanup runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Delivery attempts per item before it is dropped.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Seconds the worker sleeps between pop attempts, regardless of depth.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Synchronous-looking delivery seam; the SMTP implementation lives in
/// `smtp`, tests substitute fakes.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// One queued message. Immutable once built; a retry produces a new
/// item with a decremented budget rather than mutating in place.
#[derive(Debug, Clone)]
pub struct QueuedMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts_left: u32,
}

impl QueuedMail {
    fn retry(&self) -> Option<QueuedMail> {
        if self.attempts_left <= 1 {
            return None;
        }
        Some(QueuedMail {
            attempts_left: self.attempts_left - 1,
            ..self.clone()
        })
    }
}

/// Coarse worker state for the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    NotStarted,
    Sleeping,
    Executing,
    Aborting,
    Exited,
    Died,
}

/// Snapshot of the mailer for observability.
#[derive(Debug, Clone, Serialize)]
pub struct MailerStatus {
    pub state: WorkerState,
    pub depth: usize,
    pub sent: u64,
    pub errors: u64,
}

pub struct MailQueue {
    queue: Mutex<VecDeque<QueuedMail>>,
    state: Mutex<WorkerState>,
    retry_budget: u32,
    sent: AtomicU64,
    errors: AtomicU64,
}

impl MailQueue {
    pub fn new(retry_budget: u32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            state: Mutex::new(WorkerState::NotStarted),
            retry_budget,
            sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Append a message with the full retry budget. Returns the new
    /// queue depth.
    pub fn enqueue(&self, to: &str, subject: &str, body: &str) -> usize {
        debug!(to, "enqueuing mail");
        let mut queue = self.queue.lock().expect("mutex poisoned");
        queue.push_back(QueuedMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            enqueued_at: Utc::now(),
            attempts_left: self.retry_budget,
        });
        queue.len()
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().expect("mutex poisoned").len()
    }

    pub fn status(&self) -> MailerStatus {
        MailerStatus {
            state: *self.state.lock().expect("mutex poisoned"),
            depth: self.depth(),
            sent: self.sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().expect("mutex poisoned") = state;
    }

    /// Mark the worker dead after a panicked join. Observability only.
    pub fn mark_died(&self) {
        self.set_state(WorkerState::Died);
    }

    /// Pop one item and attempt delivery. Returns false when the queue
    /// was empty. The lock is released before the transport call.
    pub async fn deliver_next(&self, transport: &dyn MailTransport) -> bool {
        let mail = {
            let mut queue = self.queue.lock().expect("mutex poisoned");
            queue.pop_front()
        };
        let Some(mail) = mail else {
            return false;
        };

        info!(to = %mail.to, "sending mail");
        debug!(
            subject = %mail.subject,
            enqueued_at = %mail.enqueued_at,
            body_len = mail.body.len(),
            "mail details"
        );

        match transport.deliver(&mail.to, &mail.subject, &mail.body).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                info!(to = %mail.to, "mail sent");
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                error!(to = %mail.to, error = %e, "mail not sent");
                match mail.retry() {
                    Some(retry) => {
                        warn!(
                            to = %retry.to,
                            attempts_left = retry.attempts_left,
                            "will retry mail later"
                        );
                        let mut queue = self.queue.lock().expect("mutex poisoned");
                        queue.push_back(retry);
                    }
                    None => {
                        error!(to = %mail.to, "retry budget exhausted, dropping mail");
                    }
                }
            }
        }
        true
    }

    /// Worker loop: one pop attempt per fixed tick until shutdown.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn MailTransport>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("starting mailer worker");
        self.set_state(WorkerState::Sleeping);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A closed channel means the rest of the process is
                    // gone; stop too.
                    if changed.is_err() || *shutdown.borrow() {
                        self.set_state(WorkerState::Aborting);
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {
                    self.set_state(WorkerState::Executing);
                    self.deliver_next(transport.as_ref()).await;
                    self.set_state(WorkerState::Sleeping);
                }
            }
        }

        info!("mailer worker exiting");
        self.set_state(WorkerState::Exited);
    }
}

/// Spawn the worker and a supervisor that records a panicked worker as
/// `Died` in the status.
pub fn spawn_worker(
    queue: Arc<MailQueue>,
    transport: Arc<dyn MailTransport>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let worker = tokio::spawn(queue.clone().run(transport, poll_interval, shutdown));
        if let Err(e) = worker.await {
            error!(error = %e, "mailer worker terminated abnormally");
            queue.mark_died();
        }
    })
}

/// Transport used when no SMTP relay is configured: logs the mail and
/// discards it, so sign-up flows still work in development.
pub struct LogOnlyTransport;

#[async_trait]
impl MailTransport for LogOnlyTransport {
    async fn deliver(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        info!(to, subject, %body, "SMTP not configured, discarding mail");
        Ok(())
    }
}

// --- templates ---

/// Substitute `{name}` bindings into a template. Unknown placeholders
/// are left as-is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

/// Subject and body for an account-verification mail.
pub fn verification_mail(login: &str, link: &str) -> (String, String) {
    const TEMPLATE: &str = include_str!("templates/verify_email.txt");
    (
        "Please verify your account".to_string(),
        render(TEMPLATE, &[("login", login), ("link", link)]),
    )
}

/// Subject and body for a password-reset mail.
pub fn password_reset_mail(login: &str, link: &str) -> (String, String) {
    const TEMPLATE: &str = include_str!("templates/reset_password.txt");
    (
        "Password reset requested".to_string(),
        render(TEMPLATE, &[("login", login), ("link", link)]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    /// Transport that records deliveries and fails for chosen
    /// recipients.
    #[derive(Default)]
    struct FakeTransport {
        delivered: Mutex<Vec<String>>,
        fail_for: Option<String>,
    }

    impl FakeTransport {
        fn failing_for(to: &str) -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail_for: Some(to.to_string()),
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailTransport for FakeTransport {
        async fn deliver(&self, to: &str, _subject: &str, _body: &str) -> Result<()> {
            if self.fail_for.as_deref() == Some(to) {
                return Err(anyhow!("connection refused"));
            }
            self.delivered.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_enqueue_returns_depth() {
        let queue = MailQueue::new(DEFAULT_RETRY_BUDGET);
        assert_eq!(queue.enqueue("a@example.com", "s", "b"), 1);
        assert_eq!(queue.enqueue("b@example.com", "s", "b"), 2);
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.status().state, WorkerState::NotStarted);
    }

    #[tokio::test]
    async fn test_delivery_and_counters() {
        let queue = MailQueue::new(DEFAULT_RETRY_BUDGET);
        let transport = FakeTransport::default();
        queue.enqueue("a@example.com", "s", "b");

        assert!(queue.deliver_next(&transport).await);
        assert!(!queue.deliver_next(&transport).await);

        let status = queue.status();
        assert_eq!(status.sent, 1);
        assert_eq!(status.errors, 0);
        assert_eq!(status.depth, 0);
        assert_eq!(transport.delivered(), vec!["a@example.com"]);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_drops_item_but_not_others() {
        let queue = MailQueue::new(3);
        let transport = FakeTransport::failing_for("doomed@example.com");
        queue.enqueue("doomed@example.com", "s", "b");
        queue.enqueue("first@example.com", "s", "b");
        queue.enqueue("second@example.com", "s", "b");

        // Drain until empty; the doomed item cycles through the tail
        // until its three attempts are spent.
        while queue.deliver_next(&transport).await {}

        let status = queue.status();
        assert_eq!(status.depth, 0);
        assert_eq!(status.sent, 2);
        assert_eq!(status.errors, 3);
        // Later items still delivered, in order.
        assert_eq!(
            transport.delivered(),
            vec!["first@example.com", "second@example.com"]
        );
    }

    #[tokio::test]
    async fn test_retry_preserves_message_content() {
        let queue = MailQueue::new(2);
        let transport = FakeTransport::failing_for("x@example.com");
        queue.enqueue("x@example.com", "subject", "body");

        assert!(queue.deliver_next(&transport).await);
        // Requeued with one attempt left, content intact.
        let requeued = queue.queue.lock().unwrap().front().cloned().unwrap();
        assert_eq!(requeued.attempts_left, 1);
        assert_eq!(requeued.subject, "subject");
        assert_eq!(requeued.body, "body");
    }

    #[tokio::test]
    async fn test_worker_loop_and_shutdown() {
        let queue = Arc::new(MailQueue::new(DEFAULT_RETRY_BUDGET));
        let transport: Arc<dyn MailTransport> = Arc::new(FakeTransport::default());
        let (tx, rx) = watch::channel(false);
        queue.enqueue("a@example.com", "s", "b");

        let handle = spawn_worker(
            queue.clone(),
            transport,
            Duration::from_millis(5),
            rx,
        );

        // Give the worker a few ticks to drain the queue.
        for _ in 0..100 {
            if queue.status().sent == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.status().sent, 1);
        assert_eq!(queue.status().state, WorkerState::Sleeping);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(queue.status().state, WorkerState::Exited);
    }

    #[test]
    fn test_render_substitutes_bindings() {
        let out = render("hi {login}, go to {link}", &[("login", "alice"), ("link", "x")]);
        assert_eq!(out, "hi alice, go to x");
        // Unknown placeholders survive untouched.
        assert_eq!(render("{mystery}", &[]), "{mystery}");
    }

    #[test]
    fn test_builtin_templates() {
        let (subject, body) = verification_mail("alice", "https://example.com/v/abc");
        assert!(subject.contains("verify"));
        assert!(body.contains("alice"));
        assert!(body.contains("https://example.com/v/abc"));
        assert!(!body.contains("{login}"));

        let (subject, body) = password_reset_mail("bob", "https://example.com/r/def");
        assert!(subject.to_lowercase().contains("password"));
        assert!(body.contains("bob"));
        assert!(!body.contains("{link}"));
    }
}
