pub mod config;
pub mod db;
pub mod mailer;
pub mod model;
pub mod oauth;
pub mod retention;
pub mod scheduler;
pub mod smtp;
pub mod status;
pub mod sync;
pub mod tracker;

use std::sync::Arc;

pub use db::Db;
pub use mailer::MailQueue;
pub use scheduler::Scheduler;

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Shared state handed to the HTTP handlers.
pub struct AppState {
    pub db: Arc<Db>,
    pub scheduler: Arc<Scheduler>,
    pub mail_queue: Arc<MailQueue>,
    pub oauth: Arc<oauth::OAuthClient>,
    pub base_url: String,
}
