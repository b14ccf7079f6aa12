//! Status types for the status endpoint.

use serde::Serialize;

use crate::mailer::MailerStatus;
use crate::scheduler::{JobState, JobStatus};

/// A job entry for display, with timestamps already formatted.
#[derive(Debug, Serialize)]
pub struct JobStatusEntry {
    pub name: &'static str,
    pub state: JobState,
    pub last_run: String,
    pub next_run: String,
}

/// Full status data for serving.
#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub jobs: Vec<JobStatusEntry>,
    pub mailer: MailerStatus,
}

impl StatusData {
    pub fn new(version: String, jobs: Vec<JobStatus>, mailer: MailerStatus) -> Self {
        let jobs = jobs
            .into_iter()
            .map(|j| JobStatusEntry {
                name: j.name,
                state: j.state,
                last_run: format_instant(j.last_run),
                next_run: format_instant(j.next_run),
            })
            .collect();
        Self {
            version,
            jobs,
            mailer,
        }
    }
}

fn format_instant(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    match t {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "never".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::WorkerState;
    use chrono::TimeZone;

    #[test]
    fn test_absent_timestamps_render_as_never() {
        let jobs = vec![JobStatus {
            name: "sync",
            state: JobState::NotStarted,
            last_run: None,
            next_run: None,
        }];
        let mailer = MailerStatus {
            state: WorkerState::NotStarted,
            depth: 0,
            sent: 0,
            errors: 0,
        };
        let data = StatusData::new("test".to_string(), jobs, mailer);
        assert_eq!(data.jobs[0].last_run, "never");
        assert_eq!(data.jobs[0].next_run, "never");
    }

    #[test]
    fn test_timestamps_format_utc() {
        let t = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(format_instant(Some(t)), "2024-05-01 12:30:00 UTC");
    }

    #[test]
    fn test_serializes_to_json() {
        let mailer = MailerStatus {
            state: WorkerState::Sleeping,
            depth: 2,
            sent: 5,
            errors: 1,
        };
        let data = StatusData::new("1.2.3".to_string(), Vec::new(), mailer);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["version"], "1.2.3");
        assert_eq!(json["mailer"]["depth"], 2);
        assert_eq!(json["mailer"]["state"], "Sleeping");
    }
}
