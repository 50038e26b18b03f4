use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// How prominently a notification should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A user-facing notification derived from an engine error or event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNotification {
    pub title: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub details: Option<String>,
    pub show_details_button: bool,
    pub timestamp: DateTime<Utc>,
}

impl UserNotification {
    pub fn new(title: &str, message: &str, severity: ErrorSeverity) -> Self {
        Self {
            title: title.to_string(),
            message: message.to_string(),
            severity,
            details: None,
            show_details_button: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.show_details_button = !details.is_empty();
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Default)]
struct ReporterState {
    queue: VecDeque<UserNotification>,
    error_count: u64,
    warning_count: u64,
}

/// Collects notifications for the UI layer to drain.
///
/// The engine pushes at most one warning per task for retry churn and
/// exactly one error per terminal failure, so the queue stays readable
/// even for large batches.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    state: Mutex<ReporterState>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, notification: UserNotification) {
        let mut state = self.state.lock().unwrap();
        match notification.severity {
            ErrorSeverity::Error | ErrorSeverity::Critical => state.error_count += 1,
            ErrorSeverity::Warning => state.warning_count += 1,
            ErrorSeverity::Info => {}
        }
        state.queue.push_back(notification);
    }

    /// Report a terminal upload failure for one file.
    pub fn report_failure(&self, file_name: &str, error: &AppError) {
        log::error!("Upload failed for {}: {}", file_name, error);
        self.notify(
            UserNotification::new(
                "Upload failed",
                &format!("{} could not be uploaded", file_name),
                ErrorSeverity::Error,
            )
            .with_details(error.to_string()),
        );
    }

    /// Report that a file is being retried after a transient failure.
    pub fn report_retry(&self, file_name: &str, attempt: u32, max_attempts: u32, error: &AppError) {
        log::warn!(
            "Retrying {} (attempt {}/{}): {}",
            file_name,
            attempt,
            max_attempts,
            error
        );
        self.notify(
            UserNotification::new(
                "Retrying upload",
                &format!("{} failed, retrying ({}/{})", file_name, attempt, max_attempts),
                ErrorSeverity::Warning,
            )
            .with_details(error.to_string()),
        );
    }

    pub fn drain(&self) -> Vec<UserNotification> {
        let mut state = self.state.lock().unwrap();
        state.queue.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Cumulative (error, warning) counts since construction.
    pub fn counts(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.error_count, state.warning_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_empties_queue_but_keeps_counts() {
        let reporter = ErrorReporter::new();
        reporter.report_failure("a.png", &AppError::upload_failed("boom"));
        reporter.report_retry("b.png", 1, 3, &AppError::upload_failed("timeout"));

        let drained = reporter.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(reporter.pending_count(), 0);
        assert_eq!(reporter.counts(), (1, 1));
    }

    #[test]
    fn test_failure_notification_has_details() {
        let reporter = ErrorReporter::new();
        reporter.report_failure("shot.jpg", &AppError::upload_failed("server exploded"));

        let drained = reporter.drain();
        assert_eq!(drained[0].severity, ErrorSeverity::Error);
        assert!(drained[0].show_details_button);
        assert!(drained[0].details.as_ref().unwrap().contains("server exploded"));
    }
}
