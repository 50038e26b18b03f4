use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one file inside a batch.
///
/// Pending -> Queued -> Uploading -> Success | Failed. Only a Failed task
/// may return to Pending, via an explicit retry request. A task cancelled
/// before it started stays Queued while the batch winds down, then reverts
/// to Pending so the next batch picks it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Queued,
    Uploading,
    Success,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed)
    }
}

/// One file scheduled for upload.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub path: PathBuf,
    pub group_id: Uuid,
    pub state: TaskState,
    pub attempts: u32,
    pub progress: f32,
    pub image_url: Option<String>,
    pub thumb_url: Option<String>,
    pub error: Option<String>,
}

impl FileTask {
    pub fn new(path: PathBuf, group_id: Uuid) -> Self {
        Self {
            path,
            group_id,
            state: TaskState::Pending,
            attempts: 0,
            progress: 0.0,
            image_url: None,
            thumb_url: None,
            error: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// A set of files that share a gallery and an output document.
#[derive(Debug, Clone)]
pub struct FileGroup {
    pub id: Uuid,
    pub title: String,
    pub files: Vec<PathBuf>,
}

impl FileGroup {
    pub fn new(title: &str, files: Vec<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            files,
        }
    }
}

/// Successful upload result for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub path: PathBuf,
    pub image_url: String,
    pub thumb_url: String,
}

/// Per-batch knobs the caller picks before starting.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub destination: String,
    pub concurrency_limit: usize,
    pub auto_gallery: bool,
    /// Upload the first file of each group as the gallery cover, for
    /// destinations with a dedicated cover endpoint.
    pub first_file_is_cover: bool,
    /// Destination-specific options merged into the backend config.
    pub upload_options: HashMap<String, serde_json::Value>,
}

impl BatchSettings {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            concurrency_limit: 3,
            auto_gallery: true,
            first_file_is_cover: false,
            upload_options: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Uploading.is_terminal());
    }

    #[test]
    fn test_new_task_starts_pending() {
        let group = FileGroup::new("Holiday", vec![PathBuf::from("a.png")]);
        let task = FileTask::new(PathBuf::from("a.png"), group.id);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.file_name(), "a.png");
    }
}
