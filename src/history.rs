use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// One file's outcome inside a session. `status` is "success" or "failed".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub file_path: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gallery_id: Option<String>,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub file_size: u64,
}

impl UploadRecord {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// One upload batch, persisted as a JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub destination: String,
    pub total_files: usize,
    pub successful: usize,
    pub failed: usize,
    /// "running", "completed" or "interrupted".
    pub status: String,
    pub records: Vec<UploadRecord>,
}

impl UploadSession {
    pub fn failed_files(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.file_path.clone())
            .collect()
    }
}

/// Aggregate numbers across all stored sessions.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStatistics {
    pub session_count: usize,
    pub total_uploads: usize,
    pub successful_uploads: usize,
    pub failed_uploads: usize,
    pub total_bytes: u64,
}

/// JSON-file-per-session store under a history directory.
pub struct SessionHistory {
    dir: PathBuf,
}

impl SessionHistory {
    pub fn new(dir: &Path) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Open a store in the default data directory.
    pub fn open_default() -> AppResult<Self> {
        Self::new(&crate::config::get_history_directory()?)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("session_{}.json", session_id))
    }

    /// Begin a new session. The id doubles as a sortable timestamp.
    pub fn start_session(&self, destination: &str, total_files: usize) -> AppResult<UploadSession> {
        let session = UploadSession {
            session_id: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            start_time: Utc::now(),
            end_time: None,
            destination: destination.to_string(),
            total_files,
            successful: 0,
            failed: 0,
            status: "running".to_string(),
            records: Vec::new(),
        };
        self.save(&session)?;
        log::info!(
            "Started upload session {} ({} file(s) to {})",
            session.session_id,
            total_files,
            destination
        );
        Ok(session)
    }

    pub fn add_record(&self, session: &mut UploadSession, record: UploadRecord) -> AppResult<()> {
        if record.is_success() {
            session.successful += 1;
        } else {
            session.failed += 1;
        }
        session.records.push(record);
        self.save(session)
    }

    pub fn end_session(&self, session: &mut UploadSession, status: &str) -> AppResult<()> {
        session.end_time = Some(Utc::now());
        session.status = status.to_string();
        self.save(session)?;
        log::info!(
            "Session {} ended ({}): {}/{} succeeded",
            session.session_id,
            status,
            session.successful,
            session.total_files
        );
        Ok(())
    }

    pub fn save(&self, session: &UploadSession) -> AppResult<()> {
        let path = self.session_path(&session.session_id);
        let json = serde_json::to_string_pretty(session)?;
        fs::write(&path, json)?;
        Ok(())
    }

    pub fn load_session(&self, session_id: &str) -> AppResult<UploadSession> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Err(AppError::file_not_found(&path.display().to_string()));
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Failed file paths from one stored session, for resuming.
    pub fn failed_files(&self, session_id: &str) -> AppResult<Vec<String>> {
        Ok(self.load_session(session_id)?.failed_files())
    }

    /// Stored sessions, newest first, optionally capped. Unreadable files
    /// are skipped with a warning.
    pub fn list_sessions(&self, limit: Option<usize>) -> AppResult<Vec<UploadSession>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_session = path
                .file_name()
                .map(|n| {
                    let name = n.to_string_lossy();
                    name.starts_with("session_") && name.ends_with(".json")
                })
                .unwrap_or(false);
            if !is_session {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(AppError::from)
                .and_then(|json| Ok(serde_json::from_str::<UploadSession>(&json)?))
            {
                Ok(session) => sessions.push(session),
                Err(e) => log::warn!("Skipping unreadable session file {}: {}", path.display(), e),
            }
        }
        sessions.sort_by(|a, b| b.session_id.cmp(&a.session_id));
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    pub fn statistics(&self) -> AppResult<HistoryStatistics> {
        let mut stats = HistoryStatistics::default();
        for session in self.list_sessions(None)? {
            stats.session_count += 1;
            for record in &session.records {
                stats.total_uploads += 1;
                if record.is_success() {
                    stats.successful_uploads += 1;
                    stats.total_bytes += record.file_size;
                } else {
                    stats.failed_uploads += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Delete sessions that started more than `days` ago. Returns how
    /// many were removed.
    pub fn cleanup_old_sessions(&self, days: u32) -> AppResult<usize> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let mut removed = 0;
        for session in self.list_sessions(None)? {
            if session.start_time < cutoff {
                let path = self.session_path(&session.session_id);
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("Failed to remove old session {}: {}", path.display(), e);
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            log::info!("Removed {} old upload session(s)", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, success: bool) -> UploadRecord {
        UploadRecord {
            file_path: path.to_string(),
            destination: "Pixhost".to_string(),
            image_url: success.then(|| format!("https://img.test/{}", path)),
            thumbnail_url: success.then(|| format!("https://img.test/t/{}", path)),
            gallery_id: None,
            status: if success { "success" } else { "failed" }.to_string(),
            timestamp: Utc::now(),
            error_message: (!success).then(|| "boom".to_string()),
            file_size: 1024,
        }
    }

    #[test]
    fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let history = SessionHistory::new(dir.path()).unwrap();

        let mut session = history.start_session("Pixhost", 2).unwrap();
        history.add_record(&mut session, record("a.png", true)).unwrap();
        history.add_record(&mut session, record("b.png", false)).unwrap();
        history.end_session(&mut session, "completed").unwrap();

        let loaded = history.load_session(&session.session_id).unwrap();
        assert_eq!(loaded.destination, "Pixhost");
        assert_eq!(loaded.status, "completed");
        assert_eq!(loaded.total_files, 2);
        assert_eq!(loaded.successful, 1);
        assert_eq!(loaded.failed, 1);
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.failed_files(), vec!["b.png"]);
        assert!(loaded.end_time.is_some());
    }

    #[test]
    fn test_json_uses_pinned_keys() {
        let dir = tempfile::tempdir().unwrap();
        let history = SessionHistory::new(dir.path()).unwrap();

        let mut session = history.start_session("Catbox", 1).unwrap();
        history.add_record(&mut session, record("a.png", true)).unwrap();

        let raw = fs::read_to_string(
            dir.path().join(format!("session_{}.json", session.session_id)),
        )
        .unwrap();
        for key in [
            "\"sessionId\"",
            "\"startTime\"",
            "\"destination\"",
            "\"totalFiles\"",
            "\"successful\"",
            "\"failed\"",
            "\"status\"",
            "\"filePath\"",
            "\"imageUrl\"",
            "\"thumbnailUrl\"",
            "\"fileSize\"",
        ] {
            assert!(raw.contains(key), "missing key {}", key);
        }
    }

    #[test]
    fn test_statistics_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let history = SessionHistory::new(dir.path()).unwrap();

        let mut first = history.start_session("Imgur", 1).unwrap();
        history.add_record(&mut first, record("a.png", true)).unwrap();
        history.end_session(&mut first, "completed").unwrap();

        // Unrelated files are ignored by the scan
        fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        let stats = history.statistics().unwrap();
        assert_eq!(stats.session_count, 1);
        assert_eq!(stats.total_uploads, 1);
        assert_eq!(stats.successful_uploads, 1);
        assert_eq!(stats.total_bytes, 1024);

        assert_eq!(history.list_sessions(Some(0)).unwrap().len(), 0);
    }

    #[test]
    fn test_cleanup_removes_only_old_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let history = SessionHistory::new(dir.path()).unwrap();

        let mut old = history.start_session("Catbox", 0).unwrap();
        let stale_path = dir.path().join(format!("session_{}.json", old.session_id));
        fs::remove_file(stale_path).unwrap();
        old.session_id = "20200101_000000".to_string();
        old.start_time = Utc::now() - Duration::days(400);
        history.save(&old).unwrap();

        let recent = history.start_session("Catbox", 0).unwrap();

        let removed = history.cleanup_old_sessions(90).unwrap();
        assert_eq!(removed, 1);
        assert!(history.load_session(&recent.session_id).is_ok());
        assert!(history.load_session("20200101_000000").is_err());
    }
}
