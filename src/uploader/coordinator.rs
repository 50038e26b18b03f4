use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::backend::contract::{Credentials, GalleryHandle};
use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::errors::AppResult;
use crate::history::{SessionHistory, UploadRecord, UploadSession};
use crate::output::{self, GroupOutputContext, OutputRenderer};
use crate::reporting::ErrorReporter;
use crate::uploader::engine::{BatchHandle, EngineEvent, UploadEngine};
use crate::uploader::retry::RetryPolicy;
use crate::uploader::types::{BatchSettings, FileGroup, FileTask, TaskState, UploadOutcome};

/// Callbacks for a UI layer. All methods default to no-ops so headless
/// callers can pass `()`.
pub trait BatchEvents: Send + Sync {
    fn on_batch_start(&self) {}
    fn on_batch_finish(&self) {}
    fn on_progress(&self, _completed: usize, _total: usize) {}
    fn on_status_text(&self, _text: &str) {}
}

impl BatchEvents for () {}

impl<T: BatchEvents + ?Sized> BatchEvents for Arc<T> {
    fn on_batch_start(&self) {
        (**self).on_batch_start()
    }

    fn on_batch_finish(&self) {
        (**self).on_batch_finish()
    }

    fn on_progress(&self, completed: usize, total: usize) {
        (**self).on_progress(completed, total)
    }

    fn on_status_text(&self, text: &str) {
        (**self).on_status_text(text)
    }
}

/// Orchestrates batches: owns the task table, drives the engine, records
/// history, and produces per-group output documents.
pub struct UploadCoordinator {
    registry: Arc<BackendRegistry>,
    engine: UploadEngine,
    history: SessionHistory,
    events: Box<dyn BatchEvents>,

    groups: Vec<FileGroup>,
    tasks: HashMap<PathBuf, FileTask>,
    galleries: HashMap<Uuid, GalleryHandle>,
    session: Option<UploadSession>,
    settings: Option<BatchSettings>,
    credentials: Credentials,
    handle: Option<BatchHandle>,
    total: usize,
    completed: usize,
    uploading: bool,
    finish_emitted: bool,
}

impl UploadCoordinator {
    pub fn new(
        registry: Arc<BackendRegistry>,
        policy: RetryPolicy,
        reporter: Arc<ErrorReporter>,
        history: SessionHistory,
        events: Box<dyn BatchEvents>,
    ) -> Self {
        let engine = UploadEngine::new(Arc::clone(&registry), policy, reporter);
        Self {
            registry,
            engine,
            history,
            events,
            groups: Vec::new(),
            tasks: HashMap::new(),
            galleries: HashMap::new(),
            session: None,
            settings: None,
            credentials: Credentials::new(),
            handle: None,
            total: 0,
            completed: 0,
            uploading: false,
            finish_emitted: false,
        }
    }

    /// Build a coordinator from a saved [`Config`]: registry with the
    /// configured plugin directory, retry policy from the config's delays,
    /// history in the default data directory with old sessions pruned.
    pub fn from_config(config: &Config, events: Box<dyn BatchEvents>) -> AppResult<Self> {
        let registry = Arc::new(BackendRegistry::new(config.plugin_dir.as_deref()));
        let history = SessionHistory::open_default()?;
        if let Err(e) = history.cleanup_old_sessions(config.history_retention_days) {
            log::warn!("History cleanup failed: {}", e);
        }
        Ok(Self::new(
            registry,
            RetryPolicy::from(config),
            Arc::new(ErrorReporter::new()),
            history,
            events,
        ))
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Queue a group of files. Paths already known keep their task state.
    pub fn add_group(&mut self, title: &str, files: Vec<PathBuf>) -> Uuid {
        let group = FileGroup::new(title, files);
        for path in &group.files {
            self.tasks
                .entry(path.clone())
                .or_insert_with(|| FileTask::new(path.clone(), group.id));
        }
        let id = group.id;
        self.groups.push(group);
        id
    }

    pub fn task(&self, path: &Path) -> Option<&FileTask> {
        self.tasks.get(path)
    }

    pub fn groups(&self) -> &[FileGroup] {
        &self.groups
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.completed, self.total)
    }

    /// Groups reduced to their files still awaiting upload. Calling this
    /// repeatedly is harmless.
    pub fn filter_pending(&self) -> Vec<FileGroup> {
        self.groups
            .iter()
            .filter_map(|group| {
                let files: Vec<PathBuf> = group
                    .files
                    .iter()
                    .filter(|path| {
                        self.tasks
                            .get(*path)
                            .map(|t| t.state == TaskState::Pending)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                if files.is_empty() {
                    None
                } else {
                    Some(FileGroup {
                        id: group.id,
                        title: group.title.clone(),
                        files,
                    })
                }
            })
            .collect()
    }

    /// Start uploading everything still pending. Returns `false` without
    /// side effects when a batch is running or nothing is pending.
    pub fn start_batch(
        &mut self,
        settings: BatchSettings,
        credentials: Credentials,
    ) -> AppResult<bool> {
        if self.uploading {
            log::warn!("Batch already running, ignoring start request");
            return Ok(false);
        }

        let pending = self.filter_pending();
        if pending.is_empty() {
            log::info!("Nothing pending to upload");
            return Ok(false);
        }

        let total: usize = pending.iter().map(|g| g.files.len()).sum();
        let session = self.history.start_session(&settings.destination, total)?;
        let handle = self
            .engine
            .start(pending.clone(), settings.clone(), credentials.clone())?;

        self.total = total;
        self.completed = 0;
        self.finish_emitted = false;
        for group in &pending {
            for path in &group.files {
                if let Some(task) = self.tasks.get_mut(path) {
                    task.state = TaskState::Queued;
                    task.progress = 0.0;
                    task.error = None;
                }
            }
        }

        self.session = Some(session);
        self.settings = Some(settings);
        self.credentials = credentials;
        self.handle = Some(handle);
        self.uploading = true;
        self.events.on_batch_start();
        self.events.on_progress(0, self.total);
        Ok(true)
    }

    /// Request cancellation of the running batch. Idempotent.
    pub fn stop_upload(&self) {
        if let Some(handle) = &self.handle {
            if !handle.is_cancelled() {
                log::info!("Stopping upload batch");
                self.events.on_status_text("Stopping...");
            }
            handle.cancel();
        }
    }

    /// Drain engine events and apply them. Returns `true` once the batch
    /// has fully finished (after which the finish hook has run).
    pub async fn pump(&mut self) -> AppResult<bool> {
        let mut drained = Vec::new();
        let finished = match self.handle.as_mut() {
            Some(handle) => {
                // Read the flag before draining: once it is set, every event
                // is already in the channel, so the drain below is complete.
                let finished = handle.is_finished();
                while let Ok(event) = handle.events.try_recv() {
                    drained.push(event);
                }
                finished
            }
            None => return Ok(!self.uploading),
        };

        for event in drained {
            self.apply_event(event)?;
        }

        if finished && self.uploading {
            self.finish_batch().await?;
        }
        Ok(!self.uploading)
    }

    fn apply_event(&mut self, event: EngineEvent) -> AppResult<()> {
        match event {
            EngineEvent::TaskStateChanged { path, state } => {
                if let Some(task) = self.tasks.get_mut(&path) {
                    task.state = state;
                    if state == TaskState::Uploading {
                        task.attempts += 1;
                    }
                }
            }
            EngineEvent::TaskProgress { path, fraction } => {
                if let Some(task) = self.tasks.get_mut(&path) {
                    task.progress = fraction;
                }
            }
            EngineEvent::GalleryCreated { group_id, gallery } => {
                self.galleries.insert(group_id, gallery);
            }
            EngineEvent::TaskSucceeded { path, result } => {
                let gallery_id = self.gallery_id_for(&path);
                if let Some(task) = self.tasks.get_mut(&path) {
                    task.state = TaskState::Success;
                    task.progress = 1.0;
                    task.image_url = Some(result.image_url.clone());
                    task.thumb_url = Some(result.thumb_url.clone());
                    task.error = None;
                }
                self.record(&path, true, Some(&result.image_url), Some(&result.thumb_url), gallery_id, None)?;
                self.increment_completed_count();
            }
            EngineEvent::TaskFailed { path, reason } => {
                if let Some(task) = self.tasks.get_mut(&path) {
                    task.state = TaskState::Failed;
                    task.error = Some(reason.clone());
                }
                self.record(&path, false, None, None, None, Some(&reason))?;
                self.increment_completed_count();
            }
            EngineEvent::BatchFinished => {}
        }
        Ok(())
    }

    /// Bump the terminal-task counter and notify the shell. Returns the
    /// new count.
    pub fn increment_completed_count(&mut self) -> usize {
        self.completed += 1;
        self.events.on_progress(self.completed, self.total);
        self.completed
    }

    fn gallery_id_for(&self, path: &Path) -> Option<String> {
        let group_id = self.tasks.get(path)?.group_id;
        self.galleries.get(&group_id).map(|g| g.id.clone())
    }

    fn record(
        &mut self,
        path: &Path,
        success: bool,
        image_url: Option<&str>,
        thumb_url: Option<&str>,
        gallery_id: Option<String>,
        error: Option<&str>,
    ) -> AppResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let destination = session.destination.clone();
        self.history.add_record(
            session,
            UploadRecord {
                file_path: path.display().to_string(),
                destination,
                image_url: image_url.map(|s| s.to_string()),
                thumbnail_url: thumb_url.map(|s| s.to_string()),
                gallery_id,
                status: if success { "success" } else { "failed" }.to_string(),
                timestamp: Utc::now(),
                error_message: error.map(|s| s.to_string()),
                file_size,
            },
        )
    }

    async fn finish_batch(&mut self) -> AppResult<()> {
        if self.finish_emitted {
            return Ok(());
        }
        self.finish_emitted = true;
        self.uploading = false;
        self.handle = None;

        self.finalize_galleries().await;

        if let Some(mut session) = self.session.take() {
            let status = if self.completed >= self.total {
                "completed"
            } else {
                "interrupted"
            };
            self.history.end_session(&mut session, status)?;
        }

        // Files a cancelled batch never finished go back to pending so the
        // next batch re-selects them
        for task in self.tasks.values_mut() {
            if !task.state.is_terminal() && task.state != TaskState::Pending {
                task.state = TaskState::Pending;
                task.progress = 0.0;
            }
        }

        self.events.on_batch_finish();
        Ok(())
    }

    /// Close out galleries that were opened for this batch. Failures are
    /// logged; the batch result stands regardless.
    async fn finalize_galleries(&mut self) {
        let Some(settings) = &self.settings else {
            return;
        };
        if self.galleries.is_empty() {
            return;
        }

        let config = serde_json::Value::Object(
            settings
                .upload_options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let backend = match self
            .registry
            .instantiate(&settings.destination, &self.credentials, &config)
        {
            Ok(backend) => backend,
            Err(e) => {
                log::warn!("Cannot finalize galleries: {}", e);
                return;
            }
        };

        for (group_id, gallery) in std::mem::take(&mut self.galleries) {
            match backend.finalize_gallery(&gallery).await {
                Ok(()) => {
                    // Keep the handle so output generation can link it
                    self.galleries.insert(group_id, gallery);
                }
                Err(e) => {
                    log::warn!("Failed to finalize gallery {}: {}", gallery.id, e);
                    self.galleries.insert(group_id, gallery);
                }
            }
        }
    }

    /// Drive the batch until it finishes. Intended for headless use.
    pub async fn run_to_completion(&mut self) -> AppResult<()> {
        loop {
            if self.pump().await? {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Move failed tasks back to pending so the next batch retries them.
    /// Returns how many were reset.
    pub fn retry_failed(&mut self) -> usize {
        let mut reset = 0;
        for task in self.tasks.values_mut() {
            if task.state == TaskState::Failed {
                task.state = TaskState::Pending;
                task.error = None;
                task.progress = 0.0;
                reset += 1;
            }
        }
        if reset > 0 {
            log::info!("Reset {} failed task(s) for retry", reset);
        }
        reset
    }

    /// Render one group's successful uploads to a file. Returns `None`
    /// when the group has no successes to report.
    pub fn generate_group_output(
        &self,
        group_id: Uuid,
        renderer: &dyn OutputRenderer,
        output_dir: &Path,
    ) -> AppResult<Option<PathBuf>> {
        let Some(group) = self.groups.iter().find(|g| g.id == group_id) else {
            log::warn!("Unknown group {}", group_id);
            return Ok(None);
        };

        let images: Vec<UploadOutcome> = group
            .files
            .iter()
            .filter_map(|path| {
                let task = self.tasks.get(path)?;
                if task.state != TaskState::Success {
                    return None;
                }
                Some(UploadOutcome {
                    path: path.clone(),
                    image_url: task.image_url.clone()?,
                    thumb_url: task.thumb_url.clone()?,
                })
            })
            .collect();

        if images.is_empty() {
            log::warn!("No successful uploads in '{}', skipping output", group.title);
            return Ok(None);
        }

        let gallery = self.galleries.get(&group_id);
        let gallery_id = gallery.map(|g| g.id.clone());
        let gallery_link = match (&self.settings, &gallery_id) {
            (Some(settings), Some(id)) => output::gallery_link(&settings.destination, id),
            _ => None,
        };

        let ctx = GroupOutputContext {
            gallery_name: group.title.clone(),
            gallery_id,
            gallery_link,
            cover_url: images.first().map(|i| i.image_url.clone()),
            images,
        };

        output::write_group_output(output_dir, &ctx, renderer).map(Some)
    }
}
