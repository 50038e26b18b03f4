use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::contract::{Credentials, GalleryHandle, ProgressSink, UploadedImage};
use crate::backend::BackendRegistry;
use crate::errors::{AppResult, ErrorClass};
use crate::reporting::ErrorReporter;
use crate::uploader::retry::RetryPolicy;
use crate::uploader::types::{BatchSettings, FileGroup, TaskState};

/// Events the engine emits while a batch runs.
#[derive(Debug)]
pub enum EngineEvent {
    TaskStateChanged { path: PathBuf, state: TaskState },
    TaskProgress { path: PathBuf, fraction: f32 },
    GalleryCreated { group_id: Uuid, gallery: GalleryHandle },
    TaskSucceeded { path: PathBuf, result: UploadedImage },
    TaskFailed { path: PathBuf, reason: String },
    BatchFinished,
}

/// Live handle to a running batch.
pub struct BatchHandle {
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl BatchHandle {
    /// Request cancellation. Queued tasks will not start; the attempt
    /// currently in flight for each running task is allowed to complete.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Number of tasks currently holding a concurrency permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Runs batches of uploads with bounded concurrency and per-task retry.
pub struct UploadEngine {
    registry: Arc<BackendRegistry>,
    policy: RetryPolicy,
    reporter: Arc<ErrorReporter>,
}

impl UploadEngine {
    pub fn new(
        registry: Arc<BackendRegistry>,
        policy: RetryPolicy,
        reporter: Arc<ErrorReporter>,
    ) -> Self {
        Self {
            registry,
            policy,
            reporter,
        }
    }

    /// Start uploading `groups` and return a handle carrying the event
    /// stream. Groups run in order; files within a group share its gallery.
    pub fn start(
        &self,
        groups: Vec<FileGroup>,
        settings: BatchSettings,
        credentials: Credentials,
    ) -> AppResult<BatchHandle> {
        let descriptor = self.registry.descriptor(&settings.destination)?;

        // The destination's own limit caps whatever the caller asked for
        let limit = settings
            .concurrency_limit
            .max(1)
            .min(descriptor.capabilities.max_concurrent_uploads.max(1));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let driver = BatchDriver {
            registry: Arc::clone(&self.registry),
            policy: self.policy.clone(),
            reporter: Arc::clone(&self.reporter),
            settings,
            credentials,
            gallery_capable: descriptor.capabilities.supports_galleries,
            semaphore: Arc::new(Semaphore::new(limit)),
            cancel: cancel.clone(),
            events: event_tx,
            in_flight: Arc::clone(&in_flight),
        };

        let finished_flag = Arc::clone(&finished);
        tokio::spawn(async move {
            driver.run(groups).await;
            finished_flag.store(true, Ordering::Release);
        });

        Ok(BatchHandle {
            events: event_rx,
            cancel,
            finished,
            in_flight,
        })
    }
}

struct BatchDriver {
    registry: Arc<BackendRegistry>,
    policy: RetryPolicy,
    reporter: Arc<ErrorReporter>,
    settings: BatchSettings,
    credentials: Credentials,
    gallery_capable: bool,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<EngineEvent>,
    in_flight: Arc<AtomicUsize>,
}

impl BatchDriver {
    async fn run(self, groups: Vec<FileGroup>) {
        let mut join_set = JoinSet::new();
        let driver = Arc::new(self);

        for group in groups {
            if driver.cancel.is_cancelled() {
                break;
            }

            let gallery = driver.prepare_gallery(&group).await;
            let config = driver.group_config(gallery.as_ref());

            for (index, path) in group.files.iter().enumerate() {
                let driver = Arc::clone(&driver);
                let path = path.clone();
                let mut config = config.clone();
                if index == 0 && driver.settings.first_file_is_cover {
                    if let Some(map) = config.as_object_mut() {
                        map.insert("is_cover".to_string(), serde_json::Value::Bool(true));
                    }
                }
                join_set.spawn(async move {
                    driver.run_task(path, config).await;
                });
            }
        }

        while join_set.join_next().await.is_some() {}
        let _ = driver.events.send(EngineEvent::BatchFinished);
        log::info!("Batch finished");
    }

    /// Create the group's remote gallery up front when the destination
    /// supports it. Failure is not fatal; the files upload ungrouped.
    async fn prepare_gallery(&self, group: &FileGroup) -> Option<GalleryHandle> {
        if !self.gallery_capable || !self.settings.auto_gallery {
            return None;
        }

        let backend = match self.registry.instantiate(
            &self.settings.destination,
            &self.credentials,
            &self.base_config(),
        ) {
            Ok(backend) => backend,
            Err(e) => {
                log::warn!("Cannot prepare gallery for '{}': {}", group.title, e);
                return None;
            }
        };

        match backend.create_gallery(&group.title, &[]).await {
            Ok(Some(gallery)) => {
                log::info!("Gallery '{}' created as {}", group.title, gallery.id);
                let _ = self.events.send(EngineEvent::GalleryCreated {
                    group_id: group.id,
                    gallery: gallery.clone(),
                });
                Some(gallery)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!(
                    "Gallery creation failed for '{}', uploading without: {}",
                    group.title,
                    e
                );
                None
            }
        }
    }

    fn base_config(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.settings
                .upload_options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Upload options plus the group's gallery routing fields.
    fn group_config(&self, gallery: Option<&GalleryHandle>) -> serde_json::Value {
        let mut config = self.base_config();
        if let (Some(gallery), Some(map)) = (gallery, config.as_object_mut()) {
            map.insert(
                "gallery_hash".to_string(),
                serde_json::Value::String(gallery.id.clone()),
            );
            if let Some(token) = &gallery.upload_token {
                map.insert(
                    "gallery_upload_hash".to_string(),
                    serde_json::Value::String(token.clone()),
                );
            }
        }
        config
    }

    async fn run_task(&self, path: PathBuf, config: serde_json::Value) {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return;
        };

        // Cancelled before starting: the task stays queued
        if self.cancel.is_cancelled() {
            return;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlightGuard(Arc::clone(&self.in_flight));

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let backend = match self
            .registry
            .instantiate(&self.settings.destination, &self.credentials, &config)
        {
            Ok(backend) => backend,
            Err(e) => {
                self.reporter.report_failure(&file_name, &e);
                let _ = self.events.send(EngineEvent::TaskFailed {
                    path,
                    reason: e.to_string(),
                });
                return;
            }
        };

        self.send_state(&path, TaskState::Uploading);

        let mut failed_attempts = 0u32;
        let mut retry_warned = false;
        loop {
            if self.cancel.is_cancelled() {
                self.send_state(&path, TaskState::Queued);
                return;
            }

            let sink = self.progress_sink(&path);
            match backend.upload(&path, &sink).await {
                Ok(result) => {
                    // A finished transfer counts even if cancel raced it
                    let _ = self.events.send(EngineEvent::TaskSucceeded { path, result });
                    return;
                }
                Err(e) => {
                    failed_attempts += 1;

                    if self.cancel.is_cancelled() {
                        log::debug!("Attempt for {} failed after cancellation", file_name);
                        self.send_state(&path, TaskState::Queued);
                        return;
                    }

                    match e.classify() {
                        ErrorClass::Cancelled => {
                            self.send_state(&path, TaskState::Queued);
                            return;
                        }
                        ErrorClass::Terminal => {
                            self.reporter.report_failure(&file_name, &e);
                            let _ = self.events.send(EngineEvent::TaskFailed {
                                path,
                                reason: e.to_string(),
                            });
                            return;
                        }
                        ErrorClass::Retryable => {
                            if !self.policy.allows_retry(failed_attempts) {
                                self.reporter.report_failure(&file_name, &e);
                                let _ = self.events.send(EngineEvent::TaskFailed {
                                    path,
                                    reason: e.to_string(),
                                });
                                return;
                            }

                            // One warning per task is enough noise
                            if !retry_warned {
                                self.reporter.report_retry(
                                    &file_name,
                                    failed_attempts,
                                    self.policy.max_attempts,
                                    &e,
                                );
                                retry_warned = true;
                            } else {
                                log::warn!(
                                    "Retrying {} (attempt {}/{}): {}",
                                    file_name,
                                    failed_attempts,
                                    self.policy.max_attempts,
                                    e
                                );
                            }
                            let delay = self.policy.backoff_delay(failed_attempts);
                            tokio::select! {
                                _ = self.cancel.cancelled() => {
                                    self.send_state(&path, TaskState::Queued);
                                    return;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    fn send_state(&self, path: &PathBuf, state: TaskState) {
        let _ = self.events.send(EngineEvent::TaskStateChanged {
            path: path.clone(),
            state,
        });
    }

    fn progress_sink(&self, path: &PathBuf) -> ProgressSink {
        let events = self.events.clone();
        let path = path.clone();
        ProgressSink::new(
            self.cancel.clone(),
            Box::new(move |fraction| {
                let _ = events.send(EngineEvent::TaskProgress {
                    path: path.clone(),
                    fraction,
                });
            }),
        )
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
