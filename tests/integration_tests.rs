use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use imagehost_uploader::backend::contract::{
    BackendCapabilities, BackendDescriptor, Credentials, GalleryHandle, ImageHostBackend,
    ProgressSink, UploadedImage,
};
use imagehost_uploader::backend::BackendRegistry;
use imagehost_uploader::errors::{AppError, AppResult};
use imagehost_uploader::history::SessionHistory;
use imagehost_uploader::output::PlainRenderer;
use imagehost_uploader::reporting::ErrorReporter;
use imagehost_uploader::uploader::engine::{EngineEvent, UploadEngine};
use imagehost_uploader::uploader::{BatchSettings, FileGroup, RetryPolicy, TaskState, UploadCoordinator};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        exponential_base: 2.0,
    }
}

/// Scripted backend used by all the tests below. Behavior is keyed by
/// file path: fail N times before succeeding, or always fail terminally.
#[derive(Default)]
struct MockState {
    fail_times: HashMap<PathBuf, u32>,
    terminal: HashSet<PathBuf>,
    attempts: Mutex<HashMap<PathBuf, u32>>,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
    upload_delay: Duration,
    supports_galleries: bool,
    finalized: AtomicBool,
}

impl MockState {
    fn attempts_for(&self, path: &Path) -> u32 {
        *self.attempts.lock().unwrap().get(path).unwrap_or(&0)
    }
}

struct MockBackend {
    state: Arc<MockState>,
    capabilities: BackendCapabilities,
}

#[async_trait]
impl ImageHostBackend for MockBackend {
    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    async fn upload(&self, path: &Path, sink: &ProgressSink) -> AppResult<UploadedImage> {
        let attempt = {
            let mut attempts = self.state.attempts.lock().unwrap();
            let entry = attempts.entry(path.to_path_buf()).or_insert(0);
            *entry += 1;
            *entry
        };

        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.high_water.fetch_max(current, Ordering::SeqCst);
        sink.report(1, 2);
        tokio::time::sleep(self.state.upload_delay).await;
        let keep_going = sink.report(2, 2);
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !keep_going {
            return Err(AppError::cancelled("upload attempt"));
        }

        if self.state.terminal.contains(path) {
            return Err(AppError::HttpStatus {
                status: 403,
                body: "forbidden".to_string(),
            });
        }
        let failures = *self.state.fail_times.get(path).unwrap_or(&0);
        if attempt <= failures {
            return Err(AppError::HttpStatus {
                status: 503,
                body: "flaky".to_string(),
            });
        }

        let name = path.file_name().unwrap().to_string_lossy();
        Ok(UploadedImage {
            image_url: format!("https://mock.test/{}", name),
            thumb_url: format!("https://mock.test/t/{}", name),
        })
    }

    async fn validate_credentials(&self) -> AppResult<bool> {
        Ok(true)
    }

    async fn create_gallery(
        &self,
        _name: &str,
        _image_urls: &[String],
    ) -> AppResult<Option<GalleryHandle>> {
        if !self.state.supports_galleries {
            return Ok(None);
        }
        Ok(Some(GalleryHandle {
            id: "mockgal".to_string(),
            upload_token: Some("mocktoken".to_string()),
        }))
    }

    async fn finalize_gallery(&self, _gallery: &GalleryHandle) -> AppResult<()> {
        self.state.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn validate_file(&self, _path: &Path) -> AppResult<()> {
        // Test files are synthetic paths
        Ok(())
    }
}

fn mock_registry(state: Arc<MockState>, max_concurrent: usize) -> Arc<BackendRegistry> {
    let registry = BackendRegistry::builtin_only();
    let supports_galleries = state.supports_galleries;
    registry.register(BackendDescriptor {
        name: "Mock".to_string(),
        version: "0.0.1".to_string(),
        author: "tests".to_string(),
        description: "scripted test destination".to_string(),
        service_url: "https://mock.test".to_string(),
        capabilities: BackendCapabilities {
            supports_galleries,
            requires_authentication: false,
            max_concurrent_uploads: max_concurrent,
            max_file_size_mb: 100,
            allowed_formats: vec!["png".to_string(), "jpg".to_string()],
        },
        factory: Arc::new(move |_creds, _config| {
            Ok(Box::new(MockBackend {
                state: Arc::clone(&state),
                capabilities: BackendCapabilities {
                    supports_galleries,
                    requires_authentication: false,
                    max_concurrent_uploads: max_concurrent,
                    max_file_size_mb: 100,
                    allowed_formats: vec!["png".to_string(), "jpg".to_string()],
                },
            }))
        }),
    });
    Arc::new(registry)
}

fn paths(n: usize) -> Vec<PathBuf> {
    (0..n).map(|i| PathBuf::from(format!("img_{}.png", i))).collect()
}

async fn drain_events(
    handle: &mut imagehost_uploader::uploader::BatchHandle,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        match handle.events.recv().await {
            Some(EngineEvent::BatchFinished) => {
                events.push(EngineEvent::BatchFinished);
                break;
            }
            Some(event) => events.push(event),
            None => break,
        }
    }
    events
}

#[tokio::test]
async fn test_engine_respects_concurrency_limit() {
    init_logging();
    let state = Arc::new(MockState {
        upload_delay: Duration::from_millis(30),
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 8);
    let engine = UploadEngine::new(registry, fast_policy(), Arc::new(ErrorReporter::new()));

    let mut settings = BatchSettings::new("Mock");
    settings.concurrency_limit = 2;
    let group = FileGroup::new("batch", paths(6));

    let mut handle = engine
        .start(vec![group], settings, Credentials::new())
        .unwrap();
    let events = drain_events(&mut handle).await;

    let successes = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::TaskSucceeded { .. }))
        .count();
    assert_eq!(successes, 6);
    assert!(
        state.high_water.load(Ordering::SeqCst) <= 2,
        "concurrency exceeded: {}",
        state.high_water.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_engine_clamps_to_destination_limit() {
    init_logging();
    let state = Arc::new(MockState {
        upload_delay: Duration::from_millis(20),
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 1);
    let engine = UploadEngine::new(registry, fast_policy(), Arc::new(ErrorReporter::new()));

    let mut settings = BatchSettings::new("Mock");
    settings.concurrency_limit = 10;
    let group = FileGroup::new("batch", paths(4));

    let mut handle = engine
        .start(vec![group], settings, Credentials::new())
        .unwrap();
    drain_events(&mut handle).await;

    assert_eq!(state.high_water.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried_to_success() {
    init_logging();
    let file = PathBuf::from("img_0.png");
    let state = Arc::new(MockState {
        fail_times: HashMap::from([(file.clone(), 2)]),
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 4);
    let reporter = Arc::new(ErrorReporter::new());
    let engine = UploadEngine::new(registry, fast_policy(), Arc::clone(&reporter));

    let group = FileGroup::new("batch", vec![file.clone()]);
    let mut handle = engine
        .start(vec![group], BatchSettings::new("Mock"), Credentials::new())
        .unwrap();
    let events = drain_events(&mut handle).await;

    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TaskSucceeded { .. })));
    assert_eq!(state.attempts_for(&file), 3);

    // Retry churn is reported as a single warning, not one per attempt
    let (errors, warnings) = reporter.counts();
    assert_eq!(errors, 0);
    assert_eq!(warnings, 1);
}

#[tokio::test]
async fn test_retries_exhausted_is_terminal() {
    init_logging();
    let file = PathBuf::from("img_0.png");
    let state = Arc::new(MockState {
        fail_times: HashMap::from([(file.clone(), 99)]),
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 4);
    let reporter = Arc::new(ErrorReporter::new());
    let engine = UploadEngine::new(registry, fast_policy(), Arc::clone(&reporter));

    let group = FileGroup::new("batch", vec![file.clone()]);
    let mut handle = engine
        .start(vec![group], BatchSettings::new("Mock"), Credentials::new())
        .unwrap();
    let events = drain_events(&mut handle).await;

    let failures = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::TaskFailed { .. }))
        .count();
    assert_eq!(failures, 1);
    assert_eq!(state.attempts_for(&file), 3);
    assert_eq!(reporter.counts().0, 1);
}

#[tokio::test]
async fn test_terminal_error_skips_retries() {
    init_logging();
    let file = PathBuf::from("img_0.png");
    let state = Arc::new(MockState {
        terminal: HashSet::from([file.clone()]),
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 4);
    let engine = UploadEngine::new(registry, fast_policy(), Arc::new(ErrorReporter::new()));

    let group = FileGroup::new("batch", vec![file.clone()]);
    let mut handle = engine
        .start(vec![group], BatchSettings::new("Mock"), Credentials::new())
        .unwrap();
    let events = drain_events(&mut handle).await;

    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TaskFailed { reason, .. } if reason.contains("403"))));
    assert_eq!(state.attempts_for(&file), 1);
}

#[tokio::test]
async fn test_cancellation_leaves_unstarted_tasks_without_terminal_events() {
    init_logging();
    let state = Arc::new(MockState {
        upload_delay: Duration::from_millis(40),
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 1);
    let engine = UploadEngine::new(registry, fast_policy(), Arc::new(ErrorReporter::new()));

    let mut settings = BatchSettings::new("Mock");
    settings.concurrency_limit = 1;
    let group = FileGroup::new("batch", paths(5));

    let mut handle = engine
        .start(vec![group], settings, Credentials::new())
        .unwrap();

    // Wait for the first task to finish, then cancel
    let mut events = Vec::new();
    loop {
        let event = handle.events.recv().await.unwrap();
        let done = matches!(event, EngineEvent::TaskSucceeded { .. });
        events.push(event);
        if done {
            break;
        }
    }
    handle.cancel();
    events.extend(drain_events(&mut handle).await);

    let successes = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::TaskSucceeded { .. }))
        .count();
    let failures = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::TaskFailed { .. }))
        .count();

    // Exactly one task reached a terminal state; the rest never started
    // and emitted nothing terminal
    assert_eq!(successes, 1);
    assert_eq!(failures, 0);
    assert!(state.attempts_for(Path::new("img_4.png")) <= 1);
}

#[tokio::test]
async fn test_coordinator_full_batch_lifecycle() {
    init_logging();
    let state = Arc::new(MockState {
        supports_galleries: true,
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 4);

    let history_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let history = SessionHistory::new(history_dir.path()).unwrap();

    let mut coord = UploadCoordinator::new(
        registry,
        fast_policy(),
        Arc::new(ErrorReporter::new()),
        history,
        Box::new(()),
    );
    let group_id = coord.add_group("Holiday", paths(3));

    let started = coord
        .start_batch(BatchSettings::new("Mock"), Credentials::new())
        .unwrap();
    assert!(started);
    assert!(coord.is_uploading());

    coord.run_to_completion().await.unwrap();
    assert!(!coord.is_uploading());
    assert_eq!(coord.progress(), (3, 3));
    for path in paths(3) {
        assert_eq!(coord.task(&path).unwrap().state, TaskState::Success);
    }

    // Gallery was created up front and finalized at the end
    assert!(state.finalized.load(Ordering::SeqCst));

    // Session record is complete
    let sessions = SessionHistory::new(history_dir.path())
        .unwrap()
        .list_sessions(None)
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, "completed");
    assert_eq!(sessions[0].total_files, 3);
    assert_eq!(sessions[0].successful, 3);
    assert!(sessions[0]
        .records
        .iter()
        .all(|r| r.gallery_id.as_deref() == Some("mockgal")));

    // Output document lists every uploaded image
    let out = coord
        .generate_group_output(group_id, &PlainRenderer, output_dir.path())
        .unwrap()
        .expect("output file should be written");
    let text = std::fs::read_to_string(out).unwrap();
    assert!(text.contains("https://mock.test/img_0.png"));
    assert!(text.contains("https://mock.test/img_2.png"));
}

#[tokio::test]
async fn test_coordinator_stop_marks_session_interrupted() {
    init_logging();
    let state = Arc::new(MockState {
        upload_delay: Duration::from_millis(40),
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 1);

    let history_dir = tempfile::tempdir().unwrap();
    let history = SessionHistory::new(history_dir.path()).unwrap();

    let mut coord = UploadCoordinator::new(
        registry,
        fast_policy(),
        Arc::new(ErrorReporter::new()),
        history,
        Box::new(()),
    );
    coord.add_group("Holiday", paths(5));

    let mut settings = BatchSettings::new("Mock");
    settings.concurrency_limit = 1;
    coord.start_batch(settings, Credentials::new()).unwrap();

    // Let the first upload land, then stop
    tokio::time::sleep(Duration::from_millis(60)).await;
    coord.stop_upload();
    coord.run_to_completion().await.unwrap();

    let (completed, total) = coord.progress();
    assert_eq!(total, 5);
    assert!(completed < total, "stop should leave work undone");

    // Unstarted files went back to pending, not to a terminal state
    let pending = paths(5)
        .iter()
        .filter(|p| coord.task(p).unwrap().state == TaskState::Pending)
        .count();
    let succeeded = paths(5)
        .iter()
        .filter(|p| coord.task(p).unwrap().state == TaskState::Success)
        .count();
    assert_eq!(succeeded, completed);
    assert_eq!(pending, total - completed);

    let sessions = SessionHistory::new(history_dir.path())
        .unwrap()
        .list_sessions(None)
        .unwrap();
    assert_eq!(sessions[0].status, "interrupted");

    // A second batch picks up exactly the files the stop left behind
    let mut settings = BatchSettings::new("Mock");
    settings.concurrency_limit = 1;
    assert!(coord.start_batch(settings, Credentials::new()).unwrap());
    coord.run_to_completion().await.unwrap();

    for path in paths(5) {
        assert_eq!(coord.task(&path).unwrap().state, TaskState::Success);
    }
    // Both batches may start within the same clock second and share a
    // session id, so only the latest status is asserted
    let sessions = SessionHistory::new(history_dir.path())
        .unwrap()
        .list_sessions(None)
        .unwrap();
    assert_eq!(sessions[0].status, "completed");
}

#[tokio::test]
async fn test_coordinator_retry_failed_then_second_batch() {
    init_logging();
    let flaky = PathBuf::from("img_1.png");
    let state = Arc::new(MockState {
        terminal: HashSet::from([flaky.clone()]),
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 4);

    let history_dir = tempfile::tempdir().unwrap();
    let history = SessionHistory::new(history_dir.path()).unwrap();

    let mut coord = UploadCoordinator::new(
        Arc::clone(&registry),
        fast_policy(),
        Arc::new(ErrorReporter::new()),
        history,
        Box::new(()),
    );
    coord.add_group("Holiday", paths(2));
    coord
        .start_batch(BatchSettings::new("Mock"), Credentials::new())
        .unwrap();
    coord.run_to_completion().await.unwrap();

    assert_eq!(coord.task(&flaky).unwrap().state, TaskState::Failed);
    assert_eq!(coord.task(Path::new("img_0.png")).unwrap().state, TaskState::Success);

    // Only the failed file goes back to pending; the second batch skips
    // the file that already succeeded
    assert_eq!(coord.retry_failed(), 1);
    let pending = coord.filter_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].files, vec![flaky.clone()]);

    let attempts_before = state.attempts_for(Path::new("img_0.png"));
    coord
        .start_batch(BatchSettings::new("Mock"), Credentials::new())
        .unwrap();
    coord.run_to_completion().await.unwrap();
    assert_eq!(state.attempts_for(Path::new("img_0.png")), attempts_before);
}

/// Records on_progress callbacks for ordering assertions.
#[derive(Default)]
struct RecordingEvents {
    progress: Mutex<Vec<(usize, usize)>>,
    started: AtomicBool,
    finished: AtomicBool,
}

impl imagehost_uploader::uploader::BatchEvents for RecordingEvents {
    fn on_batch_start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn on_batch_finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    fn on_progress(&self, completed: usize, total: usize) {
        self.progress.lock().unwrap().push((completed, total));
    }
}

#[tokio::test]
async fn test_progress_reports_are_monotone_with_retries() {
    init_logging();
    let flaky = PathBuf::from("img_0.png");
    let state = Arc::new(MockState {
        fail_times: HashMap::from([(flaky.clone(), 2)]),
        ..Default::default()
    });
    let registry = mock_registry(Arc::clone(&state), 1);

    let history_dir = tempfile::tempdir().unwrap();
    let history = SessionHistory::new(history_dir.path()).unwrap();
    let recorder = Arc::new(RecordingEvents::default());

    let mut coord = UploadCoordinator::new(
        registry,
        fast_policy(),
        Arc::new(ErrorReporter::new()),
        history,
        Box::new(Arc::clone(&recorder)),
    );
    coord.add_group("Holiday", paths(3));

    let mut settings = BatchSettings::new("Mock");
    settings.concurrency_limit = 1;
    coord.start_batch(settings, Credentials::new()).unwrap();
    coord.run_to_completion().await.unwrap();

    assert!(recorder.started.load(Ordering::SeqCst));
    assert!(recorder.finished.load(Ordering::SeqCst));
    assert_eq!(state.attempts_for(&flaky), 3);

    let progress = recorder.progress.lock().unwrap();
    // Initial (0, 3) plus one step per terminal task, strictly increasing
    assert_eq!(*progress, vec![(0, 3), (1, 3), (2, 3), (3, 3)]);
    drop(progress);

    for path in paths(3) {
        assert_eq!(coord.task(&path).unwrap().state, TaskState::Success);
    }
}
