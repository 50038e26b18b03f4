use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};

/// Credential map as entered by the user, keyed by field name.
pub type Credentials = HashMap<String, String>;

/// URLs returned by a completed upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedImage {
    pub image_url: String,
    pub thumb_url: String,
}

/// Remote gallery created ahead of a group upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryHandle {
    pub id: String,
    /// Secondary token some services require for adding to or closing
    /// the gallery. Absent for services that only need the id.
    pub upload_token: Option<String>,
}

/// What a destination can and cannot do, used by the engine to clamp
/// concurrency and by validation to reject files early.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub supports_galleries: bool,
    pub requires_authentication: bool,
    pub max_concurrent_uploads: usize,
    pub max_file_size_mb: u64,
    pub allowed_formats: Vec<String>,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            supports_galleries: false,
            requires_authentication: false,
            max_concurrent_uploads: 3,
            max_file_size_mb: 50,
            allowed_formats: vec![
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "gif".to_string(),
                "webp".to_string(),
            ],
        }
    }
}

/// Describes one credential input the UI should render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialField {
    pub name: String,
    pub label: String,
    pub secret: bool,
    pub required: bool,
    pub help_text: Option<String>,
}

/// Progress channel handed to a backend during upload.
///
/// Backends call [`ProgressSink::report`] as bytes go out; a `false` return
/// means the batch was cancelled and the backend should abandon the
/// transfer. Reported fractions are monotonic, late out-of-order reports
/// are dropped.
pub struct ProgressSink {
    cancel: CancellationToken,
    callback: Box<dyn Fn(f32) + Send + Sync>,
    high_water: AtomicU32,
}

impl ProgressSink {
    pub fn new(cancel: CancellationToken, callback: Box<dyn Fn(f32) + Send + Sync>) -> Self {
        Self {
            cancel,
            callback,
            high_water: AtomicU32::new(0),
        }
    }

    /// A sink that swallows progress, for tests and credential checks.
    pub fn discard() -> Self {
        Self::new(CancellationToken::new(), Box::new(|_| {}))
    }

    pub fn report(&self, sent: u64, total: u64) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if total > 0 {
            let fraction = (sent as f64 / total as f64).clamp(0.0, 1.0);
            // Scale to integer ticks so the monotonic clamp is a single CAS
            let tick = (fraction * 10_000.0) as u32;
            let prev = self.high_water.fetch_max(tick, Ordering::Relaxed);
            if tick > prev {
                (self.callback)(fraction as f32);
            }
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One image hosting service.
///
/// Implementations are constructed per task through a
/// [`BackendDescriptor`] factory, so they may hold per-upload state such
/// as a configured HTTP client.
#[async_trait]
pub trait ImageHostBackend: Send + Sync {
    fn capabilities(&self) -> &BackendCapabilities;

    /// Upload a single file, reporting progress through `sink`.
    async fn upload(&self, path: &Path, sink: &ProgressSink) -> AppResult<UploadedImage>;

    /// Check whether the configured credentials are usable.
    async fn validate_credentials(&self) -> AppResult<bool>;

    /// Credential inputs the UI should collect for this service.
    fn credential_fields(&self) -> Vec<CredentialField> {
        Vec::new()
    }

    /// Create a remote gallery before the group's files go up. Services
    /// without gallery support return `Ok(None)`.
    async fn create_gallery(
        &self,
        _name: &str,
        _image_urls: &[String],
    ) -> AppResult<Option<GalleryHandle>> {
        Ok(None)
    }

    /// Close out a gallery after its uploads finish. No-op by default.
    async fn finalize_gallery(&self, _gallery: &GalleryHandle) -> AppResult<()> {
        Ok(())
    }

    /// Best-effort remote deletion. Services without a delete API
    /// return `Ok(false)`.
    async fn delete_image(&self, _image_url: &str) -> AppResult<bool> {
        Ok(false)
    }

    /// Reject files the service would bounce before any bytes move.
    fn validate_file(&self, path: &Path) -> AppResult<()> {
        let caps = self.capabilities();

        if !path.exists() {
            return Err(AppError::file_not_found(&path.display().to_string()));
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !caps.allowed_formats.iter().any(|f| f == &extension) {
            return Err(AppError::InvalidFileType {
                path: path.display().to_string(),
                allowed: caps.allowed_formats.join(", "),
            });
        }

        let size = std::fs::metadata(path)?.len();
        if size > caps.max_file_size_mb * 1024 * 1024 {
            return Err(AppError::FileTooLarge {
                path: path.display().to_string(),
                max_mb: caps.max_file_size_mb,
            });
        }

        Ok(())
    }
}

/// Factory closure that builds a fresh backend instance for one task.
pub type BackendFactory = Arc<
    dyn Fn(&Credentials, &serde_json::Value) -> AppResult<Box<dyn ImageHostBackend>> + Send + Sync,
>;

/// Registry entry for one destination: identity, capabilities, and a
/// factory for instantiating the backend.
#[derive(Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub service_url: String,
    pub capabilities: BackendCapabilities,
    pub factory: BackendFactory,
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
