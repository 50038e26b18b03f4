use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::contract::{
    BackendCapabilities, BackendDescriptor, CredentialField, Credentials, ImageHostBackend,
    ProgressSink, UploadedImage,
};
use crate::errors::{AppError, AppResult};

const UPLOAD_URL: &str = "https://catbox.moe/user/api.php";

/// Catbox.moe backend. Anonymous uploads, no galleries, plain-text
/// response carrying the image URL.
pub struct CatboxBackend {
    user_hash: Option<String>,
    capabilities: BackendCapabilities,
    client: reqwest::Client,
}

pub fn descriptor() -> BackendDescriptor {
    BackendDescriptor {
        name: "Catbox".to_string(),
        version: "1.0.0".to_string(),
        author: "builtin".to_string(),
        description: "Upload images to Catbox.moe (anonymous, no registration)".to_string(),
        service_url: "https://catbox.moe".to_string(),
        capabilities: capabilities(),
        factory: Arc::new(|credentials, _config| Ok(Box::new(CatboxBackend::new(credentials)?))),
    }
}

fn capabilities() -> BackendCapabilities {
    BackendCapabilities {
        supports_galleries: false,
        requires_authentication: false,
        max_concurrent_uploads: 3,
        max_file_size_mb: 200,
        allowed_formats: ["jpg", "jpeg", "png", "gif", "webp", "bmp"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

impl CatboxBackend {
    pub fn new(credentials: &Credentials) -> AppResult<Self> {
        let user_hash = credentials
            .get("user_hash")
            .filter(|h| !h.trim().is_empty())
            .cloned();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            user_hash,
            capabilities: capabilities(),
            client,
        })
    }
}

#[async_trait]
impl ImageHostBackend for CatboxBackend {
    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    async fn upload(&self, path: &Path, sink: &ProgressSink) -> AppResult<UploadedImage> {
        self.validate_file(path)?;

        let bytes = tokio::fs::read(path).await?;
        let total = bytes.len() as u64;
        if !sink.report(0, total) {
            return Err(AppError::cancelled("upload attempt"));
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        log::debug!("Uploading {} to Catbox ({} bytes)", filename, total);

        let mut form = reqwest::multipart::Form::new()
            .text("reqtype", "fileupload")
            .part(
                "fileToUpload",
                reqwest::multipart::Part::bytes(bytes).file_name(filename),
            );
        if let Some(user_hash) = &self.user_hash {
            form = form.text("userhash", user_hash.clone());
        }

        let response = self.client.post(UPLOAD_URL).multipart(form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let image_url = body.trim().to_string();
        if !image_url.starts_with("http") {
            return Err(AppError::upload_failed(format!(
                "Unexpected Catbox response: {}",
                image_url.chars().take(100).collect::<String>()
            )));
        }

        sink.report(total, total);
        log::info!("Uploaded to Catbox: {}", image_url);

        // Catbox has no separate thumbnails
        Ok(UploadedImage {
            thumb_url: image_url.clone(),
            image_url,
        })
    }

    async fn validate_credentials(&self) -> AppResult<bool> {
        // Anonymous uploads need no credentials; a user hash cannot be
        // verified without performing an actual upload.
        if self.user_hash.is_some() {
            log::debug!("Catbox user hash provided (not validated)");
        }
        Ok(true)
    }

    fn credential_fields(&self) -> Vec<CredentialField> {
        vec![CredentialField {
            name: "user_hash".to_string(),
            label: "Catbox User Hash".to_string(),
            secret: true,
            required: false,
            help_text: Some(
                "Optional: register at catbox.moe to manage and delete uploads".to_string(),
            ),
        }]
    }

    async fn delete_image(&self, image_url: &str) -> AppResult<bool> {
        let Some(user_hash) = &self.user_hash else {
            log::warn!("Cannot delete Catbox file without user hash");
            return Ok(false);
        };

        let Some(filename) = image_url.rsplit('/').next() else {
            return Ok(false);
        };

        let form = reqwest::multipart::Form::new()
            .text("reqtype", "deletefiles")
            .text("userhash", user_hash.clone())
            .text("files", filename.to_string());

        let response = self.client.post(UPLOAD_URL).multipart(form).send().await?;
        if response.status().is_success() {
            log::info!("Deleted Catbox file: {}", filename);
            Ok(true)
        } else {
            log::warn!("Failed to delete Catbox file: {}", response.status());
            Ok(false)
        }
    }
}
