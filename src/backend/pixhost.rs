use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::contract::{
    BackendCapabilities, BackendDescriptor, CredentialField, GalleryHandle, ImageHostBackend,
    ProgressSink, UploadedImage,
};
use crate::errors::{AppError, AppResult};

const IMAGES_URL: &str = "https://api.pixhost.to/images";
const COVERS_URL: &str = "https://api.pixhost.to/covers";
const GALLERIES_URL: &str = "https://api.pixhost.to/galleries";

const VALID_THUMB_SIZES: [&str; 8] = ["150", "200", "250", "300", "350", "400", "450", "500"];

/// Pixhost.to backend. Anonymous uploads with first-class gallery support;
/// galleries are created before the batch and finalized after it.
pub struct PixhostBackend {
    content_type: String,
    thumb_size: String,
    gallery_hash: Option<String>,
    gallery_upload_hash: Option<String>,
    is_cover: bool,
    capabilities: BackendCapabilities,
    client: reqwest::Client,
}

pub fn descriptor() -> BackendDescriptor {
    BackendDescriptor {
        name: "Pixhost".to_string(),
        version: "1.0.0".to_string(),
        author: "builtin".to_string(),
        description: "Upload images to Pixhost.to with gallery support".to_string(),
        service_url: "https://pixhost.to".to_string(),
        capabilities: capabilities(),
        factory: Arc::new(|_credentials, config| Ok(Box::new(PixhostBackend::new(config)?))),
    }
}

fn capabilities() -> BackendCapabilities {
    BackendCapabilities {
        supports_galleries: true,
        requires_authentication: false,
        // Pixhost rate-limits aggressively
        max_concurrent_uploads: 3,
        max_file_size_mb: 10,
        allowed_formats: ["jpg", "jpeg", "png", "gif"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

impl PixhostBackend {
    pub fn new(config: &serde_json::Value) -> AppResult<Self> {
        let content_type = match config.get("content_type").and_then(|v| v.as_str()) {
            Some("adult") | Some("1") => "1".to_string(),
            _ => "0".to_string(),
        };
        let thumb_size = config
            .get("thumb_size")
            .and_then(|v| v.as_str())
            .filter(|s| VALID_THUMB_SIZES.contains(s))
            .unwrap_or("200")
            .to_string();
        let gallery_hash = config
            .get("gallery_hash")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let gallery_upload_hash = config
            .get("gallery_upload_hash")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let is_cover = config
            .get("is_cover")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            content_type,
            thumb_size,
            gallery_hash,
            gallery_upload_hash,
            is_cover,
            capabilities: capabilities(),
            client,
        })
    }
}

#[async_trait]
impl ImageHostBackend for PixhostBackend {
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

        log::debug!("Uploading {} to Pixhost ({} bytes)", filename, total);

        // Covers go to a dedicated endpoint with their own field name
        let (url, file_field) = if self.is_cover {
            (COVERS_URL, "img_left")
        } else {
            (IMAGES_URL, "img")
        };

        let mut form = reqwest::multipart::Form::new()
            .part(
                file_field,
                reqwest::multipart::Part::bytes(bytes).file_name(filename),
            )
            .text("content_type", self.content_type.clone());
        if !self.is_cover {
            form = form.text("max_th_size", self.thumb_size.clone());
        }
        if let Some(gallery_hash) = &self.gallery_hash {
            form = form.text("gallery_hash", gallery_hash.clone());
        }
        if let Some(upload_hash) = &self.gallery_upload_hash {
            form = form.text("gallery_upload_hash", upload_hash.clone());
        }

        let response = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        let image_url = value
            .get("show_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                let message = value
                    .get("error_msg")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown error");
                AppError::upload_failed(format!("Pixhost API error: {}", message))
            })?
            .to_string();
        let thumb_url = value
            .get("th_url")
            .and_then(|v| v.as_str())
            .unwrap_or(&image_url)
            .to_string();

        sink.report(total, total);
        log::info!("Uploaded to Pixhost: {}", image_url);

        Ok(UploadedImage { image_url, thumb_url })
    }

    async fn validate_credentials(&self) -> AppResult<bool> {
        // Anonymous service, nothing to validate
        Ok(true)
    }

    fn credential_fields(&self) -> Vec<CredentialField> {
        Vec::new()
    }

    async fn create_gallery(
        &self,
        name: &str,
        _image_urls: &[String],
    ) -> AppResult<Option<GalleryHandle>> {
        let gallery_name = if name.trim().is_empty() { "Untitled" } else { name };

        let response = self
            .client
            .post(GALLERIES_URL)
            .form(&[("gallery_name", gallery_name)])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AppError::gallery_failed(format!(
                "Pixhost gallery create failed: {} {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        let gallery_hash = value
            .get("gallery_hash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::gallery_failed("Pixhost response missing gallery_hash"))?
            .to_string();
        let upload_hash = value
            .get("gallery_upload_hash")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        log::info!("Created Pixhost gallery {}", gallery_hash);
        Ok(Some(GalleryHandle {
            id: gallery_hash,
            upload_token: upload_hash,
        }))
    }

    async fn finalize_gallery(&self, gallery: &GalleryHandle) -> AppResult<()> {
        let Some(upload_hash) = &gallery.upload_token else {
            return Err(AppError::gallery_failed(
                "Pixhost gallery finalize requires the upload hash",
            ));
        };

        let url = format!("{}/{}/finalize", GALLERIES_URL, gallery.id);
        let response = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .form(&[("gallery_upload_hash", upload_hash.as_str())])
            .send()
            .await?;

        if response.status().is_success() {
            log::info!("Finalized Pixhost gallery {}", gallery.id);
            Ok(())
        } else {
            Err(AppError::gallery_failed(format!(
                "Pixhost gallery finalize failed: {}",
                response.status()
            )))
        }
    }
}
