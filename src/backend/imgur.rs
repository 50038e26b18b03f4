use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::contract::{
    BackendCapabilities, BackendDescriptor, CredentialField, Credentials, GalleryHandle,
    ImageHostBackend, ProgressSink, UploadedImage,
};
use crate::errors::{AppError, AppResult};

const API_BASE: &str = "https://api.imgur.com/3";

/// Imgur backend using the anonymous client-id API.
pub struct ImgurBackend {
    client_id: String,
    capabilities: BackendCapabilities,
    client: reqwest::Client,
}

pub fn descriptor() -> BackendDescriptor {
    BackendDescriptor {
        name: "Imgur".to_string(),
        version: "1.0.0".to_string(),
        author: "builtin".to_string(),
        description: "Upload images to Imgur.com with album support".to_string(),
        service_url: "https://imgur.com".to_string(),
        capabilities: capabilities(),
        factory: Arc::new(|credentials, _config| Ok(Box::new(ImgurBackend::new(credentials)?))),
    }
}

fn capabilities() -> BackendCapabilities {
    BackendCapabilities {
        supports_galleries: true,
        requires_authentication: true,
        max_concurrent_uploads: 5,
        max_file_size_mb: 20,
        allowed_formats: ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

impl ImgurBackend {
    pub fn new(credentials: &Credentials) -> AppResult<Self> {
        let client_id = credentials.get("client_id").cloned().unwrap_or_default();
        if client_id.trim().is_empty() {
            log::warn!("Imgur backend initialized without client_id");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client_id,
            capabilities: capabilities(),
            client,
        })
    }

    fn auth_header(&self) -> String {
        format!("Client-ID {}", self.client_id)
    }

    fn parse_error(body: &str, status: u16) -> String {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            if let Some(error) = value.pointer("/data/error").and_then(|v| v.as_str()) {
                return error.to_string();
            }
            if let Some(error) = value.get("error") {
                return error.to_string();
            }
        }
        format!("HTTP {}", status)
    }
}

/// Imgur CDN serves size variants by suffix: abc.jpg -> abcm.jpg is the
/// medium thumbnail.
fn medium_thumb_url(image_url: &str) -> String {
    match image_url.rsplit_once('.') {
        Some((base, ext)) => format!("{}m.{}", base, ext),
        None => image_url.to_string(),
    }
}

/// Pull the bare image id out of an Imgur URL, stripping any size suffix.
fn image_id_from_url(url: &str) -> Option<String> {
    let filename = url.rsplit('/').next()?;
    let id = filename.split('.').next()?.trim_end_matches(['m', 'l', 't', 's', 'h']);
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[async_trait]
impl ImageHostBackend for ImgurBackend {
    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    async fn upload(&self, path: &Path, sink: &ProgressSink) -> AppResult<UploadedImage> {
        if self.client_id.trim().is_empty() {
            return Err(AppError::authentication("Imgur", "client_id not configured"));
        }
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
        let stem = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        log::debug!("Uploading {} to Imgur ({} bytes)", filename, total);

        let form = reqwest::multipart::Form::new()
            .part(
                "image",
                reqwest::multipart::Part::bytes(bytes).file_name(filename),
            )
            .text("type", "file")
            .text("name", stem.clone())
            .text("title", stem);

        let response = self
            .client
            .post(format!("{}/image", API_BASE))
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                body: Self::parse_error(&body, status.as_u16()),
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        if !value.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Err(AppError::upload_failed("Imgur API returned success=false"));
        }
        let image_url = value
            .pointer("/data/link")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::upload_failed("Imgur response missing data.link"))?
            .to_string();

        sink.report(total, total);
        log::info!("Uploaded to Imgur: {}", image_url);

        Ok(UploadedImage {
            thumb_url: medium_thumb_url(&image_url),
            image_url,
        })
    }

    async fn validate_credentials(&self) -> AppResult<bool> {
        if self.client_id.trim().is_empty() {
            return Ok(false);
        }

        let response = self
            .client
            .get(format!("{}/credits", API_BASE))
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        if !response.status().is_success() {
            log::warn!("Imgur credential validation failed: {}", response.status());
            return Ok(false);
        }

        let value: serde_json::Value = response.json().await?;
        let valid = value.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        if valid {
            log::debug!(
                "Imgur credits remaining: {:?}/{:?}",
                value.pointer("/data/ClientRemaining"),
                value.pointer("/data/ClientLimit")
            );
        }
        Ok(valid)
    }

    fn credential_fields(&self) -> Vec<CredentialField> {
        vec![CredentialField {
            name: "client_id".to_string(),
            label: "Imgur Client ID".to_string(),
            secret: true,
            required: true,
            help_text: Some(
                "Register your application at api.imgur.com to get a Client ID".to_string(),
            ),
        }]
    }

    async fn create_gallery(
        &self,
        name: &str,
        image_urls: &[String],
    ) -> AppResult<Option<GalleryHandle>> {
        let image_ids: Vec<String> = image_urls.iter().filter_map(|u| image_id_from_url(u)).collect();

        log::debug!("Creating Imgur album '{}' with {} images", name, image_ids.len());

        let response = self
            .client
            .post(format!("{}/album", API_BASE))
            .header("Authorization", self.auth_header())
            .form(&[
                ("title", name.to_string()),
                ("ids", image_ids.join(",")),
                ("privacy", "public".to_string()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AppError::gallery_failed(Self::parse_error(&body, status.as_u16())));
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        if !value.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Err(AppError::gallery_failed("Imgur API returned success=false"));
        }
        let album_id = value
            .pointer("/data/id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::gallery_failed("Imgur album response missing data.id"))?
            .to_string();

        log::info!("Created Imgur album: https://imgur.com/a/{}", album_id);
        Ok(Some(GalleryHandle {
            id: album_id,
            upload_token: None,
        }))
    }

    async fn delete_image(&self, image_url: &str) -> AppResult<bool> {
        // Anonymous deletion needs the deletehash from the upload response,
        // which is not retained. TODO: carry backend metadata through
        // UploadOutcome so deletehash survives the batch.
        log::warn!("Cannot delete Imgur image without deletehash: {}", image_url);
        Ok(false)
    }
}
