use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::contract::{
    BackendCapabilities, BackendDescriptor, CredentialField, Credentials, ImageHostBackend,
    ProgressSink, UploadedImage,
};
use crate::errors::{AppError, AppResult};

/// Declarative description of a third-party destination, loaded from a
/// `*_plugin.json` file. Each file must contain a JSON array with exactly
/// one definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub service_url: String,
    #[serde(default)]
    pub capabilities: BackendCapabilities,
    #[serde(default)]
    pub credential_fields: Vec<ManifestCredentialField>,
    pub upload: UploadSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestCredentialField {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub help_text: Option<String>,
}

/// How to perform the upload request and read its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSpec {
    pub url: String,
    /// Multipart field carrying the file bytes.
    pub file_field: String,
    /// Static form fields. Values support `{filename}`, `{stem}` and
    /// `{credential:key}` placeholders.
    #[serde(default)]
    pub fields: std::collections::HashMap<String, String>,
    /// Header name -> value, same placeholder rules as `fields`.
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    pub response: ResponseSpec,
}

/// Where the image and thumbnail URLs live in the upload response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum ResponseSpec {
    /// Response body is the image URL as plain text.
    Text {
        #[serde(default)]
        thumb_suffix: Option<String>,
    },
    /// Response body is JSON; pointers use RFC 6901 syntax.
    Json {
        url_pointer: String,
        #[serde(default)]
        thumb_pointer: Option<String>,
        #[serde(default)]
        thumb_suffix: Option<String>,
    },
}

/// Read one manifest file into a registry descriptor.
pub fn load_manifest(path: &Path) -> AppResult<BackendDescriptor> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| AppError::plugin_load(path, format!("cannot read file: {}", e)))?;

    let definitions: Vec<BackendManifest> = serde_json::from_str(&text)
        .map_err(|e| AppError::plugin_load(path, format!("invalid JSON: {}", e)))?;

    if definitions.len() != 1 {
        return Err(AppError::plugin_load(
            path,
            format!("expected exactly one definition, found {}", definitions.len()),
        ));
    }
    let manifest = definitions.into_iter().next().unwrap();
    validate_manifest(&manifest).map_err(|reason| AppError::plugin_load(path, reason))?;

    Ok(descriptor_from_manifest(manifest, path.to_path_buf()))
}

fn validate_manifest(manifest: &BackendManifest) -> Result<(), String> {
    if manifest.name.trim().is_empty() {
        return Err("name must not be empty".to_string());
    }
    if manifest.version.trim().is_empty() {
        return Err("version must not be empty".to_string());
    }
    if manifest.upload.url.trim().is_empty() {
        return Err("upload.url must not be empty".to_string());
    }
    if manifest.upload.file_field.trim().is_empty() {
        return Err("upload.file_field must not be empty".to_string());
    }
    Ok(())
}

fn descriptor_from_manifest(manifest: BackendManifest, source: PathBuf) -> BackendDescriptor {
    let capabilities = manifest.capabilities.clone();
    let descriptor_manifest = manifest.clone();

    BackendDescriptor {
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        author: manifest.author.clone(),
        description: manifest.description.clone(),
        service_url: manifest.service_url.clone(),
        capabilities,
        factory: std::sync::Arc::new(move |credentials, _config| {
            Ok(Box::new(ManifestBackend::new(
                descriptor_manifest.clone(),
                credentials.clone(),
                source.clone(),
            )?))
        }),
    }
}

/// Generic HTTP backend driven entirely by a manifest.
pub struct ManifestBackend {
    manifest: BackendManifest,
    credentials: Credentials,
    client: reqwest::Client,
    source: PathBuf,
}

impl ManifestBackend {
    fn new(manifest: BackendManifest, credentials: Credentials, source: PathBuf) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            manifest,
            credentials,
            client,
            source,
        })
    }

    fn substitute(&self, template: &str, path: &Path) -> String {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut out = template
            .replace("{filename}", &filename)
            .replace("{stem}", &stem);
        for (key, value) in &self.credentials {
            out = out.replace(&format!("{{credential:{}}}", key), value);
        }
        out
    }

    fn extract_urls(&self, body: &str) -> AppResult<UploadedImage> {
        match &self.manifest.upload.response {
            ResponseSpec::Text { thumb_suffix } => {
                let image_url = body.trim().to_string();
                if !image_url.starts_with("http") {
                    return Err(AppError::upload_failed(format!(
                        "{} returned unexpected body: {}",
                        self.manifest.name,
                        body.chars().take(200).collect::<String>()
                    )));
                }
                let thumb_url = apply_thumb_suffix(&image_url, thumb_suffix.as_deref());
                Ok(UploadedImage { image_url, thumb_url })
            }
            ResponseSpec::Json {
                url_pointer,
                thumb_pointer,
                thumb_suffix,
            } => {
                let value: serde_json::Value = serde_json::from_str(body)?;
                let image_url = value
                    .pointer(url_pointer)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        AppError::upload_failed(format!(
                            "{} response missing {}",
                            self.manifest.name, url_pointer
                        ))
                    })?
                    .to_string();

                let thumb_url = match thumb_pointer {
                    Some(pointer) => value
                        .pointer(pointer)
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| image_url.clone()),
                    None => apply_thumb_suffix(&image_url, thumb_suffix.as_deref()),
                };

                Ok(UploadedImage { image_url, thumb_url })
            }
        }
    }
}

/// Insert a CDN size suffix before the extension, the common pattern for
/// thumbnail variants (abc.jpg -> abcm.jpg).
fn apply_thumb_suffix(image_url: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => match image_url.rsplit_once('.') {
            Some((base, ext)) => format!("{}{}.{}", base, suffix, ext),
            None => image_url.to_string(),
        },
        None => image_url.to_string(),
    }
}

#[async_trait]
impl ImageHostBackend for ManifestBackend {
    fn capabilities(&self) -> &BackendCapabilities {
        &self.manifest.capabilities
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

        let mut form = reqwest::multipart::Form::new().part(
            self.manifest.upload.file_field.clone(),
            reqwest::multipart::Part::bytes(bytes).file_name(filename),
        );
        for (field, template) in &self.manifest.upload.fields {
            form = form.text(field.clone(), self.substitute(template, path));
        }

        let mut request = self
            .client
            .post(self.substitute(&self.manifest.upload.url, path))
            .multipart(form);
        for (header, template) in &self.manifest.upload.headers {
            request = request.header(header.as_str(), self.substitute(template, path));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        if !sink.report(total, total) {
            log::debug!(
                "Upload of {} completed after cancellation, keeping result",
                path.display()
            );
        }

        self.extract_urls(&body)
    }

    async fn validate_credentials(&self) -> AppResult<bool> {
        // Manifests declare required fields; presence is all we can check
        // without a service-specific probe endpoint.
        for field in &self.manifest.credential_fields {
            if field.required
                && self
                    .credentials
                    .get(&field.name)
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
            {
                log::warn!(
                    "Plugin {} ({}) missing required credential '{}'",
                    self.manifest.name,
                    self.source.display(),
                    field.name
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn credential_fields(&self) -> Vec<CredentialField> {
        self.manifest
            .credential_fields
            .iter()
            .map(|f| CredentialField {
                name: f.name.clone(),
                label: f.label.clone(),
                secret: f.secret,
                required: f.required,
                help_text: f.help_text.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    const VALID: &str = r#"[{
        "name": "ExampleHost",
        "version": "1.0.0",
        "upload": {
            "url": "https://example.test/api/upload",
            "file_field": "img",
            "fields": {"key": "{credential:api_key}"},
            "response": {"format": "text", "thumb_suffix": "t"}
        }
    }]"#;

    #[test]
    fn test_load_valid_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "example_plugin.json", VALID);
        let descriptor = load_manifest(&path).unwrap();
        assert_eq!(descriptor.name, "ExampleHost");
        assert_eq!(descriptor.version, "1.0.0");
    }

    #[test]
    fn test_rejects_multiple_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let two = format!("[{0},{0}]", VALID.trim_start_matches('[').trim_end_matches(']'));
        let path = write_manifest(dir.path(), "two_plugin.json", &two);
        let err = load_manifest(&path).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let body = VALID.replace("ExampleHost", "  ");
        let path = write_manifest(dir.path(), "blank_plugin.json", &body);
        assert!(load_manifest(&path).is_err());
    }

    #[test]
    fn test_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "broken_plugin.json", "{not json");
        assert!(load_manifest(&path).is_err());
    }

    #[test]
    fn test_thumb_suffix_insertion() {
        assert_eq!(
            apply_thumb_suffix("https://i.example/abc.jpg", Some("m")),
            "https://i.example/abcm.jpg"
        );
        assert_eq!(
            apply_thumb_suffix("https://i.example/abc", Some("m")),
            "https://i.example/abc"
        );
        assert_eq!(
            apply_thumb_suffix("https://i.example/abc.jpg", None),
            "https://i.example/abc.jpg"
        );
    }
}
