use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Authentication failed for {service}: {message}")]
    Authentication { service: String, message: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Upload failed: {reason}")]
    UploadFailed { reason: String },

    #[error("Gallery operation failed: {reason}")]
    GalleryFailed { reason: String },

    #[error("Failed to load plugin {path}: {reason}")]
    PluginLoad { path: String, reason: String },

    #[error("Unknown destination: {name}")]
    UnknownDestination { name: String },

    #[error("Upload cancelled during {phase}")]
    Cancelled { phase: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid file type: {path}. Allowed formats: {allowed}")]
    InvalidFileType { path: String, allowed: String },

    #[error("File too large: {path}. Maximum size is {max_mb}MB.")]
    FileTooLarge { path: String, max_mb: u64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

/// How the engine should react to a failed upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure, retry with backoff.
    Retryable,
    /// Permanent failure, surface immediately without retry.
    Terminal,
    /// Cancellation signal, distinct from exhausted-retries failure.
    Cancelled,
}

/// HTTP status codes that indicate a transient failure.
const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Keywords in unstructured error text that mark a permanent failure.
const NON_RETRYABLE_KEYWORDS: [&str; 6] = [
    "not found",
    "permission denied",
    "unauthorized",
    "forbidden",
    "invalid credentials",
    "authentication failed",
];

fn classify_status(status: u16) -> ErrorClass {
    if RETRYABLE_STATUS_CODES.contains(&status) {
        ErrorClass::Retryable
    } else if (400..500).contains(&status) {
        // 401/403 and the rest of the 4xx range are the caller's fault
        ErrorClass::Terminal
    } else {
        ErrorClass::Retryable
    }
}

fn classify_message(text: &str) -> ErrorClass {
    let lowered = text.to_lowercase();
    if NON_RETRYABLE_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        ErrorClass::Terminal
    } else {
        // Unclassified errors default to retryable
        ErrorClass::Retryable
    }
}

impl AppError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn authentication(service: &str, message: &str) -> Self {
        Self::Authentication {
            service: service.to_string(),
            message: message.to_string(),
        }
    }

    pub fn upload_failed(reason: impl Into<String>) -> Self {
        Self::UploadFailed {
            reason: reason.into(),
        }
    }

    pub fn gallery_failed(reason: impl Into<String>) -> Self {
        Self::GalleryFailed {
            reason: reason.into(),
        }
    }

    pub fn plugin_load(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::PluginLoad {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(phase: &str) -> Self {
        Self::Cancelled {
            phase: phase.to_string(),
        }
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::FileNotFound {
            path: path.to_string(),
        }
    }

    pub fn unknown_destination(name: &str) -> Self {
        Self::UnknownDestination {
            name: name.to_string(),
        }
    }

    /// Classify this error for the retry engine.
    ///
    /// Structured HTTP status codes are preferred; keyword matching on the
    /// message text is the fallback for unstructured failures only.
    pub fn classify(&self) -> ErrorClass {
        match self {
            AppError::Cancelled { .. } => ErrorClass::Cancelled,
            AppError::Network(e) => {
                if let Some(status) = e.status() {
                    classify_status(status.as_u16())
                } else {
                    // Connect/timeout/reset errors carry no status code
                    ErrorClass::Retryable
                }
            }
            AppError::HttpStatus { status, .. } => classify_status(*status),
            AppError::Authentication { .. }
            | AppError::Validation { .. }
            | AppError::PluginLoad { .. }
            | AppError::UnknownDestination { .. }
            | AppError::FileNotFound { .. }
            | AppError::InvalidFileType { .. }
            | AppError::FileTooLarge { .. }
            | AppError::Image(_)
            | AppError::Config(_) => ErrorClass::Terminal,
            AppError::Io(_) | AppError::Json(_) => ErrorClass::Retryable,
            AppError::UploadFailed { reason } | AppError::GalleryFailed { reason } => {
                classify_message(reason)
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Retryable
    }

    pub fn is_permanent(&self) -> bool {
        self.classify() == ErrorClass::Terminal
    }
}

impl From<AppError> for String {
    fn from(error: AppError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status_codes() {
        for status in [408, 429, 500, 502, 503, 504] {
            let err = AppError::HttpStatus {
                status,
                body: String::new(),
            };
            assert_eq!(err.classify(), ErrorClass::Retryable, "status {}", status);
        }
    }

    #[test]
    fn test_auth_status_codes_are_terminal() {
        for status in [401, 403, 404, 410, 422] {
            let err = AppError::HttpStatus {
                status,
                body: String::new(),
            };
            assert_eq!(err.classify(), ErrorClass::Terminal, "status {}", status);
        }
    }

    #[test]
    fn test_unlisted_server_errors_default_to_retryable() {
        let err = AppError::HttpStatus {
            status: 501,
            body: String::new(),
        };
        assert_eq!(err.classify(), ErrorClass::Retryable);
    }

    #[test]
    fn test_message_keyword_fallback() {
        let terminal = AppError::upload_failed("image not found on remote");
        assert_eq!(terminal.classify(), ErrorClass::Terminal);

        let terminal = AppError::upload_failed("Authentication failed: bad key");
        assert_eq!(terminal.classify(), ErrorClass::Terminal);

        let retryable = AppError::upload_failed("connection reset by peer");
        assert_eq!(retryable.classify(), ErrorClass::Retryable);

        // Unclassified messages default to retryable
        let unknown = AppError::upload_failed("something odd happened");
        assert_eq!(unknown.classify(), ErrorClass::Retryable);
    }

    #[test]
    fn test_cancellation_is_distinct() {
        let err = AppError::cancelled("upload attempt");
        assert_eq!(err.classify(), ErrorClass::Cancelled);
        assert!(!err.is_retryable());
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_validation_is_permanent() {
        let err = AppError::validation("concurrency_limit", "must be at least 1");
        assert!(err.is_permanent());
    }
}
