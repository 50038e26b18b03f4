//! Concurrent multi-destination image upload engine.
//!
//! The crate is organized around three layers:
//!
//! - [`backend`]: the destination contract, the built-in services
//!   (Catbox, Imgur, Pixhost) and manifest-defined plugins, all reached
//!   through [`backend::BackendRegistry`].
//! - [`uploader`]: the concurrency and retry engine plus the
//!   [`uploader::UploadCoordinator`] that owns batch state, history and
//!   output generation.
//! - Supporting modules: [`cache`] for thumbnail previews, [`history`]
//!   for per-session records, [`output`] for postable text documents.

pub mod backend;
pub mod cache;
pub mod config;
pub mod errors;
pub mod history;
pub mod output;
pub mod reporting;
pub mod uploader;

pub use errors::{AppError, AppResult};
