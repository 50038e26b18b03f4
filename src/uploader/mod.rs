pub mod coordinator;
pub mod engine;
pub mod retry;
pub mod types;

pub use coordinator::{BatchEvents, UploadCoordinator};
pub use engine::{BatchHandle, EngineEvent, UploadEngine};
pub use retry::RetryPolicy;
pub use types::{BatchSettings, FileGroup, FileTask, TaskState, UploadOutcome};
