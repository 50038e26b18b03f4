pub mod catbox;
pub mod contract;
pub mod imgur;
pub mod manifest;
pub mod pixhost;
pub mod registry;

pub use contract::{
    BackendCapabilities, BackendDescriptor, BackendFactory, CredentialField, Credentials,
    GalleryHandle, ImageHostBackend, ProgressSink, UploadedImage,
};
pub use registry::BackendRegistry;
