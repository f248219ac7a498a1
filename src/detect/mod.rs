mod backend;
mod backends;
mod registry;
mod result;
pub mod yolo;

pub use backend::ObjectDetector;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{BackendRegistry, SharedDetector};
pub use result::{BoundingBox, Detection};
