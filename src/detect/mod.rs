mod adapter;
mod annotate;
mod backend;
mod backends;
mod registry;
mod result;

pub use adapter::{Detector, FrameOutcome};
pub use annotate::Annotator;
pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::{CpuBackend, StubBackend};
pub use registry::BackendRegistry;
pub use result::{BoundingBox, Detection, DetectionBatch};
