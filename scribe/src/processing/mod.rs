mod admission;
mod pipeline;

pub use admission::Admission;
pub use pipeline::{ExtractionOrchestrator, ExtractionPhase, ExtractionRequest};
