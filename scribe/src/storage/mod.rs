//! Scratch storage for uploads and the files derived from them.

mod store;
mod sweep;

pub use store::{ArtifactLease, ArtifactStore, IntermediateWriter, ReleaseReport, SCRATCH_PREFIX};
pub use sweep::OrphanSweeper;
