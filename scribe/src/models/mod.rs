mod artifact;
mod extraction;
mod frame;
mod recognition;

pub use artifact::*;
pub use extraction::*;
pub use frame::*;
pub use recognition::*;
