pub mod extract;
pub(crate) mod health;

pub use extract::{extract_multipart, extract_raw};
pub use health::health_check;
