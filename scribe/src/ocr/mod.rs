//! Frame-level text recognition.
//!
//! Frames pass through [`Preprocessor`] first, then through an
//! [`OcrProvider`] that borrows a [`RecognitionEngine`] from a fixed-size
//! [`EnginePool`]. The production engine is Tesseract via leptess; tests
//! plug in scripted engines through [`EngineFactory`].

mod engine;
mod pool;
mod preprocessing;
mod provider;
mod tesseract;

pub use engine::{EngineFactory, EngineOutput, LanguageHints, RecognitionEngine};
pub use pool::{EnginePool, PooledEngine};
pub use preprocessing::{encode_png, estimate_skew, Preprocessor, SkewEstimate};
pub use provider::OcrProvider;
pub use tesseract::{parse_tsv, TesseractEngine, TesseractFactory};
