//! Scribe: OCR extraction for uploaded images and video.
//!
//! An upload is stored in scratch space, decoded into frames, cleaned up
//! for recognition, read by a pooled Tesseract engine, and merged into a
//! single [`models::ExtractionResult`]. Scratch files never outlive the
//! request that created them.

pub mod api;
pub mod config;
pub mod decode;
pub mod error;
pub mod models;
pub mod ocr;
pub mod processing;
pub mod storage;
