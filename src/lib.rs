//! docsift - confidence-scored extraction from scanned documents.
//!
//! Documents (PDF or images) go through an ordered pipeline: a multi-engine
//! OCR ensemble, form field detection, confidence scoring and validation.
//! Results can be exported and used to learn layout templates that guide
//! later documents of the same form.

#![allow(clippy::should_implement_trait)]

pub mod analysis;
pub mod config;
pub mod error;
pub mod export;
pub mod jobs;
pub mod models;
pub mod ocr;
pub mod work_queue;
