//! Core types for document records

pub mod document;

pub use document::{
    DocumentKind, DocumentRecord, ExtractionResult, RecordFilter, RecordPatch, ReviewFlags,
    ReviewStatus,
};
