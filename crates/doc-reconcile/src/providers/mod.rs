//! Provider abstractions for the collaborators the core consumes
//!
//! The object store, metadata store and extraction job are reached only
//! through these traits, so local, in-memory and remote backends swap freely.

pub mod extraction;
pub mod http_job;
pub mod local;
pub mod memory;
pub mod metadata_store;
pub mod object_store;

pub use extraction::ExtractionJobProvider;
pub use http_job::HttpExtractionJob;
pub use local::LocalObjectStore;
pub use memory::{FailureBudget, InMemoryExtractionJob, InMemoryMetadataStore, InMemoryObjectStore};
pub use metadata_store::{
    ChangeEvent, ChangeType, LogLevel, MetadataStoreProvider, ProcessingLogEntry,
};
pub use object_store::{ObjectInfo, ObjectStoreProvider};
