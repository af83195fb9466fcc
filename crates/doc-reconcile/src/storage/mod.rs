//! Persistent storage layer
//!
//! SQLite-based metadata store for document records and processing logs.

mod database;

pub use database::SqliteMetadataStore;
