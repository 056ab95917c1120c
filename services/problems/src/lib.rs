//! Problem Service
//!
//! Backend for posting problems with optional file attachments. Problems are
//! kept in a record store (PostgreSQL or in-memory) and attachments are
//! mirrored to an object store (S3 or in-memory) under their filenames.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP (axum)              Problem Service            Stores
//! ┌──────────────┐         ┌──────────────┐          ┌──────────────┐
//! │ /problems    │────────▶│ validate     │─────────▶│ ObjectStore  │
//! │ /upload      │         │ upload files │          │ (S3/memory)  │
//! │ /files       │         │ insert       │          └──────────────┘
//! │ /download/*  │         └──────────────┘          ┌──────────────┐
//! └──────────────┘                │─────────────────▶│ ProblemStore │
//!                                                    │ (PG/memory)  │
//!                                                    └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod object_store;
pub mod record_store;
pub mod service;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use error::{ProblemError, StartupError};
pub use models::{FileUpload, Problem, StoredObject};
pub use object_store::{MemoryObjectStore, ObjectStore, S3ObjectStore};
pub use record_store::{MemoryProblemStore, PgProblemStore, ProblemStore};
pub use service::ProblemService;
