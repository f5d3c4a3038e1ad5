//! # Ingest Harness
//!
//! Incremental document ingestion with a durable vector index and a
//! paginated ingestion ledger.
//!
//! A scan walks a source directory, fingerprints every file, and only chunks
//! and embeds files whose content changed since the last successful ingest.
//! Vectors land in a crash-safe on-disk index; every file's outcome lands in
//! an append-only ledger that can be paged through most-recent-first.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────────┐
//! │ connector_fs│──▶│ change (hash │──▶│ chunk + embed  │
//! │  (walkdir)  │   │  + mtime)    │   │                │
//! └─────────────┘   └──────┬───────┘   └───────┬────────┘
//!                          │ skip              ▼
//!                          │          ┌────────────────┐
//!                          │          │ index (vectors │
//!                          │          │ + manifest)    │
//!                          ▼          └───────┬────────┘
//!                   ┌──────────────────────────┴──────┐
//!                   │ SQLite: fingerprints + ledger    │
//!                   └──────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ingest init
//! ingest preview --source ./docs
//! ingest scan --source ./docs --type md --type txt
//! ingest stats --page 1
//! ingest search "deployment checklist"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`fingerprint`] | SHA-256 content fingerprints |
//! | [`change`] | NEW / MODIFIED / UNCHANGED classification |
//! | [`storage`] | Blob storage behind the index |
//! | [`index`] | Durable vector index and search backends |
//! | [`ledger`] | Append-only, paginated outcome records |
//! | [`preview`] | Side-effect-free dry run |
//! | [`coordinator`] | Scan orchestration |
//! | [`connector_fs`] | Filesystem enumerator |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`progress`] | Scan progress on stderr |
//! | [`stats`] | Ledger page rendering |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod change;
pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod coordinator;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod preview;
pub mod progress;
pub mod stats;
pub mod storage;

pub use coordinator::{CancelFlag, IngestionCoordinator};
pub use error::{IngestError, Result};
