//! # biohub core
//!
//! Storage-agnostic logic of the build → diff → release pipeline: data
//! models, conflict-policy merging, merge-order resolution, structural
//! document diffs, mapping inspection and release notes, plus the store
//! traits the pipeline runs against.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other runtime
//! dependencies. The `biohub` crate supplies the SQLite and on-disk
//! backends and the orchestration on top.
//!
//! ```text
//! sources ──merge──▶ build N ──diff(N-1, N)──▶ patch files ──sync──▶ index
//!                       │                            │
//!                       └────────── release note ◀───┘
//! ```

pub mod cancel;
pub mod diff;
pub mod error;
pub mod fieldpath;
pub mod mapping;
pub mod merge;
pub mod models;
pub mod order;
pub mod release_note;
pub mod store;

pub use error::{ErrorReport, HubError, Result};
