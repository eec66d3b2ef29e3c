//! # biohub
//!
//! Merges many versioned source collections into one integrated document
//! collection (a *build*), computes structural diffs between builds and
//! releases them to a search index, either as a full reload or as an
//! incremental patch.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌─────────┐   ┌────────┐   ┌───────────┐
//! │ sources  │──▶│ Builder │──▶│ Differ  │──▶│ Syncer │──▶│ Publisher │
//! │ (upload) │   │ merge   │   │ patches │   │ apply  │   │ metadata  │
//! └──────────┘   └─────────┘   └─────────┘   └────────┘   └───────────┘
//!                      │             │            │             │
//!                      └─────────────┴────────────┴─────────────┘
//!                          SQLite hub database + patch directory
//! ```
//!
//! The storage-agnostic logic (merge, diff, mapping, release notes, store
//! traits) lives in `biohub-core`; this crate adds the SQLite and on-disk
//! backends, the scheduler and the pipeline components.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store traits |
//! | [`patch_store`] | JSON-lines patch files on disk |
//! | [`scheduler`] | Worker pool, configuration locks, cancellation |
//! | [`hooks`] | Named ordering hooks, builder extensions, post-merge hooks |
//! | [`builder`] | Source merging into builds |
//! | [`differ`] | Build-to-build patch computation |
//! | [`syncer`] | Patch application to collections and indices |
//! | [`publisher`] | Full and incremental releases |
//! | [`hub`] | Store wiring and the [`hub::Hub`] facade |
//! | [`progress`] | Progress reporting on stderr |
//! | [`commands`] | CLI command implementations |

pub mod builder;
pub mod commands;
pub mod config;
pub mod db;
pub mod differ;
pub mod hooks;
pub mod hub;
pub mod migrate;
pub mod patch_store;
pub mod progress;
pub mod publisher;
pub mod scheduler;
pub mod sqlite_store;
pub mod syncer;

pub use biohub_core as core;
