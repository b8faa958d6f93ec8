// src/lib.rs

//! Appcatalog
//!
//! Aggregates application catalogs published by several independent
//! repositories into one local SQLite store and resolves, per package,
//! which repository's metadata to show and which version to offer.
//!
//! # Architecture
//!
//! - Database-first: repositories, preferences and installed state live in SQLite
//! - Staged syncs: an index is applied in an attached in-memory database and
//!   swapped into the catalog in one transaction
//! - Priority resolution: the enabled repository with the highest priority
//!   wins a package; ties go to the oldest repository
//! - Suggested versions: derived per repository from signer, compatibility
//!   and the upstream stable version code

pub mod catalog;
pub mod compat;
pub mod config;
pub mod db;
mod error;
pub mod notify;
pub mod query;
pub mod repository;
pub mod resolver;

pub use catalog::Catalog;
pub use config::Config;
pub use error::{Error, Result};
