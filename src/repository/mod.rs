// src/repository/mod.rs

//! Repository management and synchronization
//!
//! This module provides functionality for:
//! - Adding, removing, enabling and re-prioritizing repositories
//! - Deciding when a repository's index is due for a refresh
//! - Applying a verified index to the catalog (see [`sync`])
//!
//! Every settings change that can alter which repository wins a package
//! re-derives preferred metadata in the same transaction.

pub mod index;
pub mod sync;

pub use index::{IndexEntry, IndexVersion, RepoIndex};
pub use sync::{NameCache, RepoSync, SyncReport, sync_repository};

use crate::db;
use crate::db::models::Repository;
use crate::error::{Error, Result};
use crate::resolver;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// SHA-256 fingerprint of a hex-encoded signing certificate, lower-case hex
pub fn fingerprint(certificate_hex: &str) -> Result<String> {
    let bytes = hex::decode(certificate_hex.trim())
        .map_err(|e| Error::ParseError(format!("Invalid certificate encoding: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Add a new repository to the database
pub fn add_repository(
    conn: &Connection,
    name: String,
    address: String,
    certificate: Option<String>,
    enabled: bool,
    priority: i32,
) -> Result<Repository> {
    if Repository::find_by_name(conn, &name)?.is_some() {
        return Err(Error::ConflictError(format!(
            "Repository '{}' already exists",
            name
        )));
    }
    if Repository::list_all(conn)?
        .iter()
        .any(|r| r.address == address)
    {
        return Err(Error::ConflictError(format!(
            "A repository at '{}' already exists",
            address
        )));
    }

    let mut repo = Repository::new(name, address);
    repo.fingerprint = certificate.as_deref().map(fingerprint).transpose()?;
    repo.certificate = certificate;
    repo.enabled = enabled;
    repo.priority = priority;

    repo.insert(conn)?;

    info!("Added repository: {} ({})", repo.name, repo.address);
    Ok(repo)
}

/// Look up a repository by name or fail with NotFoundError
pub fn find_repository(conn: &Connection, name: &str) -> Result<Repository> {
    Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' not found", name)))
}

/// Ids of every package a repository currently offers
pub fn offered_package_ids(conn: &Connection, repo_id: i64) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT package_id FROM app_metadata WHERE repo_id = ?1 ORDER BY package_id")?;

    let ids = stmt
        .query_map([repo_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ids)
}

/// Remove a repository and everything it published
///
/// Returns the ids of the packages it offered, whose preferred metadata has
/// been re-derived.
pub fn remove_repository(conn: &mut Connection, name: &str) -> Result<Vec<i64>> {
    let affected = db::transaction(conn, |tx| {
        let repo = find_repository(tx, name)?;
        let repo_id = repo.id.ok_or_else(|| {
            Error::InitError("Repository loaded without ID".to_string())
        })?;

        let affected = offered_package_ids(tx, repo_id)?;
        Repository::delete(tx, repo_id)?;
        resolver::update_preferred_metadata(tx, &affected)?;
        Ok(affected)
    })?;

    info!(
        "Removed repository: {} ({} packages affected)",
        name,
        affected.len()
    );
    Ok(affected)
}

/// Enable or disable a repository
///
/// Returns the ids of the packages it offers.
pub fn set_repository_enabled(
    conn: &mut Connection,
    name: &str,
    enabled: bool,
) -> Result<Vec<i64>> {
    let affected = update_settings(conn, name, |repo| repo.enabled = enabled)?;

    info!(
        "Repository '{}' {}",
        name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(affected)
}

/// Change a repository's priority
///
/// Returns the ids of the packages it offers.
pub fn set_repository_priority(
    conn: &mut Connection,
    name: &str,
    priority: i32,
) -> Result<Vec<i64>> {
    let affected = update_settings(conn, name, |repo| repo.priority = priority)?;

    info!("Repository '{}' priority set to {}", name, priority);
    Ok(affected)
}

fn update_settings<F>(conn: &mut Connection, name: &str, edit: F) -> Result<Vec<i64>>
where
    F: FnOnce(&mut Repository),
{
    db::transaction(conn, |tx| {
        let mut repo = find_repository(tx, name)?;
        edit(&mut repo);
        repo.update(tx)?;

        let repo_id = repo.id.ok_or_else(|| {
            Error::InitError("Repository loaded without ID".to_string())
        })?;
        let affected = offered_package_ids(tx, repo_id)?;
        let changed = resolver::update_preferred_metadata(tx, &affected)?;
        debug!("{} preferred metadata rows changed", changed);
        Ok(affected)
    })
}

/// Check if a repository's index is due for a refresh
pub fn needs_sync(repo: &Repository) -> bool {
    match &repo.last_sync {
        None => true, // Never synced
        Some(last_sync) => match parse_timestamp(last_sync) {
            Ok(last_sync_time) => {
                let age = Utc::now().signed_duration_since(last_sync_time);
                age.num_seconds() > repo.max_age
            }
            Err(_) => true, // If we can't parse timestamp, force sync
        },
    }
}

/// Get current timestamp as RFC 3339 string
pub(crate) fn current_timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 timestamp
fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| Error::ParseError(format!("Invalid timestamp: {}", e)))?;

    Ok(dt.with_timezone(&Utc))
}
