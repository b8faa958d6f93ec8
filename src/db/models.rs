// src/db/models.rs

//! Data models for catalog database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.
//! Metadata and version rows can be written to either the primary catalog
//! (`main`) or the staging copy a sync builds (`staging`); the methods that
//! need to do both take the schema name explicitly.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, ffi, params};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

/// Schema name of the primary catalog tables
pub const MAIN: &str = "main";

/// Anti-feature tag marking a version with a known security vulnerability
pub const KNOWN_VULN: &str = "KnownVuln";

/// Encode a list column as JSON text (NULL when empty)
pub(crate) fn to_json<T: Serialize>(list: &[T]) -> Result<Option<String>> {
    if list.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(list)?))
}

/// Decode a JSON list column, treating NULL as an empty list
fn from_json<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Vec<T>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(Vec::new()),
        Some(text) => serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        }),
    }
}

/// True if the error is a UNIQUE violation
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Repository represents one independently operated index source
#[derive(Debug, Clone)]
pub struct Repository {
    pub id: Option<i64>,
    pub name: String,
    pub address: String,
    pub certificate: Option<String>,
    pub fingerprint: Option<String>,
    pub enabled: bool,
    pub priority: i32,
    pub max_age: i64,
    pub sync_token: Option<String>,
    pub last_sync: Option<String>,
    pub created_at: Option<String>,
}

impl Repository {
    /// Create a new Repository
    pub fn new(name: String, address: String) -> Self {
        Self {
            id: None,
            name,
            address,
            certificate: None,
            fingerprint: None,
            enabled: true,
            priority: 0,
            max_age: 86400, // Default: 1 day
            sync_token: None,
            last_sync: None,
            created_at: None,
        }
    }

    /// Insert this repository into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO repositories
                (name, address, certificate, fingerprint, enabled, priority, max_age)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &self.name,
                &self.address,
                &self.certificate,
                &self.fingerprint,
                self.enabled as i32,
                &self.priority,
                &self.max_age,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a repository by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, address, certificate, fingerprint, enabled, priority, max_age,
                    sync_token, last_sync, created_at
             FROM repositories WHERE id = ?1",
        )?;

        let repo = stmt.query_row([id], Self::from_row).optional()?;

        Ok(repo)
    }

    /// Find a repository by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, address, certificate, fingerprint, enabled, priority, max_age,
                    sync_token, last_sync, created_at
             FROM repositories WHERE name = ?1",
        )?;

        let repo = stmt.query_row([name], Self::from_row).optional()?;

        Ok(repo)
    }

    /// List all repositories, most preferred first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, address, certificate, fingerprint, enabled, priority, max_age,
                    sync_token, last_sync, created_at
             FROM repositories ORDER BY priority DESC, id",
        )?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// List enabled repositories, most preferred first
    pub fn list_enabled(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, address, certificate, fingerprint, enabled, priority, max_age,
                    sync_token, last_sync, created_at
             FROM repositories WHERE enabled = 1 ORDER BY priority DESC, id",
        )?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// Update repository settings and sync state
    pub fn update(&self, conn: &Connection) -> Result<()> {
        let id = self.id.ok_or_else(|| {
            Error::InitError("Cannot update repository without ID".to_string())
        })?;

        conn.execute(
            "UPDATE repositories SET name = ?1, address = ?2, certificate = ?3, fingerprint = ?4,
             enabled = ?5, priority = ?6, max_age = ?7, sync_token = ?8, last_sync = ?9
             WHERE id = ?10",
            params![
                &self.name,
                &self.address,
                &self.certificate,
                &self.fingerprint,
                self.enabled as i32,
                &self.priority,
                &self.max_age,
                &self.sync_token,
                &self.last_sync,
                id,
            ],
        )?;

        Ok(())
    }

    /// True if `token` is the one recorded by the last successful sync
    pub fn token_matches(&self, token: Option<&str>) -> bool {
        token.is_some() && token == self.sync_token.as_deref()
    }

    /// Record a successful sync
    pub fn mark_synced(conn: &Connection, id: i64, token: Option<&str>, at: &str) -> Result<()> {
        conn.execute(
            "UPDATE repositories SET sync_token = ?1, last_sync = ?2 WHERE id = ?3",
            params![token, at, id],
        )?;
        Ok(())
    }

    /// Delete a repository by ID
    ///
    /// Metadata, versions and category membership cascade with it.
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM repositories WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to a Repository
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            address: row.get(2)?,
            certificate: row.get(3)?,
            fingerprint: row.get(4)?,
            enabled: row.get::<_, i32>(5)? != 0,
            priority: row.get(6)?,
            max_age: row.get(7)?,
            sync_token: row.get(8)?,
            last_sync: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}

/// A Package is a globally unique package name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: i64,
    pub name: String,
    /// Repository whose metadata row is currently preferred, if any
    pub preferred_repo_id: Option<i64>,
}

impl Package {
    /// Return the id for `name`, inserting the package if it is new
    ///
    /// Tolerates a concurrent writer inserting the same name first: a
    /// uniqueness violation just means the row exists, so it is re-read.
    pub fn ensure_exists(conn: &Connection, name: &str) -> Result<i64> {
        if let Some(id) = Self::find_id(conn, name)? {
            return Ok(id);
        }
        Self::allocate(conn, name)
    }

    /// Insert `name`, re-reading its id if another writer inserted it first
    pub(crate) fn allocate(conn: &Connection, name: &str) -> Result<i64> {
        match conn.execute("INSERT INTO packages (name) VALUES (?1)", [name]) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => {
                debug!("Package {} allocated concurrently, re-reading", name);
                Self::find_id(conn, name)?.ok_or_else(|| {
                    Error::NotFoundError(format!("Package '{}' vanished after insert race", name))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up only the id of a package
    pub fn find_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
        let id = conn
            .query_row("SELECT id FROM packages WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(id)
    }

    /// Find a package by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt =
            conn.prepare("SELECT id, name, preferred_repo_id FROM packages WHERE name = ?1")?;

        let package = stmt.query_row([name], Self::from_row).optional()?;

        Ok(package)
    }

    /// Find a package by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt =
            conn.prepare("SELECT id, name, preferred_repo_id FROM packages WHERE id = ?1")?;

        let package = stmt.query_row([id], Self::from_row).optional()?;

        Ok(package)
    }

    /// List all known package names, including ones nobody offers any more
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt =
            conn.prepare("SELECT id, name, preferred_repo_id FROM packages ORDER BY name")?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Point the package at a new preferred metadata row (or none)
    pub fn set_preferred(conn: &Connection, id: i64, repo_id: Option<i64>) -> Result<()> {
        conn.execute(
            "UPDATE packages SET preferred_repo_id = ?1 WHERE id = ?2",
            params![repo_id, id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            preferred_repo_id: row.get(2)?,
        })
    }
}

/// A Category name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

impl Category {
    /// Return the id for `name`, inserting the category if it is new
    pub fn ensure_exists(conn: &Connection, name: &str) -> Result<i64> {
        if let Some(category) = Self::find_by_name(conn, name)? {
            return Ok(category.id);
        }
        Self::allocate(conn, name)
    }

    /// Insert `name`, re-reading its id if another writer inserted it first
    pub(crate) fn allocate(conn: &Connection, name: &str) -> Result<i64> {
        match conn.execute("INSERT INTO categories (name) VALUES (?1)", [name]) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Self::find_by_name(conn, name)?
                .map(|category| category.id)
                .ok_or_else(|| {
                    Error::NotFoundError(format!("Category '{}' vanished after insert race", name))
                }),
            Err(e) => Err(e.into()),
        }
    }

    /// Find a category by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let category = conn
            .query_row(
                "SELECT id, name FROM categories WHERE name = ?1",
                [name],
                |row| {
                    Ok(Self {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(category)
    }

    /// Names of categories with at least one preferred package in them
    pub fn list_in_use(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT c.name
             FROM categories c
             JOIN category_joins cj ON cj.category_id = c.id
             JOIN packages p ON p.id = cj.package_id AND p.preferred_repo_id = cj.repo_id
             ORDER BY c.name",
        )?;

        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(names)
    }

    /// Category names attached to one (package, repository) metadata row
    pub fn names_for(conn: &Connection, package_id: i64, repo_id: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT c.name FROM categories c
             JOIN category_joins cj ON cj.category_id = c.id
             WHERE cj.package_id = ?1 AND cj.repo_id = ?2
             ORDER BY c.name",
        )?;

        let names = stmt
            .query_map([package_id, repo_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(names)
    }
}

/// What one repository publishes about one package
#[derive(Debug, Clone, PartialEq)]
pub struct AppMetadata {
    pub package_id: i64,
    pub repo_id: i64,
    pub name: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub license: Option<String>,
    pub web_site: Option<String>,
    pub source_code: Option<String>,
    pub added: Option<String>,
    pub last_updated: Option<String>,
    /// Signer the repository recommends for fresh installs
    pub preferred_signer: Option<String>,
    /// Upstream's current stable version code, as published in the index
    pub upstream_version_code: Option<i64>,
    /// Derived: true if any version in this (package, repository) is compatible
    pub compatible: bool,
    /// Derived: see `resolver::select_suggested_version`
    pub suggested_version_code: Option<i64>,
    /// Derived: version name of the suggested version
    pub auto_install_version_name: Option<String>,
}

const METADATA_SELECT: &str = "SELECT package_id, repo_id, name, summary, description, icon,
        license, web_site, source_code, added, last_updated, preferred_signer,
        upstream_version_code, is_compatible, suggested_version_code, auto_install_version_name";

impl AppMetadata {
    /// Create metadata with only the required fields set
    pub fn new(package_id: i64, repo_id: i64, name: String) -> Self {
        Self {
            package_id,
            repo_id,
            name,
            summary: None,
            description: None,
            icon: None,
            license: None,
            web_site: None,
            source_code: None,
            added: None,
            last_updated: None,
            preferred_signer: None,
            upstream_version_code: None,
            compatible: false,
            suggested_version_code: None,
            auto_install_version_name: None,
        }
    }

    /// Insert or replace this row in `schema`.app_metadata
    pub fn upsert(&self, conn: &Connection, schema: &str) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {}.app_metadata
                 (package_id, repo_id, name, summary, description, icon, license, web_site,
                  source_code, added, last_updated, preferred_signer, upstream_version_code,
                  is_compatible, suggested_version_code, auto_install_version_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                schema
            ),
            params![
                &self.package_id,
                &self.repo_id,
                &self.name,
                &self.summary,
                &self.description,
                &self.icon,
                &self.license,
                &self.web_site,
                &self.source_code,
                &self.added,
                &self.last_updated,
                &self.preferred_signer,
                &self.upstream_version_code,
                self.compatible as i32,
                &self.suggested_version_code,
                &self.auto_install_version_name,
            ],
        )?;
        Ok(())
    }

    /// Find the row for one (package, repository)
    pub fn find(conn: &Connection, package_id: i64, repo_id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "{} FROM app_metadata WHERE package_id = ?1 AND repo_id = ?2",
            METADATA_SELECT
        ))?;

        let metadata = stmt
            .query_row([package_id, repo_id], Self::from_row)
            .optional()?;

        Ok(metadata)
    }

    /// Every repository's metadata for a package
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "{} FROM app_metadata WHERE package_id = ?1 ORDER BY repo_id",
            METADATA_SELECT
        ))?;

        let rows = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Every metadata row a repository owns in `schema`
    pub fn find_by_repository(conn: &Connection, schema: &str, repo_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "{} FROM {}.app_metadata WHERE repo_id = ?1 ORDER BY package_id",
            METADATA_SELECT, schema
        ))?;

        let rows = stmt
            .query_map([repo_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Convert a database row to AppMetadata
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            package_id: row.get(0)?,
            repo_id: row.get(1)?,
            name: row.get(2)?,
            summary: row.get(3)?,
            description: row.get(4)?,
            icon: row.get(5)?,
            license: row.get(6)?,
            web_site: row.get(7)?,
            source_code: row.get(8)?,
            added: row.get(9)?,
            last_updated: row.get(10)?,
            preferred_signer: row.get(11)?,
            upstream_version_code: row.get(12)?,
            compatible: row.get::<_, i32>(13)? != 0,
            suggested_version_code: row.get(14)?,
            auto_install_version_name: row.get(15)?,
        })
    }
}

/// One installable artifact of a package, as published by one repository
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub package_id: i64,
    pub repo_id: i64,
    pub version_code: i64,
    pub version_name: Option<String>,
    pub file_name: String,
    pub hash: String,
    pub hash_type: String,
    pub signer: Option<String>,
    pub size: i64,
    pub min_sdk: Option<i32>,
    pub target_sdk: Option<i32>,
    pub max_sdk: Option<i32>,
    pub permissions: Vec<String>,
    pub features: Vec<String>,
    pub native_code: Vec<String>,
    pub release_channels: Vec<String>,
    pub anti_features: Vec<String>,
    pub added: Option<String>,
    /// Derived through the compatibility checker at ingest time
    pub compatible: bool,
    pub incompatible_reasons: Vec<String>,
}

const VERSION_SELECT: &str = "SELECT package_id, repo_id, version_code, version_name, file_name,
        hash, hash_type, signer, size, min_sdk, target_sdk, max_sdk, permissions, features,
        native_code, release_channels, anti_features, added, is_compatible, incompatible_reasons";

impl Version {
    /// Create a new Version with only the required fields set
    pub fn new(
        package_id: i64,
        repo_id: i64,
        version_code: i64,
        file_name: String,
        hash: String,
    ) -> Self {
        Self {
            package_id,
            repo_id,
            version_code,
            version_name: None,
            file_name,
            hash,
            hash_type: "sha256".to_string(),
            signer: None,
            size: 0,
            min_sdk: None,
            target_sdk: None,
            max_sdk: None,
            permissions: Vec::new(),
            features: Vec::new(),
            native_code: Vec::new(),
            release_channels: Vec::new(),
            anti_features: Vec::new(),
            added: None,
            compatible: false,
            incompatible_reasons: Vec::new(),
        }
    }

    /// True if the repository flags this version as vulnerable
    pub fn has_known_vulnerability(&self) -> bool {
        self.anti_features.iter().any(|a| a == KNOWN_VULN)
    }

    /// True if the version carries no release channel tag (i.e. stable)
    pub fn is_stable(&self) -> bool {
        self.release_channels.is_empty()
    }

    /// Insert or replace this row in `schema`.versions
    pub fn upsert(&self, conn: &Connection, schema: &str) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {}.versions
                 (package_id, repo_id, version_code, version_name, file_name, hash, hash_type,
                  signer, size, min_sdk, target_sdk, max_sdk, permissions, features, native_code,
                  release_channels, anti_features, added, is_compatible, incompatible_reasons)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20)",
                schema
            ),
            params![
                &self.package_id,
                &self.repo_id,
                &self.version_code,
                &self.version_name,
                &self.file_name,
                &self.hash,
                &self.hash_type,
                &self.signer,
                &self.size,
                &self.min_sdk,
                &self.target_sdk,
                &self.max_sdk,
                to_json(&self.permissions)?,
                to_json(&self.features)?,
                to_json(&self.native_code)?,
                to_json(&self.release_channels)?,
                to_json(&self.anti_features)?,
                &self.added,
                self.compatible as i32,
                to_json(&self.incompatible_reasons)?,
            ],
        )?;
        Ok(())
    }

    /// Find one version by its full key
    pub fn find(
        conn: &Connection,
        package_id: i64,
        repo_id: i64,
        version_code: i64,
    ) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "{} FROM versions WHERE package_id = ?1 AND repo_id = ?2 AND version_code = ?3",
            VERSION_SELECT
        ))?;

        let version = stmt
            .query_row([package_id, repo_id, version_code], Self::from_row)
            .optional()?;

        Ok(version)
    }

    /// All versions of a package in one repository, highest version code first
    pub fn find_by_package_repo(
        conn: &Connection,
        schema: &str,
        package_id: i64,
        repo_id: i64,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "{} FROM {}.versions WHERE package_id = ?1 AND repo_id = ?2
             ORDER BY version_code DESC",
            VERSION_SELECT, schema
        ))?;

        let versions = stmt
            .query_map([package_id, repo_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(versions)
    }

    /// Number of version rows a repository owns in the primary catalog
    pub fn count_by_repository(conn: &Connection, repo_id: i64) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM versions WHERE repo_id = ?1",
            [repo_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Convert a database row to a Version
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            package_id: row.get(0)?,
            repo_id: row.get(1)?,
            version_code: row.get(2)?,
            version_name: row.get(3)?,
            file_name: row.get(4)?,
            hash: row.get(5)?,
            hash_type: row.get(6)?,
            signer: row.get(7)?,
            size: row.get(8)?,
            min_sdk: row.get(9)?,
            target_sdk: row.get(10)?,
            max_sdk: row.get(11)?,
            permissions: from_json(row, 12)?,
            features: from_json(row, 13)?,
            native_code: from_json(row, 14)?,
            release_channels: from_json(row, 15)?,
            anti_features: from_json(row, 16)?,
            added: row.get(17)?,
            compatible: row.get::<_, i32>(18)? != 0,
            incompatible_reasons: from_json(row, 19)?,
        })
    }
}

/// Per-package preferences owned by the user; sync never touches them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPrefs {
    pub package_name: String,
    pub ignore_all_updates: bool,
    pub ignore_version_code_up_to: i64,
    pub ignore_vulnerabilities: bool,
    /// App-specific release channel opt-in (e.g. "Beta")
    pub release_channel: Option<String>,
}

impl UserPrefs {
    /// Preferences with everything off
    pub fn new(package_name: String) -> Self {
        Self {
            package_name,
            ..Self::default()
        }
    }

    /// Preferences for a package, or the all-off default when none are stored
    pub fn find_or_default(conn: &Connection, package_name: &str) -> Result<Self> {
        let prefs = conn
            .query_row(
                "SELECT package_name, ignore_all_updates, ignore_version_code_up_to,
                        ignore_vulnerabilities, release_channel
                 FROM user_prefs WHERE package_name = ?1",
                [package_name],
                Self::from_row,
            )
            .optional()?;

        Ok(prefs.unwrap_or_else(|| Self::new(package_name.to_string())))
    }

    /// Insert or replace these preferences
    pub fn save(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO user_prefs
             (package_name, ignore_all_updates, ignore_version_code_up_to,
              ignore_vulnerabilities, release_channel)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &self.package_name,
                self.ignore_all_updates as i32,
                &self.ignore_version_code_up_to,
                self.ignore_vulnerabilities as i32,
                &self.release_channel,
            ],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            package_name: row.get(0)?,
            ignore_all_updates: row.get::<_, i32>(1)? != 0,
            ignore_version_code_up_to: row.get(2)?,
            ignore_vulnerabilities: row.get::<_, i32>(3)? != 0,
            release_channel: row.get(4)?,
        })
    }
}

/// What the device actually has installed for one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledSnapshot {
    pub package_name: String,
    pub version_code: i64,
    pub version_name: Option<String>,
    pub signer: Option<String>,
    pub hash: Option<String>,
    pub hash_type: Option<String>,
    pub last_update_time: Option<String>,
}

impl InstalledSnapshot {
    /// Create a snapshot with only the required fields set
    pub fn new(package_name: String, version_code: i64) -> Self {
        Self {
            package_name,
            version_code,
            version_name: None,
            signer: None,
            hash: None,
            hash_type: None,
            last_update_time: None,
        }
    }

    /// Insert or replace the snapshot for this package
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO installed_apps
             (package_name, version_code, version_name, signer, hash, hash_type, last_update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &self.package_name,
                &self.version_code,
                &self.version_name,
                &self.signer,
                &self.hash,
                &self.hash_type,
                &self.last_update_time,
            ],
        )?;
        Ok(())
    }

    /// Find the snapshot for a package
    pub fn find(conn: &Connection, package_name: &str) -> Result<Option<Self>> {
        let snapshot = conn
            .query_row(
                "SELECT package_name, version_code, version_name, signer, hash, hash_type,
                        last_update_time
                 FROM installed_apps WHERE package_name = ?1",
                [package_name],
                Self::from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    /// List all installed packages
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT package_name, version_code, version_name, signer, hash, hash_type,
                    last_update_time
             FROM installed_apps ORDER BY package_name",
        )?;

        let rows = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Delete the snapshot for a package (it was uninstalled)
    pub fn delete(conn: &Connection, package_name: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM installed_apps WHERE package_name = ?1",
            [package_name],
        )?;
        Ok(())
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            package_name: row.get(0)?,
            version_code: row.get(1)?,
            version_name: row.get(2)?,
            signer: row.get(3)?,
            hash: row.get(4)?,
            hash_type: row.get(5)?,
            last_update_time: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn add_repo(conn: &Connection, name: &str) -> i64 {
        let mut repo = Repository::new(name.to_string(), format!("https://{}.example.org", name));
        repo.insert(conn).unwrap()
    }

    #[test]
    fn test_repository_crud() {
        let (_temp, conn) = create_test_db();

        let mut repo = Repository::new("main".to_string(), "https://example.org/repo".to_string());
        repo.priority = 10;
        let id = repo.insert(&conn).unwrap();
        assert!(id > 0);

        let found = Repository::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.name, "main");
        assert_eq!(found.priority, 10);
        assert!(found.enabled);

        let mut updated = found.clone();
        updated.enabled = false;
        updated.update(&conn).unwrap();
        assert!(Repository::list_enabled(&conn).unwrap().is_empty());
        assert_eq!(Repository::list_all(&conn).unwrap().len(), 1);

        Repository::mark_synced(&conn, id, Some("etag-1"), "2026-01-01T00:00:00+00:00").unwrap();
        let synced = Repository::find_by_name(&conn, "main").unwrap().unwrap();
        assert_eq!(synced.sync_token.as_deref(), Some("etag-1"));

        Repository::delete(&conn, id).unwrap();
        assert!(Repository::find_by_id(&conn, id).unwrap().is_none());
    }

    #[test]
    fn test_package_ensure_exists_is_idempotent() {
        let (_temp, conn) = create_test_db();

        let first = Package::ensure_exists(&conn, "org.example.app").unwrap();
        let second = Package::ensure_exists(&conn, "org.example.app").unwrap();
        assert_eq!(first, second);

        let package = Package::find_by_id(&conn, first).unwrap().unwrap();
        assert_eq!(package.name, "org.example.app");
        assert_eq!(package.preferred_repo_id, None);
    }

    #[test]
    fn test_allocation_race_rereads_existing_id() {
        let temp_file = NamedTempFile::new().unwrap();
        let first = Connection::open(temp_file.path()).unwrap();
        schema::migrate(&first).unwrap();
        let second = Connection::open(temp_file.path()).unwrap();

        // Both writers miss the name, the second inserts it first
        assert_eq!(Package::find_id(&first, "org.example.app").unwrap(), None);
        assert!(Category::find_by_name(&first, "Games").unwrap().is_none());
        let package_id = Package::ensure_exists(&second, "org.example.app").unwrap();
        let category_id = Category::ensure_exists(&second, "Games").unwrap();

        assert_eq!(Package::allocate(&first, "org.example.app").unwrap(), package_id);
        assert_eq!(Category::allocate(&first, "Games").unwrap(), category_id);
        assert_eq!(Package::list_all(&first).unwrap().len(), 1);
    }

    #[test]
    fn test_unique_violation_ignores_other_constraints() {
        let (_temp, conn) = create_test_db();
        conn.execute("INSERT INTO packages (name) VALUES ('org.example')", [])
            .unwrap();

        let duplicate = conn
            .execute("INSERT INTO packages (name) VALUES ('org.example')", [])
            .unwrap_err();
        assert!(is_unique_violation(&duplicate));

        let dangling = conn
            .execute(
                "INSERT INTO category_joins (package_id, repo_id, category_id) VALUES (1, 99, 99)",
                [],
            )
            .unwrap_err();
        assert!(!is_unique_violation(&dangling));

        let missing_name = conn
            .execute("INSERT INTO categories (name) VALUES (NULL)", [])
            .unwrap_err();
        assert!(!is_unique_violation(&missing_name));
    }

    #[test]
    fn test_repository_token_matches() {
        let mut repo = Repository::new("main".to_string(), "https://example.org".to_string());
        assert!(!repo.token_matches(None));
        assert!(!repo.token_matches(Some("etag-1")));

        repo.sync_token = Some("etag-1".to_string());
        assert!(repo.token_matches(Some("etag-1")));
        assert!(!repo.token_matches(Some("etag-2")));
        assert!(!repo.token_matches(None));
    }

    #[test]
    fn test_category_ensure_exists() {
        let (_temp, conn) = create_test_db();

        let a = Category::ensure_exists(&conn, "Games").unwrap();
        let b = Category::ensure_exists(&conn, "Games").unwrap();
        let c = Category::ensure_exists(&conn, "Science").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_metadata_and_version_roundtrip() {
        let (_temp, conn) = create_test_db();
        let repo_id = add_repo(&conn, "main");
        let package_id = Package::ensure_exists(&conn, "org.example.app").unwrap();

        let mut metadata = AppMetadata::new(package_id, repo_id, "Example".to_string());
        metadata.summary = Some("An example".to_string());
        metadata.upstream_version_code = Some(3);
        metadata.upsert(&conn, MAIN).unwrap();

        let mut version = Version::new(
            package_id,
            repo_id,
            3,
            "example_3.apk".to_string(),
            "abc123".to_string(),
        );
        version.native_code = vec!["arm64-v8a".to_string()];
        version.release_channels = vec!["Beta".to_string()];
        version.anti_features = vec![KNOWN_VULN.to_string()];
        version.compatible = true;
        version.upsert(&conn, MAIN).unwrap();

        let found = AppMetadata::find(&conn, package_id, repo_id).unwrap().unwrap();
        assert_eq!(found, metadata);

        let loaded = Version::find(&conn, package_id, repo_id, 3).unwrap().unwrap();
        assert_eq!(loaded, version);
        assert!(loaded.has_known_vulnerability());
        assert!(!loaded.is_stable());
        assert_eq!(Version::count_by_repository(&conn, repo_id).unwrap(), 1);
    }

    #[test]
    fn test_versions_sorted_descending() {
        let (_temp, conn) = create_test_db();
        let repo_id = add_repo(&conn, "main");
        let package_id = Package::ensure_exists(&conn, "org.example.app").unwrap();
        AppMetadata::new(package_id, repo_id, "Example".to_string())
            .upsert(&conn, MAIN)
            .unwrap();

        for code in [2, 7, 4] {
            Version::new(package_id, repo_id, code, format!("{}.apk", code), "h".to_string())
                .upsert(&conn, MAIN)
                .unwrap();
        }

        let codes: Vec<i64> = Version::find_by_package_repo(&conn, MAIN, package_id, repo_id)
            .unwrap()
            .iter()
            .map(|v| v.version_code)
            .collect();
        assert_eq!(codes, vec![7, 4, 2]);
    }

    #[test]
    fn test_repository_delete_cascades() {
        let (_temp, conn) = create_test_db();
        let repo_id = add_repo(&conn, "main");
        let package_id = Package::ensure_exists(&conn, "org.example.app").unwrap();
        let category_id = Category::ensure_exists(&conn, "Games").unwrap();

        AppMetadata::new(package_id, repo_id, "Example".to_string())
            .upsert(&conn, MAIN)
            .unwrap();
        Version::new(package_id, repo_id, 1, "1.apk".to_string(), "h".to_string())
            .upsert(&conn, MAIN)
            .unwrap();
        conn.execute(
            "INSERT INTO category_joins (package_id, repo_id, category_id) VALUES (?1, ?2, ?3)",
            [package_id, repo_id, category_id],
        )
        .unwrap();

        Repository::delete(&conn, repo_id).unwrap();

        assert!(AppMetadata::find(&conn, package_id, repo_id).unwrap().is_none());
        assert_eq!(Version::count_by_repository(&conn, repo_id).unwrap(), 0);
        assert!(Category::names_for(&conn, package_id, repo_id).unwrap().is_empty());
        // Names outlive their metadata
        assert!(Package::find_by_id(&conn, package_id).unwrap().is_some());
    }

    #[test]
    fn test_user_prefs_default_and_save() {
        let (_temp, conn) = create_test_db();

        let prefs = UserPrefs::find_or_default(&conn, "org.example.app").unwrap();
        assert!(!prefs.ignore_all_updates);
        assert_eq!(prefs.ignore_version_code_up_to, 0);

        let mut prefs = prefs;
        prefs.ignore_version_code_up_to = 5;
        prefs.release_channel = Some("Beta".to_string());
        prefs.save(&conn).unwrap();

        let reloaded = UserPrefs::find_or_default(&conn, "org.example.app").unwrap();
        assert_eq!(reloaded, prefs);
    }

    #[test]
    fn test_installed_snapshot_crud() {
        let (_temp, conn) = create_test_db();

        let mut snapshot = InstalledSnapshot::new("org.example.app".to_string(), 2);
        snapshot.signer = Some("aa11".to_string());
        snapshot.upsert(&conn).unwrap();

        let found = InstalledSnapshot::find(&conn, "org.example.app").unwrap().unwrap();
        assert_eq!(found, snapshot);
        assert_eq!(InstalledSnapshot::list_all(&conn).unwrap().len(), 1);

        InstalledSnapshot::delete(&conn, "org.example.app").unwrap();
        assert!(InstalledSnapshot::find(&conn, "org.example.app").unwrap().is_none());
    }
}
