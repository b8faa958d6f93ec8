// src/db/schema.rs

//! Database schema definitions and migrations for the catalog
//!
//! This module defines the SQLite schema for all catalog tables, the
//! migration system used to evolve it, and the shape of the in-memory
//! staging schema a repository sync writes into before its atomic swap.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Name under which the staging database is attached to a connection
pub const STAGING_SCHEMA: &str = "staging";

/// Columns shared by `app_metadata` and its staging copy
pub const METADATA_COLUMNS: &[&str] = &[
    "package_id",
    "repo_id",
    "name",
    "summary",
    "description",
    "icon",
    "license",
    "web_site",
    "source_code",
    "added",
    "last_updated",
    "preferred_signer",
    "upstream_version_code",
    "is_compatible",
    "suggested_version_code",
    "auto_install_version_name",
];

/// Columns shared by `versions` and its staging copy
pub const VERSION_COLUMNS: &[&str] = &[
    "package_id",
    "repo_id",
    "version_code",
    "version_name",
    "file_name",
    "hash",
    "hash_type",
    "signer",
    "size",
    "min_sdk",
    "target_sdk",
    "max_sdk",
    "permissions",
    "features",
    "native_code",
    "release_channels",
    "anti_features",
    "added",
    "is_compatible",
    "incompatible_reasons",
];

/// Columns shared by `category_joins` and its staging copy
pub const CATEGORY_JOIN_COLUMNS: &[&str] = &["package_id", "repo_id", "category_id"];

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        info!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// Creates the catalog tables:
/// - repositories: Configured index sources, ranked by priority
/// - packages: Globally unique package names and their preferred source
/// - categories: Category names
/// - app_metadata: One descriptive record per (package, repository)
/// - category_joins: Category membership per (package, repository)
/// - versions: One installable artifact per (package, repository, version code)
///
/// The two back-references (`packages.preferred_repo_id` and
/// `app_metadata.suggested_version_code`) are deferred foreign keys, so a
/// transaction can never commit with either of them dangling.
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        -- Repositories: Independently operated index sources
        CREATE TABLE repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            address TEXT NOT NULL UNIQUE,
            certificate TEXT,
            fingerprint TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            max_age INTEGER NOT NULL DEFAULT 86400,
            sync_token TEXT,
            last_sync TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_repositories_enabled ON repositories(enabled);
        CREATE INDEX idx_repositories_priority ON repositories(priority);

        -- Packages: Names are remembered forever, metadata comes and goes
        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            preferred_repo_id INTEGER,
            FOREIGN KEY (id, preferred_repo_id)
                REFERENCES app_metadata(package_id, repo_id)
                DEFERRABLE INITIALLY DEFERRED
        );

        CREATE INDEX idx_packages_preferred ON packages(preferred_repo_id);

        -- Categories: Names only, membership lives in category_joins
        CREATE TABLE categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        -- App metadata: What one repository says about one package
        CREATE TABLE app_metadata (
            package_id INTEGER NOT NULL,
            repo_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            summary TEXT,
            description TEXT,
            icon TEXT,
            license TEXT,
            web_site TEXT,
            source_code TEXT,
            added TEXT,
            last_updated TEXT,
            preferred_signer TEXT,
            upstream_version_code INTEGER,
            is_compatible INTEGER NOT NULL DEFAULT 0,
            suggested_version_code INTEGER,
            auto_install_version_name TEXT,
            PRIMARY KEY (package_id, repo_id),
            FOREIGN KEY (package_id) REFERENCES packages(id),
            FOREIGN KEY (repo_id) REFERENCES repositories(id) ON DELETE CASCADE,
            FOREIGN KEY (package_id, repo_id, suggested_version_code)
                REFERENCES versions(package_id, repo_id, version_code)
                DEFERRABLE INITIALLY DEFERRED
        );

        CREATE INDEX idx_app_metadata_repo ON app_metadata(repo_id);
        CREATE INDEX idx_app_metadata_name ON app_metadata(name);

        -- Category membership, owned by the (package, repository) metadata row
        CREATE TABLE category_joins (
            package_id INTEGER NOT NULL,
            repo_id INTEGER NOT NULL,
            category_id INTEGER NOT NULL,
            PRIMARY KEY (package_id, repo_id, category_id),
            FOREIGN KEY (package_id, repo_id)
                REFERENCES app_metadata(package_id, repo_id) ON DELETE CASCADE,
            FOREIGN KEY (category_id) REFERENCES categories(id)
        );

        CREATE INDEX idx_category_joins_category ON category_joins(category_id);
        CREATE INDEX idx_category_joins_repo ON category_joins(repo_id);

        -- Versions: Installable artifacts as published by one repository
        CREATE TABLE versions (
            package_id INTEGER NOT NULL,
            repo_id INTEGER NOT NULL,
            version_code INTEGER NOT NULL,
            version_name TEXT,
            file_name TEXT NOT NULL,
            hash TEXT NOT NULL,
            hash_type TEXT NOT NULL DEFAULT 'sha256',
            signer TEXT,
            size INTEGER NOT NULL DEFAULT 0,
            min_sdk INTEGER,
            target_sdk INTEGER,
            max_sdk INTEGER,
            permissions TEXT,
            features TEXT,
            native_code TEXT,
            release_channels TEXT,
            anti_features TEXT,
            added TEXT,
            is_compatible INTEGER NOT NULL DEFAULT 0,
            incompatible_reasons TEXT,
            PRIMARY KEY (package_id, repo_id, version_code),
            FOREIGN KEY (package_id, repo_id)
                REFERENCES app_metadata(package_id, repo_id) ON DELETE CASCADE
        );

        CREATE INDEX idx_versions_repo ON versions(repo_id);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: Device-side state
///
/// Adds tables that synchronization reads but never writes:
/// - user_prefs: Per-package update preferences, owned by the user
/// - installed_apps: Snapshot of what the device actually has installed
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE user_prefs (
            package_name TEXT PRIMARY KEY,
            ignore_all_updates INTEGER NOT NULL DEFAULT 0,
            ignore_version_code_up_to INTEGER NOT NULL DEFAULT 0,
            ignore_vulnerabilities INTEGER NOT NULL DEFAULT 0,
            release_channel TEXT
        );

        CREATE TABLE installed_apps (
            package_name TEXT PRIMARY KEY,
            version_code INTEGER NOT NULL,
            version_name TEXT,
            signer TEXT,
            hash TEXT,
            hash_type TEXT,
            last_update_time TEXT
        );
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Attach a fresh, empty in-memory staging database to `conn`
///
/// Any staging database left behind by an interrupted sync on this
/// connection is detached first. The staging tables mirror the catalog
/// tables column for column but carry no foreign keys, since SQLite cannot
/// enforce references across attached databases.
pub fn attach_staging(conn: &Connection) -> Result<()> {
    detach_staging(conn);

    conn.execute_batch(&format!(
        "
        ATTACH DATABASE ':memory:' AS {s};

        CREATE TABLE {s}.app_metadata (
            package_id INTEGER NOT NULL,
            repo_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            summary TEXT,
            description TEXT,
            icon TEXT,
            license TEXT,
            web_site TEXT,
            source_code TEXT,
            added TEXT,
            last_updated TEXT,
            preferred_signer TEXT,
            upstream_version_code INTEGER,
            is_compatible INTEGER NOT NULL DEFAULT 0,
            suggested_version_code INTEGER,
            auto_install_version_name TEXT,
            PRIMARY KEY (package_id, repo_id)
        );
        CREATE INDEX {s}.idx_app_metadata_repo ON app_metadata(repo_id);

        CREATE TABLE {s}.category_joins (
            package_id INTEGER NOT NULL,
            repo_id INTEGER NOT NULL,
            category_id INTEGER NOT NULL,
            PRIMARY KEY (package_id, repo_id, category_id)
        );

        CREATE TABLE {s}.versions (
            package_id INTEGER NOT NULL,
            repo_id INTEGER NOT NULL,
            version_code INTEGER NOT NULL,
            version_name TEXT,
            file_name TEXT NOT NULL,
            hash TEXT NOT NULL,
            hash_type TEXT NOT NULL DEFAULT 'sha256',
            signer TEXT,
            size INTEGER NOT NULL DEFAULT 0,
            min_sdk INTEGER,
            target_sdk INTEGER,
            max_sdk INTEGER,
            permissions TEXT,
            features TEXT,
            native_code TEXT,
            release_channels TEXT,
            anti_features TEXT,
            added TEXT,
            is_compatible INTEGER NOT NULL DEFAULT 0,
            incompatible_reasons TEXT,
            PRIMARY KEY (package_id, repo_id, version_code)
        );
        CREATE INDEX {s}.idx_versions_repo ON versions(repo_id);

        -- Keys of every row the current index published, for orphan detection
        CREATE TABLE {s}.seen_metadata (
            package_id INTEGER PRIMARY KEY
        );
        CREATE TABLE {s}.seen_versions (
            package_id INTEGER NOT NULL,
            version_code INTEGER NOT NULL,
            PRIMARY KEY (package_id, version_code)
        );
        ",
        s = STAGING_SCHEMA
    ))?;

    debug!("Attached staging database");
    Ok(())
}

/// Detach the staging database if one is attached
///
/// Errors are ignored: most of the time there is nothing to detach.
pub fn detach_staging(conn: &Connection) {
    let _ = conn.execute_batch(&format!("DETACH DATABASE {}", STAGING_SCHEMA));
}

/// Build an `INSERT INTO .. SELECT ..` copying `columns` between two tables
pub fn copy_rows(columns: &[&str], from_table: &str, to_table: &str, filter: &str) -> String {
    let cols = columns.join(", ");
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} WHERE {}",
        to_table, cols, cols, from_table, filter
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "repositories",
            "packages",
            "categories",
            "app_metadata",
            "category_joins",
            "versions",
            "user_prefs",
            "installed_apps",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_package_name_is_unique() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        conn.execute("INSERT INTO packages (name) VALUES (?1)", ["org.example"])
            .unwrap();
        let result = conn.execute("INSERT INTO packages (name) VALUES (?1)", ["org.example"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_metadata_requires_repository() {
        let (_temp, conn) = create_test_db();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        migrate(&conn).unwrap();

        conn.execute("INSERT INTO packages (name) VALUES (?1)", ["org.example"])
            .unwrap();
        let result = conn.execute(
            "INSERT INTO app_metadata (package_id, repo_id, name) VALUES (1, 999, 'Example')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_dangling_preferred_reference_cannot_commit() {
        let (_temp, mut conn) = create_test_db();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        migrate(&conn).unwrap();

        let tx = conn.transaction().unwrap();
        tx.execute(
            "INSERT INTO packages (name, preferred_repo_id) VALUES ('org.example', 7)",
            [],
        )
        .unwrap();
        assert!(tx.commit().is_err());
    }

    #[test]
    fn test_attach_staging_twice_starts_empty() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        attach_staging(&conn).unwrap();
        conn.execute(
            "INSERT INTO staging.seen_metadata (package_id) VALUES (1)",
            [],
        )
        .unwrap();

        attach_staging(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM staging.seen_metadata", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);

        detach_staging(&conn);
    }

    #[test]
    fn test_copy_rows_statement() {
        let sql = copy_rows(
            CATEGORY_JOIN_COLUMNS,
            "staging.category_joins",
            "main.category_joins",
            "repo_id = ?1",
        );
        assert_eq!(
            sql,
            "INSERT INTO main.category_joins (package_id, repo_id, category_id) \
             SELECT package_id, repo_id, category_id FROM staging.category_joins WHERE repo_id = ?1"
        );
    }
}
