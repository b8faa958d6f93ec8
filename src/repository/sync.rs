// src/repository/sync.rs

//! Staged application of a repository index
//!
//! A sync never writes a repository's rows straight into the catalog.
//! Instead it:
//! 1. attaches an in-memory staging database and copies the catalog into it
//! 2. ingests the index in batches, checking device compatibility per version
//! 3. drops staged rows of this repository the index no longer publishes
//! 4. derives compatibility and suggested versions over the merged view
//! 5. swaps this repository's rows into the catalog in one transaction
//!
//! Readers see either the old or the new state of the repository, never a
//! mix. Dropping a [`RepoSync`] without committing discards the staging
//! database and leaves the catalog untouched.

use super::current_timestamp;
use super::index::{IndexEntry, IndexVersion};
use crate::compat::CompatibilityChecker;
use crate::config::SyncConfig;
use crate::db;
use crate::db::models::{AppMetadata, Category, Package, Repository, Version};
use crate::db::schema::{
    self, CATEGORY_JOIN_COLUMNS, METADATA_COLUMNS, STAGING_SCHEMA, VERSION_COLUMNS,
};
use crate::error::{Error, Result};
use crate::resolver;
use rayon::prelude::*;
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Package and category ids already known to exist
///
/// Shared by every sync in the process. Entries are only ever added, and an
/// id never changes once allocated, so a stale miss just costs a lookup.
#[derive(Debug, Default)]
pub struct NameCache {
    packages: Mutex<HashMap<String, i64>>,
    categories: Mutex<HashMap<String, i64>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the package called `name`, allocating it if needed
    pub fn package_id(&self, conn: &Connection, name: &str) -> Result<i64> {
        Self::lookup(&self.packages, name, || Package::ensure_exists(conn, name))
    }

    /// Id of the category called `name`, allocating it if needed
    pub fn category_id(&self, conn: &Connection, name: &str) -> Result<i64> {
        Self::lookup(&self.categories, name, || Category::ensure_exists(conn, name))
    }

    fn lookup<F>(map: &Mutex<HashMap<String, i64>>, name: &str, allocate: F) -> Result<i64>
    where
        F: FnOnce() -> Result<i64>,
    {
        if let Some(&id) = map.lock().unwrap_or_else(PoisonError::into_inner).get(name) {
            return Ok(id);
        }

        // Allocate without holding the lock; racing allocators agree on the id
        let id = allocate()?;
        map.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.packages.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a sync did to its repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub repo_id: i64,
    pub token: Option<String>,
    /// The token matched the stored one and nothing was staged
    pub unchanged: bool,
    /// Entries ingested
    pub packages: usize,
    /// Versions ingested
    pub versions: usize,
    /// Malformed entries skipped
    pub skipped: usize,
    /// Packages this repository no longer offers
    pub removed_packages: usize,
    /// Versions this repository no longer offers
    pub removed_versions: usize,
    /// Packages where this repository's metadata wins
    pub preferred: usize,
    /// Ids of every package whose offerings changed
    pub affected: Vec<i64>,
}

/// One entry, ready to be written to staging
struct StagedEntry {
    metadata: AppMetadata,
    versions: Vec<Version>,
    category_ids: Vec<i64>,
}

/// A single repository sync in progress
pub struct RepoSync<'a> {
    conn: &'a mut Connection,
    repo: Repository,
    repo_id: i64,
    names: &'a NameCache,
    checker: &'a dyn CompatibilityChecker,
    config: SyncConfig,
    buffer: Vec<IndexEntry>,
    report: SyncReport,
    resolved: bool,
}

impl<'a> RepoSync<'a> {
    /// Start a sync of `repo_id`, staging a copy of the current catalog
    pub fn new(
        conn: &'a mut Connection,
        repo_id: i64,
        names: &'a NameCache,
        checker: &'a dyn CompatibilityChecker,
        config: &SyncConfig,
    ) -> Result<Self> {
        let repo = Repository::find_by_id(conn, repo_id)?
            .ok_or_else(|| Error::NotFoundError(format!("Repository {} not found", repo_id)))?;

        schema::attach_staging(conn)?;

        let sync = Self {
            conn,
            repo,
            repo_id,
            names,
            checker,
            config: config.clone(),
            buffer: Vec::with_capacity(config.batch_size),
            report: SyncReport {
                repo_id,
                ..SyncReport::default()
            },
            resolved: false,
        };
        sync.copy_catalog()?;

        debug!("Staging prepared for repository {}", sync.repo.name);
        Ok(sync)
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Copy every repository's rows into staging
    ///
    /// The other repositories' rows give the resolution passes the merged
    /// view; this repository's rows let orphans be found by key.
    fn copy_catalog(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (columns, table) in [
            (METADATA_COLUMNS, "app_metadata"),
            (VERSION_COLUMNS, "versions"),
            (CATEGORY_JOIN_COLUMNS, "category_joins"),
        ] {
            tx.execute(
                &schema::copy_rows(
                    columns,
                    &format!("main.{}", table),
                    &format!("{}.{}", STAGING_SCHEMA, table),
                    "1",
                ),
                [],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Queue one index entry, flushing a full batch to staging
    pub fn save(&mut self, entry: IndexEntry) -> Result<()> {
        self.buffer.push(entry);
        if self.buffer.len() >= self.config.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Write buffered entries to staging
    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let entries = std::mem::take(&mut self.buffer);
        let count = entries.len();
        let mut staged = Vec::with_capacity(count);

        for entry in entries {
            if let Err(e) = entry.validate() {
                warn!("Skipping index entry: {}", e);
                self.report.skipped += 1;
                continue;
            }
            staged.push(self.prepare(entry)?);
        }

        let checker = self.checker;
        staged.par_iter_mut().for_each(|entry| {
            for version in &mut entry.versions {
                let reasons = checker.check(version);
                version.compatible = reasons.is_empty();
                version.incompatible_reasons = reasons.iter().map(ToString::to_string).collect();
            }
        });

        let tx = self.conn.transaction()?;
        for entry in &staged {
            write_staged(&tx, entry)?;
        }
        tx.commit()?;

        self.report.packages += staged.len();
        self.report.versions += staged.iter().map(|e| e.versions.len()).sum::<usize>();

        debug!(
            "Flushed {} of {} entries to staging for {}",
            staged.len(),
            count,
            self.repo.name
        );
        Ok(())
    }

    /// Resolve names to ids and convert an entry to catalog rows
    fn prepare(&self, entry: IndexEntry) -> Result<StagedEntry> {
        let conn: &Connection = &*self.conn;
        let package_id = self.names.package_id(conn, &entry.package_name)?;
        let category_ids = entry
            .categories
            .iter()
            .map(|category| self.names.category_id(conn, category))
            .collect::<Result<Vec<_>>>()?;

        let versions = entry
            .versions
            .into_iter()
            .map(|v| version_row(package_id, self.repo_id, v))
            .collect();

        let mut metadata = AppMetadata::new(package_id, self.repo_id, entry.name);
        metadata.summary = entry.summary;
        metadata.description = entry.description;
        metadata.icon = entry.icon;
        metadata.license = entry.license;
        metadata.web_site = entry.web_site;
        metadata.source_code = entry.source_code;
        metadata.added = entry.added;
        metadata.last_updated = entry.last_updated;
        metadata.preferred_signer = entry.preferred_signer;
        metadata.upstream_version_code = entry.upstream_version_code;

        Ok(StagedEntry {
            metadata,
            versions,
            category_ids,
        })
    }

    /// Remove orphans and compute derived fields over the merged view
    fn resolve(&mut self) -> Result<()> {
        if self.resolved {
            return Ok(());
        }
        self.flush()?;

        let repo_id = self.repo_id;
        let unstable = self.config.unstable_updates;
        let tx = self.conn.transaction()?;

        let removed_versions = tx.execute(
            "DELETE FROM staging.versions
             WHERE repo_id = ?1
               AND (package_id, version_code) NOT IN
                   (SELECT package_id, version_code FROM staging.seen_versions)",
            [repo_id],
        )?;
        tx.execute(
            "DELETE FROM staging.category_joins
             WHERE repo_id = ?1
               AND package_id NOT IN (SELECT package_id FROM staging.seen_metadata)",
            [repo_id],
        )?;
        let removed_packages = tx.execute(
            "DELETE FROM staging.app_metadata
             WHERE repo_id = ?1
               AND package_id NOT IN (SELECT package_id FROM staging.seen_metadata)",
            [repo_id],
        )?;

        let package_ids = staged_package_ids(&tx, repo_id)?;
        let mut preferred = 0;
        for &package_id in &package_ids {
            resolver::update_derived(&tx, STAGING_SCHEMA, package_id, repo_id, unstable)?;
            let offerings = resolver::offerings(&tx, STAGING_SCHEMA, package_id)?;
            if resolver::choose_preferred(&offerings) == Some(repo_id) {
                preferred += 1;
            }
        }
        tx.commit()?;

        self.report.removed_versions = removed_versions;
        self.report.removed_packages = removed_packages;
        self.report.preferred = preferred;
        self.resolved = true;

        debug!(
            "Resolved {} staged packages for {} ({} orphaned versions, {} orphaned packages)",
            package_ids.len(),
            self.repo.name,
            removed_versions,
            removed_packages
        );
        Ok(())
    }

    /// Swap the staged rows of this repository into the catalog
    ///
    /// On error the catalog keeps its previous state.
    pub fn commit(mut self, token: Option<&str>) -> Result<SyncReport> {
        self.resolve()?;

        let repo_id = self.repo_id;
        let synced_at = current_timestamp();

        let affected = db::transaction(&mut *self.conn, |tx| {
            let mut stmt = tx.prepare(
                "SELECT package_id FROM main.app_metadata WHERE repo_id = ?1
                 UNION
                 SELECT package_id FROM staging.app_metadata WHERE repo_id = ?1",
            )?;
            let affected = stmt
                .query_map([repo_id], |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            tx.execute("DELETE FROM main.app_metadata WHERE repo_id = ?1", [repo_id])?;
            for (columns, table) in [
                (METADATA_COLUMNS, "app_metadata"),
                (VERSION_COLUMNS, "versions"),
                (CATEGORY_JOIN_COLUMNS, "category_joins"),
            ] {
                tx.execute(
                    &schema::copy_rows(
                        columns,
                        &format!("{}.{}", STAGING_SCHEMA, table),
                        &format!("main.{}", table),
                        "repo_id = ?1",
                    ),
                    [repo_id],
                )?;
            }

            resolver::update_preferred_metadata(tx, &affected)?;
            Repository::mark_synced(tx, repo_id, token, &synced_at)?;
            Ok(affected)
        })?;

        self.report.token = token.map(str::to_string);
        self.report.affected = affected;

        info!(
            "Synchronized repository {}: {} packages, {} versions, {} skipped, {} removed",
            self.repo.name,
            self.report.packages,
            self.report.versions,
            self.report.skipped,
            self.report.removed_packages
        );
        Ok(std::mem::take(&mut self.report))
    }
}

impl Drop for RepoSync<'_> {
    fn drop(&mut self) {
        schema::detach_staging(self.conn);
    }
}

fn version_row(package_id: i64, repo_id: i64, v: IndexVersion) -> Version {
    let mut version = Version::new(package_id, repo_id, v.version_code, v.file_name, v.hash);
    version.version_name = v.version_name;
    version.hash_type = v.hash_type;
    version.signer = v.signer;
    version.size = v.size;
    version.min_sdk = v.min_sdk;
    version.target_sdk = v.target_sdk;
    version.max_sdk = v.max_sdk;
    version.permissions = v.permissions;
    version.features = v.features;
    version.native_code = v.native_code;
    version.release_channels = v.release_channels;
    version.anti_features = v.anti_features;
    version.added = v.added;
    version
}

fn write_staged(conn: &Connection, entry: &StagedEntry) -> Result<()> {
    let package_id = entry.metadata.package_id;
    let repo_id = entry.metadata.repo_id;

    entry.metadata.upsert(conn, STAGING_SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO staging.seen_metadata (package_id) VALUES (?1)",
        [package_id],
    )?;

    conn.execute(
        "DELETE FROM staging.category_joins WHERE package_id = ?1 AND repo_id = ?2",
        [package_id, repo_id],
    )?;
    for category_id in &entry.category_ids {
        conn.execute(
            "INSERT OR IGNORE INTO staging.category_joins (package_id, repo_id, category_id)
             VALUES (?1, ?2, ?3)",
            params![package_id, repo_id, category_id],
        )?;
    }

    for version in &entry.versions {
        version.upsert(conn, STAGING_SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO staging.seen_versions (package_id, version_code)
             VALUES (?1, ?2)",
            [package_id, version.version_code],
        )?;
    }

    Ok(())
}

fn staged_package_ids(conn: &Connection, repo_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT package_id FROM staging.app_metadata WHERE repo_id = ?1 ORDER BY package_id",
    )?;

    let ids = stmt
        .query_map([repo_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ids)
}

/// Apply a complete index to one repository
///
/// `entries` is the verified index stream. An `Err` item aborts the sync
/// and leaves the catalog as it was; so does any storage failure. When
/// `token` matches the last successful sync nothing is staged, unless
/// `force` is set. The token is recorded either way.
#[allow(clippy::too_many_arguments)]
pub fn sync_repository<I>(
    conn: &mut Connection,
    repo_id: i64,
    names: &NameCache,
    checker: &dyn CompatibilityChecker,
    config: &SyncConfig,
    token: Option<&str>,
    force: bool,
    entries: I,
) -> Result<SyncReport>
where
    I: IntoIterator<Item = Result<IndexEntry>>,
{
    let repo = Repository::find_by_id(conn, repo_id)?
        .ok_or_else(|| Error::NotFoundError(format!("Repository {} not found", repo_id)))?;

    if !force && repo.token_matches(token) {
        info!("Repository {} unchanged since last sync, skipping", repo.name);
        return Ok(SyncReport {
            repo_id,
            token: token.map(str::to_string),
            unchanged: true,
            ..SyncReport::default()
        });
    }

    let mut sync = RepoSync::new(conn, repo_id, names, checker, config)?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            warn!("Index stream for repository {} failed: {}", repo_id, e);
            Error::SyncAborted(e.to_string())
        })?;
        sync.save(entry)?;
    }

    sync.commit(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::AllCompatible;
    use crate::db::models::MAIN;
    use crate::repository::add_repository;

    fn entry(package: &str, codes: &[i64]) -> IndexEntry {
        IndexEntry {
            package_name: package.to_string(),
            name: package.to_string(),
            categories: vec!["Tools".to_string()],
            versions: codes
                .iter()
                .map(|&code| IndexVersion {
                    version_code: code,
                    version_name: Some(format!("{}.0", code)),
                    file_name: format!("{}_{}.apk", package, code),
                    hash: format!("{:x}", code),
                    ..IndexVersion::default()
                })
                .collect(),
            ..IndexEntry::default()
        }
    }

    fn setup() -> (Connection, i64) {
        let conn = db::open_in_memory().unwrap();
        let repo = add_repository(
            &conn,
            "main".to_string(),
            "https://example.org/repo".to_string(),
            None,
            true,
            0,
        )
        .unwrap();
        (conn, repo.id.unwrap())
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_name_cache_reuses_ids() {
        let conn = db::open_in_memory().unwrap();
        let cache = NameCache::new();

        let a = cache.package_id(&conn, "org.example").unwrap();
        let b = cache.package_id(&conn, "org.example").unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);

        // A second cache sees the same row
        let other = NameCache::new();
        assert_eq!(other.package_id(&conn, "org.example").unwrap(), a);
    }

    #[test]
    fn test_sync_stages_and_swaps() {
        let (mut conn, repo_id) = setup();
        let names = NameCache::new();
        let config = SyncConfig {
            batch_size: 2,
            ..SyncConfig::default()
        };

        let entries = vec![
            entry("org.example.a", &[1, 2]),
            entry("org.example.b", &[1]),
            entry("org.example.c", &[3]),
        ];
        let report = sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            false,
            entries.into_iter().map(Ok),
        )
        .unwrap();

        assert_eq!(report.packages, 3);
        assert_eq!(report.versions, 4);
        assert_eq!(report.preferred, 3);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM versions"), 4);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM category_joins"), 3);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM packages WHERE preferred_repo_id IS NOT NULL"),
            3
        );

        let package_id = Package::find_id(&conn, "org.example.a").unwrap().unwrap();
        let metadata = AppMetadata::find(&conn, package_id, repo_id).unwrap().unwrap();
        assert!(metadata.compatible);
        assert_eq!(metadata.suggested_version_code, Some(2));
        assert_eq!(metadata.auto_install_version_name.as_deref(), Some("2.0"));

        let repo = Repository::find_by_id(&conn, repo_id).unwrap().unwrap();
        assert_eq!(repo.sync_token.as_deref(), Some("etag-1"));
        assert!(repo.last_sync.is_some());
    }

    #[test]
    fn test_unchanged_token_skips() {
        let (mut conn, repo_id) = setup();
        let names = NameCache::new();
        let config = SyncConfig::default();

        sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            false,
            vec![Ok(entry("org.example.a", &[1]))],
        )
        .unwrap();

        let report = sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            false,
            Vec::new(),
        )
        .unwrap();
        assert!(report.unchanged);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM versions"), 1);
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let (mut conn, repo_id) = setup();
        let names = NameCache::new();

        let mut bad = entry("org.example.bad", &[1]);
        bad.versions[0].hash = String::new();

        let report = sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &SyncConfig::default(),
            None,
            false,
            vec![Ok(bad), Ok(entry("org.example.good", &[1]))],
        )
        .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.packages, 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM app_metadata"), 1);
    }

    #[test]
    fn test_failed_stream_leaves_catalog_untouched() {
        let (mut conn, repo_id) = setup();
        let names = NameCache::new();
        let config = SyncConfig::default();

        sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            false,
            vec![Ok(entry("org.example.a", &[1, 2]))],
        )
        .unwrap();

        let result = sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-2"),
            false,
            vec![
                Ok(entry("org.example.b", &[1])),
                Err(Error::ParseError("truncated index".to_string())),
            ],
        );
        assert!(matches!(result, Err(Error::SyncAborted(_))));

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM app_metadata"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM versions"), 2);
        let repo = Repository::find_by_id(&conn, repo_id).unwrap().unwrap();
        assert_eq!(repo.sync_token.as_deref(), Some("etag-1"));

        // Staging was detached
        assert!(conn.execute_batch("SELECT 1 FROM staging.versions").is_err());
    }

    #[test]
    fn test_orphans_are_removed() {
        let (mut conn, repo_id) = setup();
        let names = NameCache::new();
        let config = SyncConfig::default();

        sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            None,
            false,
            vec![Ok(entry("org.example.a", &[4, 5])), Ok(entry("org.example.b", &[1]))],
        )
        .unwrap();

        let report = sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            None,
            false,
            vec![Ok(entry("org.example.a", &[4]))],
        )
        .unwrap();

        assert_eq!(report.removed_versions, 2);
        assert_eq!(report.removed_packages, 1);

        let a = Package::find_id(&conn, "org.example.a").unwrap().unwrap();
        let b = Package::find_by_name(&conn, "org.example.b").unwrap().unwrap();
        assert!(Version::find(&conn, a, repo_id, 5).unwrap().is_none());
        assert_eq!(
            AppMetadata::find(&conn, a, repo_id).unwrap().unwrap().suggested_version_code,
            Some(4)
        );
        assert_eq!(b.preferred_repo_id, None);
        assert!(AppMetadata::find_by_repository(&conn, MAIN, repo_id)
            .unwrap()
            .iter()
            .all(|m| m.package_id == a));
    }

    #[test]
    fn test_forced_sync_records_index_token() {
        let (mut conn, repo_id) = setup();
        let names = NameCache::new();
        let config = SyncConfig::default();
        let index = || vec![Ok(entry("org.example.a", &[1]))];

        sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            false,
            index(),
        )
        .unwrap();

        let forced = sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            true,
            index(),
        )
        .unwrap();
        assert!(!forced.unchanged);
        assert_eq!(forced.packages, 1);

        let repo = Repository::find_by_id(&conn, repo_id).unwrap().unwrap();
        assert_eq!(repo.sync_token.as_deref(), Some("etag-1"));

        let again = sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            false,
            index(),
        )
        .unwrap();
        assert!(again.unchanged);
    }

    #[test]
    fn test_unchanged_token_does_not_stage() {
        let (mut conn, repo_id) = setup();
        let names = NameCache::new();
        let config = SyncConfig::default();

        sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            false,
            vec![Ok(entry("org.example.a", &[1]))],
        )
        .unwrap();

        // A skipped sync leaves an attached staging schema as it found it
        schema::attach_staging(&conn).unwrap();
        conn.execute(
            "INSERT INTO staging.app_metadata (package_id, repo_id, name)
             VALUES (42, 42, 'marker')",
            [],
        )
        .unwrap();
        let report = sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            false,
            Vec::new(),
        )
        .unwrap();
        assert!(report.unchanged);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM staging.app_metadata"), 1);
        schema::detach_staging(&conn);
    }

    #[test]
    fn test_staged_batches_stay_out_of_catalog() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.db").to_string_lossy().into_owned();
        db::init(&path).unwrap();
        let mut conn = db::open(&path).unwrap();
        let reader = db::open(&path).unwrap();

        let repo_id = add_repository(
            &conn,
            "main".to_string(),
            "https://example.org/repo".to_string(),
            None,
            true,
            0,
        )
        .unwrap()
        .id
        .unwrap();
        let names = NameCache::new();
        let config = SyncConfig {
            batch_size: 1,
            ..SyncConfig::default()
        };

        sync_repository(
            &mut conn,
            repo_id,
            &names,
            &AllCompatible,
            &config,
            Some("etag-1"),
            false,
            vec![Ok(entry("org.example.a", &[1, 2]))],
        )
        .unwrap();

        let catalog_rows = |conn: &Connection| {
            (
                AppMetadata::find_by_repository(conn, MAIN, repo_id).unwrap(),
                count(conn, "SELECT COUNT(*) FROM versions"),
                count(conn, "SELECT COUNT(*) FROM category_joins"),
            )
        };
        let before = catalog_rows(&reader);
        assert_eq!(before.0.len(), 1);

        let mut sync = RepoSync::new(&mut conn, repo_id, &names, &AllCompatible, &config).unwrap();
        sync.save(entry("org.example.a", &[3])).unwrap();
        sync.save(entry("org.example.b", &[1])).unwrap();
        sync.save(entry("org.example.c", &[1, 2])).unwrap();
        assert_eq!(sync.repository().name, "main");
        assert_eq!(sync.report.packages, 3);
        assert!(sync.buffer.is_empty());

        assert_eq!(catalog_rows(&reader), before);

        drop(sync);
        assert_eq!(catalog_rows(&reader), before);
        assert_eq!(catalog_rows(&conn), before);
        assert!(conn.execute_batch("SELECT 1 FROM staging.versions").is_err());
    }
}
