// src/catalog.rs

//! The catalog handle
//!
//! [`Catalog`] is the single mutation entry point: repository syncs and
//! settings, user preferences, and the installed-package snapshots reported
//! by the device scanner all go through it, and each successful mutation
//! publishes a [`CatalogEvent`]. Reads go straight to [`crate::query`] on a
//! connection from [`Catalog::connection`].
//!
//! A `Catalog` is `Sync`; share it across threads with an `Arc`. Syncs of
//! different repositories run concurrently, each on its own connection.
//! Syncs of the same repository are serialized.

use crate::compat::CompatibilityChecker;
use crate::config::Config;
use crate::db;
use crate::db::models::{AppMetadata, InstalledSnapshot, MAIN, Package, Repository, UserPrefs};
use crate::error::{Error, Result};
use crate::notify::{CatalogEvent, Notifier};
use crate::repository::{self, IndexEntry, NameCache, SyncReport};
use crate::resolver;
use crossbeam::channel::Receiver;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

pub struct Catalog {
    config: Config,
    checker: Box<dyn CompatibilityChecker>,
    names: Arc<NameCache>,
    notifier: Notifier,
    sync_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Catalog {
    /// Open (creating if needed) the catalog described by `config`
    ///
    /// Versions are checked against `config.device` unless another checker
    /// is installed with [`Catalog::with_checker`].
    pub fn open(config: Config) -> Result<Self> {
        db::init(&config.db_path)?;

        Ok(Self {
            checker: Box::new(config.device.clone()),
            config,
            names: Arc::new(NameCache::new()),
            notifier: Notifier::new(),
            sync_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_checker(mut self, checker: impl CompatibilityChecker + 'static) -> Self {
        self.checker = Box::new(checker);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh connection for reads
    pub fn connection(&self) -> Result<Connection> {
        db::open(&self.config.db_path)
    }

    pub fn subscribe(&self) -> Receiver<CatalogEvent> {
        self.notifier.subscribe()
    }

    fn repo_lock(&self, repo_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.sync_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(repo_id).or_default())
    }

    fn repo_id(&self, conn: &Connection, name: &str) -> Result<i64> {
        repository::find_repository(conn, name)?
            .id
            .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' has no ID", name)))
    }

    /// Apply a verified index to one repository
    ///
    /// Blocks while another sync of the same repository is running. An
    /// index whose `token` matches the last sync is skipped unless `force`.
    pub fn sync<I>(
        &self,
        repo_id: i64,
        token: Option<&str>,
        force: bool,
        entries: I,
    ) -> Result<SyncReport>
    where
        I: IntoIterator<Item = Result<IndexEntry>>,
    {
        let lock = self.repo_lock(repo_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut conn = self.connection()?;
        let report = repository::sync_repository(
            &mut conn,
            repo_id,
            &self.names,
            self.checker.as_ref(),
            &self.config.sync,
            token,
            force,
            entries,
        )?;

        if !report.unchanged {
            self.notifier.publish(CatalogEvent::CatalogChanged {
                repo_id: Some(repo_id),
            });
        }
        Ok(report)
    }

    /// All configured repositories, most preferred first
    pub fn repositories(&self) -> Result<Vec<Repository>> {
        let conn = self.connection()?;
        Repository::list_all(&conn)
    }

    pub fn add_repository(
        &self,
        name: &str,
        address: &str,
        certificate: Option<&str>,
        priority: i32,
    ) -> Result<Repository> {
        let conn = self.connection()?;
        let repo = repository::add_repository(
            &conn,
            name.to_string(),
            address.to_string(),
            certificate.map(str::to_string),
            true,
            priority,
        )?;
        self.notifier
            .publish(CatalogEvent::CatalogChanged { repo_id: repo.id });
        Ok(repo)
    }

    /// Remove a repository, waiting for any sync of it to finish first
    pub fn remove_repository(&self, name: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let repo_id = self.repo_id(&conn, name)?;

        let lock = self.repo_lock(repo_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        repository::remove_repository(&mut conn, name)?;
        self.notifier.publish(CatalogEvent::CatalogChanged {
            repo_id: Some(repo_id),
        });
        Ok(())
    }

    pub fn set_repository_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut conn = self.connection()?;
        let repo_id = self.repo_id(&conn, name)?;
        repository::set_repository_enabled(&mut conn, name, enabled)?;
        self.notifier.publish(CatalogEvent::CatalogChanged {
            repo_id: Some(repo_id),
        });
        Ok(())
    }

    pub fn set_repository_priority(&self, name: &str, priority: i32) -> Result<()> {
        let mut conn = self.connection()?;
        let repo_id = self.repo_id(&conn, name)?;
        repository::set_repository_priority(&mut conn, name, priority)?;
        self.notifier.publish(CatalogEvent::CatalogChanged {
            repo_id: Some(repo_id),
        });
        Ok(())
    }

    /// Preferences for a package (all off when never set)
    pub fn prefs(&self, package_name: &str) -> Result<UserPrefs> {
        let conn = self.connection()?;
        UserPrefs::find_or_default(&conn, package_name)
    }

    pub fn set_prefs(&self, prefs: &UserPrefs) -> Result<()> {
        let conn = self.connection()?;
        prefs.save(&conn)?;

        debug!("Saved preferences for {}", prefs.package_name);
        self.notifier.publish(CatalogEvent::PackageChanged {
            package_name: prefs.package_name.clone(),
        });
        Ok(())
    }

    /// Record what the device has installed for a package
    ///
    /// The installed signer constrains suggested versions, so they are
    /// re-derived for every repository offering the package.
    pub fn record_installed(&self, snapshot: &InstalledSnapshot) -> Result<()> {
        let mut conn = self.connection()?;
        let unstable = self.config.sync.unstable_updates;

        db::transaction(&mut conn, |tx| {
            snapshot.upsert(tx)?;
            rederive_package(tx, &snapshot.package_name, unstable)
        })?;

        info!(
            "Recorded {} installed at version {}",
            snapshot.package_name, snapshot.version_code
        );
        self.notifier.publish(CatalogEvent::PackageChanged {
            package_name: snapshot.package_name.clone(),
        });
        Ok(())
    }

    /// Record that a package is no longer installed
    pub fn forget_installed(&self, package_name: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let unstable = self.config.sync.unstable_updates;

        db::transaction(&mut conn, |tx| {
            InstalledSnapshot::delete(tx, package_name)?;
            rederive_package(tx, package_name, unstable)
        })?;

        info!("Recorded {} as uninstalled", package_name);
        self.notifier.publish(CatalogEvent::PackageChanged {
            package_name: package_name.to_string(),
        });
        Ok(())
    }
}

fn rederive_package(conn: &Connection, package_name: &str, unstable: bool) -> Result<()> {
    let Some(package_id) = Package::find_id(conn, package_name)? else {
        return Ok(());
    };

    for metadata in AppMetadata::find_by_package(conn, package_id)? {
        resolver::update_derived(conn, MAIN, package_id, metadata.repo_id, unstable)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::AllCompatible;
    use crate::repository::IndexVersion;
    use tempfile::TempDir;

    fn catalog() -> (TempDir, Catalog) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            db_path: dir.path().join("catalog.db").to_string_lossy().into_owned(),
            ..Config::default()
        };
        let catalog = Catalog::open(config).unwrap().with_checker(AllCompatible);
        (dir, catalog)
    }

    fn signed_entry(package: &str, versions: &[(i64, &str)]) -> IndexEntry {
        IndexEntry {
            package_name: package.to_string(),
            name: package.to_string(),
            versions: versions
                .iter()
                .map(|&(code, signer)| IndexVersion {
                    version_code: code,
                    file_name: format!("{}.apk", code),
                    hash: format!("{:x}", code),
                    signer: Some(signer.to_string()),
                    ..IndexVersion::default()
                })
                .collect(),
            ..IndexEntry::default()
        }
    }

    #[test]
    fn test_sync_notifies_once() {
        let (_dir, catalog) = catalog();
        let repo = catalog
            .add_repository("main", "https://example.org", None, 0)
            .unwrap();
        let events = catalog.subscribe();

        catalog
            .sync(
                repo.id.unwrap(),
                Some("t1"),
                false,
                vec![Ok(signed_entry("org.example", &[(1, "a")]))],
            )
            .unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            CatalogEvent::CatalogChanged { repo_id: repo.id }
        );
        assert!(events.try_recv().is_err());

        // Unchanged token: no notification
        catalog.sync(repo.id.unwrap(), Some("t1"), false, Vec::new()).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_prefs_notify_package_changed() {
        let (_dir, catalog) = catalog();
        let events = catalog.subscribe();

        let mut prefs = catalog.prefs("org.example").unwrap();
        prefs.ignore_all_updates = true;
        catalog.set_prefs(&prefs).unwrap();

        assert!(catalog.prefs("org.example").unwrap().ignore_all_updates);
        assert_eq!(
            events.try_recv().unwrap(),
            CatalogEvent::PackageChanged {
                package_name: "org.example".to_string()
            }
        );
    }

    #[test]
    fn test_record_installed_rederives_suggested() {
        let (_dir, catalog) = catalog();
        let repo = catalog
            .add_repository("main", "https://example.org", None, 0)
            .unwrap();
        let repo_id = repo.id.unwrap();
        catalog
            .sync(
                repo_id,
                None,
                false,
                vec![Ok(signed_entry("org.example", &[(2, "x"), (4, "y")]))],
            )
            .unwrap();

        let conn = catalog.connection().unwrap();
        let package_id = Package::find_id(&conn, "org.example").unwrap().unwrap();
        let suggested = |conn: &Connection| {
            AppMetadata::find(conn, package_id, repo_id)
                .unwrap()
                .unwrap()
                .suggested_version_code
        };
        assert_eq!(suggested(&conn), Some(4));

        let mut snapshot = InstalledSnapshot::new("org.example".to_string(), 2);
        snapshot.signer = Some("x".to_string());
        catalog.record_installed(&snapshot).unwrap();
        assert_eq!(suggested(&conn), Some(2));

        catalog.forget_installed("org.example").unwrap();
        assert_eq!(suggested(&conn), Some(4));
    }

    #[test]
    fn test_unknown_repository() {
        let (_dir, catalog) = catalog();
        assert!(matches!(
            catalog.remove_repository("missing"),
            Err(Error::NotFoundError(_))
        ));
        assert!(matches!(
            catalog.sync(42, None, false, Vec::new()),
            Err(Error::NotFoundError(_))
        ));
    }
}
