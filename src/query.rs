// src/query.rs

//! Read-side queries over the resolved catalog
//!
//! Every list here shows a package through its preferred metadata only, so
//! a package no enabled repository offers is invisible. Queries are built
//! from a [`Selection`] (a WHERE clause with its arguments) and optional
//! extra joins, then run by [`AppQuery`].

use crate::db::models::{
    AppMetadata, Category, InstalledSnapshot, KNOWN_VULN, MAIN, Package, UserPrefs, Version,
};
use crate::error::Result;
use crate::resolver::{self, UpdateStatus};
use rusqlite::Connection;
use rusqlite::types::Value;

/// A WHERE clause and its positional arguments
#[derive(Debug, Clone, Default)]
pub struct Selection {
    clauses: Vec<String>,
    args: Vec<Value>,
}

impl Selection {
    pub fn new(clause: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            clauses: vec![clause.into()],
            args,
        }
    }

    /// Combine with another selection; both must hold
    pub fn and(mut self, other: Selection) -> Self {
        self.clauses.extend(other.clauses);
        self.args.extend(other.args);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The combined clause, or `1` when nothing is selected
    pub fn clause(&self) -> String {
        if self.clauses.is_empty() {
            "1".to_string()
        } else {
            self.clauses
                .iter()
                .map(|c| format!("({})", c))
                .collect::<Vec<_>>()
                .join(" AND ")
        }
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }
}

/// A package as the catalog presents it
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogApp {
    pub package_name: String,
    pub metadata: AppMetadata,
}

/// Everything known about one package
#[derive(Debug, Clone, PartialEq)]
pub struct AppDetails {
    pub app: CatalogApp,
    pub categories: Vec<String>,
    /// Preferred repository's versions, highest first
    pub versions: Vec<Version>,
    pub installed: Option<InstalledSnapshot>,
    pub prefs: UserPrefs,
    /// Version to offer for install right now
    pub suggested_apk: Option<Version>,
    pub status: UpdateStatus,
}

/// Query over packages joined to their preferred metadata
#[derive(Debug, Clone, Default)]
pub struct AppQuery {
    joins: Vec<String>,
    selection: Selection,
}

impl AppQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(mut self, join: impl Into<String>) -> Self {
        self.joins.push(join.into());
        self
    }

    pub fn filter(mut self, selection: Selection) -> Self {
        self.selection = self.selection.and(selection);
        self
    }

    pub fn sql(&self) -> String {
        format!(
            "SELECT DISTINCT p.name, m.package_id, m.repo_id, m.name, m.summary, m.description,
                    m.icon, m.license, m.web_site, m.source_code, m.added, m.last_updated,
                    m.preferred_signer, m.upstream_version_code, m.is_compatible,
                    m.suggested_version_code, m.auto_install_version_name
             FROM packages p
             JOIN app_metadata m ON m.package_id = p.id AND m.repo_id = p.preferred_repo_id
             {}
             WHERE {}
             ORDER BY m.name COLLATE NOCASE, p.name",
            self.joins.join("\n"),
            self.selection.clause()
        )
    }

    pub fn run(&self, conn: &Connection) -> Result<Vec<CatalogApp>> {
        let mut stmt = conn.prepare(&self.sql())?;

        let apps = stmt
            .query_map(rusqlite::params_from_iter(self.selection.args()), |row| {
                let package_name: String = row.get(0)?;
                let metadata = metadata_from_offset(row)?;
                Ok(CatalogApp {
                    package_name,
                    metadata,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(apps)
    }
}

fn metadata_from_offset(row: &rusqlite::Row) -> rusqlite::Result<AppMetadata> {
    Ok(AppMetadata {
        package_id: row.get(1)?,
        repo_id: row.get(2)?,
        name: row.get(3)?,
        summary: row.get(4)?,
        description: row.get(5)?,
        icon: row.get(6)?,
        license: row.get(7)?,
        web_site: row.get(8)?,
        source_code: row.get(9)?,
        added: row.get(10)?,
        last_updated: row.get(11)?,
        preferred_signer: row.get(12)?,
        upstream_version_code: row.get(13)?,
        compatible: row.get::<_, i32>(14)? != 0,
        suggested_version_code: row.get(15)?,
        auto_install_version_name: row.get(16)?,
    })
}

/// Escape LIKE wildcards in user input
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Every visible package
pub fn list(conn: &Connection) -> Result<Vec<CatalogApp>> {
    AppQuery::new().run(conn)
}

/// Packages whose name, package name, summary or description contain `term`
pub fn search(conn: &Connection, term: &str) -> Result<Vec<CatalogApp>> {
    let pattern = Value::Text(like_pattern(term));
    AppQuery::new()
        .filter(Selection::new(
            "p.name LIKE ?1 ESCAPE '\\' OR m.name LIKE ?1 ESCAPE '\\'
             OR m.summary LIKE ?1 ESCAPE '\\' OR m.description LIKE ?1 ESCAPE '\\'",
            vec![pattern],
        ))
        .run(conn)
}

/// Visible packages whose preferred metadata is in `category`
pub fn by_category(conn: &Connection, category: &str) -> Result<Vec<CatalogApp>> {
    AppQuery::new()
        .join(
            "JOIN category_joins cj ON cj.package_id = m.package_id AND cj.repo_id = m.repo_id
             JOIN categories c ON c.id = cj.category_id",
        )
        .filter(Selection::new(
            "c.name = ?1",
            vec![Value::Text(category.to_string())],
        ))
        .run(conn)
}

/// Categories with at least one visible package
pub fn categories(conn: &Connection) -> Result<Vec<String>> {
    Category::list_in_use(conn)
}

/// Visible packages that are installed
pub fn installed(conn: &Connection) -> Result<Vec<CatalogApp>> {
    AppQuery::new()
        .join("JOIN installed_apps i ON i.package_name = p.name")
        .run(conn)
}

/// Installed packages with an update the user wants, with their status
pub fn updates(conn: &Connection) -> Result<Vec<(CatalogApp, UpdateStatus)>> {
    let mut pending = Vec::new();

    for app in installed(conn)? {
        let snapshot = InstalledSnapshot::find(conn, &app.package_name)?;
        let prefs = UserPrefs::find_or_default(conn, &app.package_name)?;
        let status = UpdateStatus::compute(
            snapshot.as_ref(),
            app.metadata.suggested_version_code,
            &prefs,
        );
        if status.can_and_want_to_update {
            pending.push((app, status));
        }
    }

    Ok(pending)
}

/// Installed packages whose installed version is flagged as vulnerable
///
/// Packages whose preferences ignore vulnerabilities are left out.
pub fn installed_with_known_vulnerability(conn: &Connection) -> Result<Vec<CatalogApp>> {
    AppQuery::new()
        .join(
            "JOIN installed_apps i ON i.package_name = p.name
             JOIN versions v ON v.package_id = p.id AND v.repo_id = p.preferred_repo_id
                            AND v.version_code = i.version_code
             LEFT JOIN user_prefs up ON up.package_name = p.name",
        )
        .filter(Selection::new(
            "EXISTS (SELECT 1 FROM json_each(v.anti_features) WHERE value = ?1)
             AND COALESCE(up.ignore_vulnerabilities, 0) = 0",
            vec![Value::Text(KNOWN_VULN.to_string())],
        ))
        .run(conn)
}

/// Preferred metadata and versions of one package, resolved for install
///
/// `default_channel` applies when the package has no channel preference.
pub fn get_by_package(
    conn: &Connection,
    package_name: &str,
    default_channel: &str,
) -> Result<Option<AppDetails>> {
    let Some(package) = Package::find_by_name(conn, package_name)? else {
        return Ok(None);
    };
    let Some(repo_id) = package.preferred_repo_id else {
        return Ok(None);
    };
    let Some(metadata) = AppMetadata::find(conn, package.id, repo_id)? else {
        return Ok(None);
    };

    let categories = Category::names_for(conn, package.id, repo_id)?;
    let versions = Version::find_by_package_repo(conn, MAIN, package.id, repo_id)?;
    let installed = InstalledSnapshot::find(conn, package_name)?;
    let prefs = UserPrefs::find_or_default(conn, package_name)?;

    let channel = prefs.release_channel.as_deref().unwrap_or(default_channel);
    let suggested_apk = resolver::find_suggested_apk(
        &versions,
        installed.as_ref().and_then(|i| i.signer.as_deref()),
        metadata.preferred_signer.as_deref(),
        channel,
    )
    .cloned();

    let status = UpdateStatus::compute(
        installed.as_ref(),
        metadata.suggested_version_code,
        &prefs,
    );

    Ok(Some(AppDetails {
        app: CatalogApp {
            package_name: package.name,
            metadata,
        },
        categories,
        versions,
        installed,
        prefs,
        suggested_apk,
        status,
    }))
}
