// src/resolver/mod.rs

//! Resolution of competing repository offerings
//!
//! Several repositories may publish the same package. This module decides:
//! - which repository's metadata a package presents (preferred metadata)
//! - which version each repository's metadata suggests (suggested version)
//! - which version to actually offer for install at read time
//! - whether an installed package has an update the user wants
//!
//! The selection rules are plain functions over model values; the
//! `update_*` functions apply them to rows in the primary catalog or in a
//! sync's staging copy.

use crate::db::models::{InstalledSnapshot, Package, UserPrefs, Version};
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::cmp::Reverse;
use tracing::debug;

/// One repository's claim on a package, as seen by preference resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offering {
    pub repo_id: i64,
    pub priority: i32,
    pub enabled: bool,
}

/// Pick the winning offering: enabled, highest priority, then lowest repo id
pub fn choose_preferred(offerings: &[Offering]) -> Option<i64> {
    offerings
        .iter()
        .filter(|o| o.enabled)
        .max_by_key(|o| (o.priority, Reverse(o.repo_id)))
        .map(|o| o.repo_id)
}

/// Load every repository's offering of `package_id` from `schema`.app_metadata
///
/// Priorities and enabled flags always come from the primary repositories
/// table; only the metadata rows vary between the catalog and staging.
pub fn offerings(conn: &Connection, schema: &str, package_id: i64) -> Result<Vec<Offering>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT m.repo_id, r.priority, r.enabled
         FROM {}.app_metadata m
         JOIN main.repositories r ON r.id = m.repo_id
         WHERE m.package_id = ?1",
        schema
    ))?;

    let offerings = stmt
        .query_map([package_id], |row| {
            Ok(Offering {
                repo_id: row.get(0)?,
                priority: row.get(1)?,
                enabled: row.get::<_, i32>(2)? != 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(offerings)
}

/// Recompute `packages.preferred_repo_id` for each package in `package_ids`
///
/// Must run inside the same transaction as whatever changed the offerings.
/// Returns the number of packages whose preference changed.
pub fn update_preferred_metadata(conn: &Connection, package_ids: &[i64]) -> Result<usize> {
    let mut changed = 0;

    for &package_id in package_ids {
        let winner = choose_preferred(&offerings(conn, "main", package_id)?);
        let current: Option<i64> = conn
            .query_row(
                "SELECT preferred_repo_id FROM packages WHERE id = ?1",
                [package_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();

        if current != winner {
            Package::set_preferred(conn, package_id, winner)?;
            changed += 1;
        }
    }

    debug!(
        "Recomputed preferred metadata for {} packages ({} changed)",
        package_ids.len(),
        changed
    );
    Ok(changed)
}

/// Choose the version a repository's metadata suggests
///
/// `versions` are the repository's versions of one package. When a signer
/// is installed only versions with that signer qualify. Unless unstable
/// updates are allowed, versions above the upstream stable code are only
/// used when nothing at or below it qualifies.
pub fn select_suggested_version<'a>(
    versions: &'a [Version],
    upstream_version_code: Option<i64>,
    installed_signer: Option<&str>,
    unstable_updates: bool,
) -> Option<&'a Version> {
    let candidates: Vec<&Version> = versions
        .iter()
        .filter(|v| match installed_signer {
            Some(signer) => v.signer.as_deref() == Some(signer),
            None => true,
        })
        .collect();

    if let Some(upstream) = upstream_version_code
        && upstream > 0
        && !unstable_updates
    {
        let stable = candidates
            .iter()
            .copied()
            .filter(|v| v.version_code <= upstream);
        if let Some(version) = best_version(stable) {
            return Some(version);
        }
    }

    best_version(candidates)
}

/// Highest compatible version, else highest version regardless of compatibility
fn best_version<'a>(versions: impl IntoIterator<Item = &'a Version>) -> Option<&'a Version> {
    let mut best: Option<&Version> = None;
    let mut best_compatible: Option<&Version> = None;

    for version in versions {
        if best.is_none_or(|b| version.version_code > b.version_code) {
            best = Some(version);
        }
        if version.compatible
            && best_compatible.is_none_or(|b| version.version_code > b.version_code)
        {
            best_compatible = Some(version);
        }
    }

    best_compatible.or(best)
}

/// Derived fields written back to one metadata row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derived {
    pub compatible: bool,
    pub suggested_version_code: Option<i64>,
    pub auto_install_version_name: Option<String>,
}

/// Recompute the derived fields of one `schema`.app_metadata row
///
/// The compatible flag is true if any version of the row is compatible.
/// The suggested version always points at one of the row's own versions.
pub fn update_derived(
    conn: &Connection,
    schema: &str,
    package_id: i64,
    repo_id: i64,
    unstable_updates: bool,
) -> Result<Derived> {
    let upstream: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT upstream_version_code FROM {}.app_metadata
                 WHERE package_id = ?1 AND repo_id = ?2",
                schema
            ),
            [package_id, repo_id],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten();

    let versions = Version::find_by_package_repo(conn, schema, package_id, repo_id)?;
    let installed_signer = installed_signer(conn, package_id)?;

    let suggested = select_suggested_version(
        &versions,
        upstream,
        installed_signer.as_deref(),
        unstable_updates,
    );

    let derived = Derived {
        compatible: versions.iter().any(|v| v.compatible),
        suggested_version_code: suggested.map(|v| v.version_code),
        auto_install_version_name: suggested.and_then(|v| v.version_name.clone()),
    };

    conn.execute(
        &format!(
            "UPDATE {}.app_metadata
             SET is_compatible = ?1, suggested_version_code = ?2, auto_install_version_name = ?3
             WHERE package_id = ?4 AND repo_id = ?5",
            schema
        ),
        params![
            derived.compatible as i32,
            derived.suggested_version_code,
            derived.auto_install_version_name,
            package_id,
            repo_id,
        ],
    )?;

    Ok(derived)
}

/// Signer of the installed copy of a package, if it is installed
fn installed_signer(conn: &Connection, package_id: i64) -> Result<Option<String>> {
    let signer = conn
        .query_row(
            "SELECT i.signer FROM main.installed_apps i
             JOIN main.packages p ON p.name = i.package_name
             WHERE p.id = ?1",
            [package_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten();
    Ok(signer)
}

/// True if `version` belongs to the `channel` release channel
///
/// Untagged versions are stable releases and belong to every channel.
pub fn in_release_channel(version: &Version, channel: &str) -> bool {
    version.release_channels.is_empty() || version.release_channels.iter().any(|c| c == channel)
}

/// Pick the version to offer for install, evaluated at read time
///
/// `versions` must be the preferred repository's versions of the package,
/// highest version code first. The signer constraint is the installed
/// signer, else the repository's preferred signer, else none.
pub fn find_suggested_apk<'a>(
    versions: &'a [Version],
    installed_signer: Option<&str>,
    preferred_signer: Option<&str>,
    release_channel: &str,
) -> Option<&'a Version> {
    let signer = installed_signer.or(preferred_signer);
    let signer_matches = |v: &Version| match signer {
        Some(signer) => v.signer.as_deref() == Some(signer),
        None => true,
    };

    versions
        .iter()
        .find(|v| v.compatible && signer_matches(v) && in_release_channel(v, release_channel))
        .or_else(|| versions.iter().find(|v| v.compatible && signer_matches(v)))
        .or_else(|| versions.first())
}

/// Whether an installed package has an update, and whether the user wants it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStatus {
    pub installed_version_code: i64,
    pub suggested_version_code: i64,
    pub has_updates: bool,
    pub can_and_want_to_update: bool,
}

impl UpdateStatus {
    pub fn compute(
        installed: Option<&InstalledSnapshot>,
        suggested_version_code: Option<i64>,
        prefs: &UserPrefs,
    ) -> Self {
        let installed_version_code = installed.map(|i| i.version_code).unwrap_or(0);
        let suggested_version_code = suggested_version_code.unwrap_or(0);

        let has_updates =
            installed_version_code > 0 && installed_version_code < suggested_version_code;
        let can_and_want_to_update = has_updates
            && !prefs.ignore_all_updates
            && suggested_version_code > prefs.ignore_version_code_up_to;

        Self {
            installed_version_code,
            suggested_version_code,
            has_updates,
            can_and_want_to_update,
        }
    }
}
