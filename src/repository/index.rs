// src/repository/index.rs

//! In-memory shape of a parsed, verified repository index
//!
//! Fetching, signature verification and wire-format parsing happen before
//! anything here is constructed. A sync consumes a stream of [`IndexEntry`]
//! values; the CLI reads the same shape from a JSON file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// A complete index for one repository
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoIndex {
    /// Opaque etag or timestamp identifying this index revision
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub entries: Vec<IndexEntry>,
}

impl RepoIndex {
    /// Read an index from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let index = serde_json::from_str(&contents)?;
        Ok(index)
    }
}

/// One package as published by a repository, with all of its versions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexEntry {
    pub package_name: String,
    pub name: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub license: Option<String>,
    pub web_site: Option<String>,
    pub source_code: Option<String>,
    pub added: Option<String>,
    pub last_updated: Option<String>,
    pub categories: Vec<String>,
    pub preferred_signer: Option<String>,
    pub upstream_version_code: Option<i64>,
    pub versions: Vec<IndexVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexVersion {
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
}

impl Default for IndexVersion {
    fn default() -> Self {
        Self {
            version_code: 0,
            version_name: None,
            file_name: String::new(),
            hash: String::new(),
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
        }
    }
}

impl IndexEntry {
    /// Reject entries the catalog cannot store consistently
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidRecord {
            package: self.package_name.clone(),
            reason,
        };

        if self.package_name.trim().is_empty() {
            return Err(invalid("empty package name".to_string()));
        }
        if self
            .package_name
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_'))
        {
            return Err(invalid("package name contains invalid characters".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("empty display name".to_string()));
        }

        let mut codes = HashSet::new();
        for version in &self.versions {
            if version.version_code <= 0 {
                return Err(invalid(format!(
                    "version code {} is not positive",
                    version.version_code
                )));
            }
            if !codes.insert(version.version_code) {
                return Err(invalid(format!(
                    "duplicate version code {}",
                    version.version_code
                )));
            }
            if version.file_name.is_empty() || version.hash.is_empty() {
                return Err(invalid(format!(
                    "version {} is missing its file name or hash",
                    version.version_code
                )));
            }
        }

        Ok(())
    }
}
