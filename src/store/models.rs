// src/store/models.rs

//! Data models for the installation store
//!
//! The store index is a single JSON document mapping package names to
//! their install records.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Index format version written by this build
pub const INDEX_VERSION: u32 = 1;

/// An installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub name: String,
    pub version: String,
    /// Installation prefix of the package
    pub prefix: PathBuf,
    /// Installed on request rather than as a dependency
    pub explicit: bool,
    /// RFC 3339 timestamp
    pub installed_at: String,
}

impl InstallRecord {
    /// Create a new explicit install record stamped with the current time
    pub fn new(name: String, version: String, prefix: PathBuf) -> Self {
        Self {
            name,
            version,
            prefix,
            explicit: true,
            installed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Contents of the store index file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub version: u32,
    pub installs: BTreeMap<String, InstallRecord>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            installs: BTreeMap::new(),
        }
    }
}

impl Index {
    /// Parse an index document, rejecting versions newer than this build
    pub fn from_json(data: &str) -> Result<Self> {
        let index: Index = serde_json::from_str(data)?;
        if index.version > INDEX_VERSION {
            return Err(Error::IndexVersion {
                found: index.version,
                supported: INDEX_VERSION,
            });
        }
        Ok(index)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Records whose name contains `pattern`, in name order
    pub fn matching(&self, pattern: &str) -> Vec<InstallRecord> {
        self.installs
            .values()
            .filter(|record| record.name.contains(pattern))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> InstallRecord {
        InstallRecord::new(
            name.to_string(),
            "1.0".to_string(),
            PathBuf::from(format!("/opt/stowage/{}", name)),
        )
    }

    #[test]
    fn test_install_record_timestamp() {
        let record = record("zlib");
        assert!(record.explicit);
        assert!(chrono::DateTime::parse_from_rfc3339(&record.installed_at).is_ok());
    }

    #[test]
    fn test_index_json_layout() {
        let mut index = Index::default();
        index.installs.insert("zlib".to_string(), record("zlib"));

        let json = index.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], INDEX_VERSION);
        assert_eq!(value["installs"]["zlib"]["version"], "1.0");
        assert_eq!(value["installs"]["zlib"]["prefix"], "/opt/stowage/zlib");

        assert_eq!(Index::from_json(&json).unwrap(), index);
    }

    #[test]
    fn test_index_rejects_newer_version() {
        let json = format!("{{\"version\": {}, \"installs\": {{}}}}", INDEX_VERSION + 1);
        let err = Index::from_json(&json).unwrap_err();
        assert!(matches!(err, Error::IndexVersion { found, .. } if found == INDEX_VERSION + 1));
    }

    #[test]
    fn test_index_rejects_garbage() {
        assert!(matches!(Index::from_json("{not json"), Err(Error::Json(_))));
    }

    #[test]
    fn test_matching() {
        let mut index = Index::default();
        for name in ["zlib", "zlib-ng", "openssl"] {
            index.installs.insert(name.to_string(), record(name));
        }

        let names: Vec<_> = index.matching("zlib").into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["zlib", "zlib-ng"]);
        assert_eq!(index.matching("").len(), 3);
        assert!(index.matching("python").is_empty());
    }
}
