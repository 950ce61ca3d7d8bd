// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Content-addressed computation cache.
//!
//! A cache directory holds result files plus a `tinc_cache.json`
//! catalog. Each catalog entry pairs the files it produced with the
//! [`SourceInfo`] that produced them; a lookup matches the whole
//! source description, so any change to arguments, dependencies or
//! the command line misses.

use crate::error::TincError;
use crate::protocol::wire::ParameterValueWire;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Catalog filename inside the cache directory.
pub const CACHE_CATALOG: &str = "tinc_cache.json";

/// Catalog schema version. A major mismatch refuses to load.
pub const CACHE_VERSION_MAJOR: u32 = 1;
pub const CACHE_VERSION_MINOR: u32 = 0;

/// Distinguishes what kind of producer wrote an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceType {
    ProcessFunction,
    ExternalProcessor,
}

/// One named argument or dependency value in a source description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceArgument {
    pub id: String,
    pub value: ParameterValueWire,
}

/// A file the computation read, with enough metadata to detect change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDependency {
    pub file: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl FileDependency {
    /// Capture the current metadata of `path`.
    pub fn capture(path: &Path) -> Result<Self, TincError> {
        let meta = fs::metadata(path)?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        Ok(Self {
            file: path.to_string_lossy().into_owned(),
            modified,
            size: meta.len(),
        })
    }
}

/// Everything that determines a computation's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Id of the owning object (parameter space or processor).
    pub tinc_id: String,
    /// Function name or expanded command line.
    pub command_line_arguments: String,
    pub working_path: String,
    pub arguments: Vec<SourceArgument>,
    pub dependencies: Vec<SourceArgument>,
    pub file_dependencies: Vec<FileDependency>,
}

/// Who produced an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_name: String,
    /// Hash of the producing hostname; the raw name stays out of
    /// shared catalogs.
    pub user_hash: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    /// Whether the producer was acting as the server peer.
    #[serde(default)]
    pub server: bool,
}

impl UserInfo {
    pub fn capture() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        hostname.hash(&mut hasher);
        Self {
            user_name: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
            user_hash: format!("{:016x}", hasher.finish()),
            ip: String::new(),
            port: 0,
            server: false,
        }
    }
}

/// One cached computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    /// Filenames relative to the cache directory.
    pub files: Vec<String>,
    pub user_info: UserInfo,
    pub source_info: SourceInfo,
    #[serde(default)]
    pub cache_hits: u64,
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheCatalog {
    tinc_meta_version_major: u32,
    tinc_meta_version_minor: u32,
    entries: Vec<CacheEntry>,
}

impl Default for CacheCatalog {
    fn default() -> Self {
        Self {
            tinc_meta_version_major: CACHE_VERSION_MAJOR,
            tinc_meta_version_minor: CACHE_VERSION_MINOR,
            entries: Vec::new(),
        }
    }
}

/// Owns one cache directory and its catalog.
pub struct CacheManager {
    dir: PathBuf,
    catalog: Mutex<CacheCatalog>,
}

impl CacheManager {
    /// Open (or create) the cache at `dir`, loading an existing
    /// catalog. A catalog written by a newer major schema refuses to
    /// load rather than risk silently corrupting it.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TincError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let catalog_path = dir.join(CACHE_CATALOG);
        let catalog = if catalog_path.exists() {
            let bytes = fs::read(&catalog_path)?;
            let parsed: CacheCatalog = serde_json::from_slice(&bytes)
                .map_err(|e| TincError::CacheIo(format!("bad catalog: {}", e)))?;
            if parsed.tinc_meta_version_major != CACHE_VERSION_MAJOR {
                return Err(TincError::CacheIo(format!(
                    "catalog schema {}.{} not supported (expected {}.x)",
                    parsed.tinc_meta_version_major,
                    parsed.tinc_meta_version_minor,
                    CACHE_VERSION_MAJOR
                )));
            }
            if parsed.tinc_meta_version_minor != CACHE_VERSION_MINOR {
                debug!(
                    "catalog minor version {} differs from {}",
                    parsed.tinc_meta_version_minor, CACHE_VERSION_MINOR
                );
            }
            parsed
        } else {
            CacheCatalog::default()
        };

        Ok(Self {
            dir,
            catalog: Mutex::new(catalog),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn entry_count(&self) -> usize {
        self.catalog.lock().entries.len()
    }

    /// Snapshot of the catalog entries.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.catalog.lock().entries.clone()
    }

    /// Find the files of the newest non-stale entry whose source
    /// description matches `source`. A hit bumps the entry's counter.
    pub fn find_cache(&self, source: &SourceInfo) -> Option<Vec<String>> {
        let mut catalog = self.catalog.lock();
        let hit = catalog
            .entries
            .iter_mut()
            .rev()
            .find(|e| !e.stale && source_matches(&e.source_info, source))?;
        hit.cache_hits += 1;
        Some(hit.files.clone())
    }

    /// Record a finished computation and persist the catalog.
    pub fn append_entry(&self, entry: CacheEntry) -> Result<(), TincError> {
        let mut catalog = self.catalog.lock();
        catalog.entries.push(entry);
        self.write_catalog(&catalog)
    }

    /// Mark every entry that produced `file` as stale.
    pub fn invalidate_file(&self, file: &str) -> Result<(), TincError> {
        let mut catalog = self.catalog.lock();
        let mut touched = false;
        for entry in &mut catalog.entries {
            if entry.files.iter().any(|f| f == file) {
                entry.stale = true;
                touched = true;
            }
        }
        if touched {
            self.write_catalog(&catalog)?;
        }
        Ok(())
    }

    /// Remove every cached file and reset the catalog.
    pub fn clear(&self) -> Result<(), TincError> {
        let mut catalog = self.catalog.lock();
        for entry in &catalog.entries {
            for file in &entry.files {
                let path = self.dir.join(file);
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to remove cached file {:?}: {}", path, e);
                    }
                }
            }
        }
        catalog.entries.clear();
        self.write_catalog(&catalog)
    }

    /// Write result bytes into the cache directory.
    pub fn write_file(&self, name: &str, bytes: &[u8]) -> Result<(), TincError> {
        fs::write(self.dir.join(name), bytes)?;
        Ok(())
    }

    /// Read a cached result file.
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>, TincError> {
        Ok(fs::read(self.dir.join(name))?)
    }

    // The previous catalog is kept as .bak, then the new one replaces
    // it atomically through a temp file.
    fn write_catalog(&self, catalog: &CacheCatalog) -> Result<(), TincError> {
        let path = self.dir.join(CACHE_CATALOG);
        let tmp = self.dir.join(format!("{}.tmp", CACHE_CATALOG));
        let json = serde_json::to_vec_pretty(catalog)?;
        fs::write(&tmp, json)?;
        if path.exists() {
            let bak = self.dir.join(format!("{}.bak", CACHE_CATALOG));
            fs::copy(&path, &bak)?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Source-description equality. Argument and dependency lists compare
/// as multisets: every element on one side pairs with a distinct
/// element on the other. File dependencies are advisory provenance
/// and do not take part in matching; a difference is logged.
fn source_matches(a: &SourceInfo, b: &SourceInfo) -> bool {
    let matched = a.source_type == b.source_type
        && a.tinc_id == b.tinc_id
        && a.command_line_arguments == b.command_line_arguments
        && multiset_eq(&a.arguments, &b.arguments)
        && multiset_eq(&a.dependencies, &b.dependencies);
    if matched && !multiset_eq(&a.file_dependencies, &b.file_dependencies) {
        debug!(
            tinc_id = %a.tinc_id,
            "file dependencies changed since the entry was cached"
        );
    }
    matched
}

fn multiset_eq<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    for item in a {
        let Some(i) = b
            .iter()
            .enumerate()
            .position(|(i, other)| !used[i] && item == other)
        else {
            return false;
        };
        used[i] = true;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::value::ParamValue;

    fn arg(id: &str, v: f32) -> SourceArgument {
        SourceArgument {
            id: id.into(),
            value: (&ParamValue::Float(v)).into(),
        }
    }

    fn source(id: &str, args: Vec<SourceArgument>) -> SourceInfo {
        SourceInfo {
            source_type: SourceType::ProcessFunction,
            tinc_id: id.into(),
            command_line_arguments: "compute".into(),
            working_path: String::new(),
            arguments: args,
            dependencies: Vec::new(),
            file_dependencies: Vec::new(),
        }
    }

    fn entry(src: SourceInfo, files: Vec<String>) -> CacheEntry {
        CacheEntry {
            timestamp_start: Utc::now(),
            timestamp_end: Utc::now(),
            files,
            user_info: UserInfo::capture(),
            source_info: src,
            cache_hits: 0,
            stale: false,
        }
    }

    #[test]
    fn test_miss_on_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path()).unwrap();
        assert!(cache.find_cache(&source("ps", vec![arg("x", 1.0)])).is_none());
    }

    #[test]
    fn test_hit_after_append() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path()).unwrap();

        cache.write_file("out.json", b"42").unwrap();
        cache
            .append_entry(entry(
                source("ps", vec![arg("x", 1.0)]),
                vec!["out.json".into()],
            ))
            .unwrap();

        let files = cache.find_cache(&source("ps", vec![arg("x", 1.0)])).unwrap();
        assert_eq!(files, vec!["out.json".to_string()]);
        assert_eq!(cache.read_file("out.json").unwrap(), b"42");

        // A different argument value misses.
        assert!(cache.find_cache(&source("ps", vec![arg("x", 2.0)])).is_none());
        // A different owner misses.
        assert!(cache.find_cache(&source("other", vec![arg("x", 1.0)])).is_none());
    }

    #[test]
    fn test_argument_order_does_not_matter() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path()).unwrap();

        cache
            .append_entry(entry(
                source("ps", vec![arg("a", 1.0), arg("b", 2.0)]),
                vec!["r.json".into()],
            ))
            .unwrap();

        assert!(cache
            .find_cache(&source("ps", vec![arg("b", 2.0), arg("a", 1.0)]))
            .is_some());
    }

    #[test]
    fn test_duplicate_arguments_match_as_multiset() {
        // [a=1, a=1] must not match [a=1, a=2].
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path()).unwrap();

        cache
            .append_entry(entry(
                source("ps", vec![arg("a", 1.0), arg("a", 1.0)]),
                vec!["r.json".into()],
            ))
            .unwrap();

        assert!(cache
            .find_cache(&source("ps", vec![arg("a", 1.0), arg("a", 2.0)]))
            .is_none());
        assert!(cache
            .find_cache(&source("ps", vec![arg("a", 1.0), arg("a", 1.0)]))
            .is_some());
    }

    #[test]
    fn test_catalog_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheManager::new(dir.path()).unwrap();
            cache
                .append_entry(entry(source("ps", vec![arg("x", 3.0)]), vec!["f.json".into()]))
                .unwrap();
        }

        let cache = CacheManager::new(dir.path()).unwrap();
        assert_eq!(cache.entry_count(), 1);
        assert!(cache.find_cache(&source("ps", vec![arg("x", 3.0)])).is_some());
    }

    #[test]
    fn test_rewrite_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path()).unwrap();
        cache
            .append_entry(entry(source("ps", vec![]), vec!["a.json".into()]))
            .unwrap();
        cache
            .append_entry(entry(source("ps", vec![arg("x", 1.0)]), vec!["b.json".into()]))
            .unwrap();

        assert!(dir.path().join(CACHE_CATALOG).exists());
        assert!(dir.path().join(format!("{}.bak", CACHE_CATALOG)).exists());
    }

    #[test]
    fn test_major_version_gate() {
        let dir = tempfile::tempdir().unwrap();
        let bad = serde_json::json!({
            "tincMetaVersionMajor": CACHE_VERSION_MAJOR + 1,
            "tincMetaVersionMinor": 0,
            "entries": []
        });
        std::fs::write(
            dir.path().join(CACHE_CATALOG),
            serde_json::to_vec(&bad).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            CacheManager::new(dir.path()),
            Err(TincError::CacheIo(_))
        ));
    }

    #[test]
    fn test_clear_removes_files_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path()).unwrap();
        cache.write_file("gone.json", b"x").unwrap();
        cache
            .append_entry(entry(source("ps", vec![]), vec!["gone.json".into()]))
            .unwrap();

        cache.clear().unwrap();
        assert_eq!(cache.entry_count(), 0);
        assert!(!dir.path().join("gone.json").exists());
        assert!(cache.find_cache(&source("ps", vec![])).is_none());
    }

    #[test]
    fn test_changed_file_dependencies_still_match() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path()).unwrap();

        let mut recorded = source("ps", vec![arg("x", 1.0)]);
        recorded.file_dependencies = vec![FileDependency {
            file: "/work/old".into(),
            modified: Utc::now(),
            size: 10,
        }];
        cache
            .append_entry(entry(recorded, vec!["out.json".into()]))
            .unwrap();

        // Same arguments from a different working directory still hit.
        let mut lookup = source("ps", vec![arg("x", 1.0)]);
        lookup.file_dependencies = vec![FileDependency {
            file: "/work/new".into(),
            modified: Utc::now(),
            size: 99,
        }];
        assert_eq!(
            cache.find_cache(&lookup),
            Some(vec!["out.json".to_string()])
        );
    }

    #[test]
    fn test_user_info_shape() {
        let info = UserInfo::capture();
        assert_eq!(info.user_hash.len(), 16);
        assert!(!info.server);

        let json = serde_json::to_value(&info).unwrap();
        for key in ["userName", "userHash", "ip", "port", "server"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        // Entries written before ip/port/server were recorded still load.
        let old: UserInfo =
            serde_json::from_value(serde_json::json!({
                "userName": "kim",
                "userHash": "00000000deadbeef"
            }))
            .unwrap();
        assert_eq!(old.port, 0);
    }

    #[test]
    fn test_stale_entries_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path()).unwrap();
        cache
            .append_entry(entry(source("ps", vec![]), vec!["old.json".into()]))
            .unwrap();
        cache.invalidate_file("old.json").unwrap();
        assert!(cache.find_cache(&source("ps", vec![])).is_none());
    }
}
