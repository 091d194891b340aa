//! Filetest result caching
//!
//! A passing filetest is recorded together with a fingerprint of its source and
//! of every package it imports. The next run of the same file is skipped when
//! the fingerprint still matches.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, TestError};
use crate::source::{FileHeader, ImportDecl, ImportVisitor};
use crate::vm::PackageStore;

/// Content hashes of an imported package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Hash of the whole package; empty when unknown
    pub content_hash: String,
    pub path: String,
    /// Hash of every file, by file name
    pub files: BTreeMap<String, String>,
}

/// Fingerprint of a filetest and its dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCacheKey {
    pub file_hash: String,
    pub dependencies: BTreeMap<String, PackageInfo>,
}

/// A cached filetest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCache {
    pub key: TestCacheKey,
    pub output: String,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Hex-encoded sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Collects one [`PackageInfo`] per distinct import path, following the
/// imports of every dependency so that the key covers the whole closure.
struct DependencyCollector<'a> {
    store: &'a dyn PackageStore,
    dependencies: BTreeMap<String, PackageInfo>,
}

impl ImportVisitor for DependencyCollector<'_> {
    fn visit_import(&mut self, decl: &ImportDecl) {
        // Also the visited set: cycles stop here.
        if self.dependencies.contains_key(&decl.path) {
            return;
        }
        let info = self.store.package_info(&decl.path).unwrap_or_else(|| PackageInfo {
            path: decl.path.clone(),
            ..PackageInfo::default()
        });
        let files: Vec<String> = info.files.keys().cloned().collect();
        self.dependencies.insert(decl.path.clone(), info);

        for file in files {
            let Some(source) = self.store.read_file(&decl.path, &file) else {
                continue;
            };
            match FileHeader::parse(&file, &source) {
                Ok(header) => header.walk_imports(self),
                Err(err) => debug!(pkg = %decl.path, file = %file, error = %err, "skipping dependency file"),
            }
        }
    }
}

/// Fingerprints `content` and the packages it imports.
pub fn compute_cache_key(
    filename: &str,
    content: &[u8],
    store: &dyn PackageStore,
) -> Result<TestCacheKey> {
    let text = String::from_utf8_lossy(content);
    let header = FileHeader::parse(filename, &text)?;

    let mut collector = DependencyCollector {
        store,
        dependencies: BTreeMap::new(),
    };
    header.walk_imports(&mut collector);

    Ok(TestCacheKey {
        file_hash: sha256_hex(content),
        dependencies: collector.dependencies,
    })
}

/// Reports whether a cache recorded under `cached` still holds for `current`.
///
/// A dependency without a content hash never validates.
pub fn is_valid_cache(cached: &TestCacheKey, current: &TestCacheKey) -> bool {
    if cached.file_hash != current.file_hash {
        return false;
    }
    if cached.dependencies.len() != current.dependencies.len() {
        return false;
    }
    cached.dependencies.iter().all(|(path, old)| {
        let Some(new) = current.dependencies.get(path) else {
            return false;
        };
        !old.content_hash.is_empty()
            && old.content_hash == new.content_hash
            && old.files == new.files
    })
}

/// On-disk store of [`TestCache`] entries, one JSON document per test file.
#[derive(Debug, Clone)]
pub struct ResultCache {
    cache_dir: PathBuf,
}

impl ResultCache {
    pub fn new(cache_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cache_dir).map_err(|e| TestError::io(cache_dir, e))?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the cached run of the test file at `path`, if it is still valid
    /// for `content`. A stale entry is a miss; an unreadable one is an error.
    pub fn load(
        &self,
        path: &Path,
        content: &[u8],
        store: &dyn PackageStore,
    ) -> Result<Option<TestCache>> {
        let cache_file = self.cache_file_path(path)?;
        if !cache_file.exists() {
            return Ok(None);
        }

        let data = fs::read(&cache_file).map_err(|e| TestError::io(&cache_file, e))?;
        let cached: TestCache = serde_json::from_slice(&data).map_err(|source| {
            TestError::CacheCorrupt {
                path: cache_file.clone(),
                source,
            }
        })?;

        let filename = display_name(path);
        let current = match compute_cache_key(&filename, content, store) {
            Ok(key) => key,
            Err(err) => {
                debug!(file = %filename, error = %err, "cache key unavailable");
                return Ok(None);
            }
        };
        if !is_valid_cache(&cached.key, &current) {
            debug!(file = %filename, "stale cache entry");
            return Ok(None);
        }

        debug!(file = %filename, "cache hit");
        Ok(Some(cached))
    }

    /// Records a passing run of the test file at `path`.
    pub fn save(
        &self,
        path: &Path,
        content: &[u8],
        store: &dyn PackageStore,
        output: &str,
        duration: Duration,
    ) -> Result<()> {
        let cache_file = self.cache_file_path(path)?;
        let key = compute_cache_key(&display_name(path), content, store)?;
        let entry = TestCache {
            key,
            output: output.to_string(),
            duration,
            timestamp: Utc::now(),
        };

        if let Some(parent) = cache_file.parent() {
            fs::create_dir_all(parent).map_err(|e| TestError::io(parent, e))?;
        }
        let data = serde_json::to_vec_pretty(&entry).map_err(|source| TestError::CacheCorrupt {
            path: cache_file.clone(),
            source,
        })?;
        fs::write(&cache_file, data).map_err(|e| TestError::io(&cache_file, e))?;

        debug!(file = %path.display(), cache = %cache_file.display(), "saved cache entry");
        Ok(())
    }

    /// Drops the entry of the test file at `path`.
    pub fn clear(&self, path: &Path) -> Result<()> {
        let cache_file = self.cache_file_path(path)?;
        if cache_file.exists() {
            fs::remove_file(&cache_file).map_err(|e| TestError::io(&cache_file, e))?;
        }
        Ok(())
    }

    /// Drops every entry.
    pub fn clear_all(&self) -> Result<()> {
        for file in self.entries()? {
            fs::remove_file(&file).map_err(|e| TestError::io(&file, e))?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for file in self.entries()? {
            let meta = fs::metadata(&file).map_err(|e| TestError::io(&file, e))?;
            stats.total_entries += 1;
            stats.total_size_bytes += meta.len();
        }
        Ok(stats)
    }

    fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let dir = fs::read_dir(&self.cache_dir).map_err(|e| TestError::io(&self.cache_dir, e))?;
        for entry in dir {
            let subdir = entry.map_err(|e| TestError::io(&self.cache_dir, e))?.path();
            if !subdir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&subdir).map_err(|e| TestError::io(&subdir, e))? {
                let path = entry.map_err(|e| TestError::io(&subdir, e))?.path();
                if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    /// `<cache_dir>/<2 hex chars>/<sha256 of the absolute path>.json`
    fn cache_file_path(&self, path: &Path) -> Result<PathBuf> {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| TestError::io(path, e))?
                .join(path)
        };
        let hash = sha256_hex(abs.to_string_lossy().as_bytes());
        Ok(self.cache_dir.join(&hash[..2]).join(format!("{hash}.json")))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
}

impl CacheStats {
    pub fn size_mb(&self) -> f64 {
        (self.total_size_bytes as f64) / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct HashStore {
        infos: Mutex<HashMap<String, PackageInfo>>,
        sources: Mutex<HashMap<String, String>>,
    }

    impl HashStore {
        fn set(&self, path: &str, hash: &str) {
            let info = PackageInfo {
                content_hash: hash.to_string(),
                path: path.to_string(),
                files: BTreeMap::from([("lib.x".to_string(), hash.to_string())]),
            };
            self.infos.lock().unwrap().insert(path.to_string(), info);
        }

        fn set_source(&self, path: &str, source: &str) {
            self.sources
                .lock()
                .unwrap()
                .insert(path.to_string(), source.to_string());
        }
    }

    impl PackageStore for HashStore {
        fn load_package(&self, pkg_path: &str) -> bool {
            self.infos.lock().unwrap().contains_key(pkg_path)
        }

        fn package_info(&self, pkg_path: &str) -> Option<PackageInfo> {
            self.infos.lock().unwrap().get(pkg_path).cloned()
        }

        fn read_file(&self, pkg_path: &str, file: &str) -> Option<String> {
            if file != "lib.x" {
                return None;
            }
            self.sources.lock().unwrap().get(pkg_path).cloned()
        }
    }

    const SOURCE: &str = "package main\n\nimport \"x.land/p/demo/ufmt\"\n\nfunc main() {}\n";

    fn setup() -> (TempDir, ResultCache, HashStore, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::new(&temp_dir.path().join("cache")).unwrap();
        let store = HashStore::default();
        store.set("x.land/p/demo/ufmt", "aaaa");
        let file = temp_dir.path().join("a_filetest.x");
        (temp_dir, cache, store, file)
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, cache, store, file) = setup();
        cache
            .save(&file, SOURCE.as_bytes(), &store, "hi\n", Duration::from_millis(12))
            .unwrap();

        let hit = cache.load(&file, SOURCE.as_bytes(), &store).unwrap().unwrap();
        assert_eq!(hit.output, "hi\n");
        assert_eq!(hit.duration, Duration::from_millis(12));
        assert!(hit.key.dependencies.contains_key("x.land/p/demo/ufmt"));
    }

    #[test]
    fn test_modified_content_is_a_miss() {
        let (_dir, cache, store, file) = setup();
        cache
            .save(&file, SOURCE.as_bytes(), &store, "", Duration::ZERO)
            .unwrap();

        let modified = SOURCE.replace("func main() {}", "func main() { println(1) }");
        assert!(cache.load(&file, modified.as_bytes(), &store).unwrap().is_none());
    }

    #[test]
    fn test_dependency_change_invalidates() {
        let (_dir, cache, store, file) = setup();
        cache
            .save(&file, SOURCE.as_bytes(), &store, "", Duration::ZERO)
            .unwrap();

        store.set("x.land/p/demo/ufmt", "bbbb");
        assert!(cache.load(&file, SOURCE.as_bytes(), &store).unwrap().is_none());
    }

    #[test]
    fn test_transitive_dependency_change_invalidates() {
        let (_dir, cache, store, file) = setup();
        store.set_source("x.land/p/demo/ufmt", "package ufmt\n\nimport \"x.land/p/demo/b\"\n");
        store.set("x.land/p/demo/b", "b1");
        cache
            .save(&file, SOURCE.as_bytes(), &store, "", Duration::ZERO)
            .unwrap();

        let key = compute_cache_key("a_filetest.x", SOURCE.as_bytes(), &store).unwrap();
        let deps: Vec<&str> = key.dependencies.keys().map(String::as_str).collect();
        assert_eq!(deps, vec!["x.land/p/demo/b", "x.land/p/demo/ufmt"]);
        assert!(cache.load(&file, SOURCE.as_bytes(), &store).unwrap().is_some());

        store.set("x.land/p/demo/b", "b2");
        assert!(cache.load(&file, SOURCE.as_bytes(), &store).unwrap().is_none());
    }

    #[test]
    fn test_import_cycle_terminates() {
        let (_dir, _cache, store, _file) = setup();
        store.set_source("x.land/p/demo/ufmt", "package ufmt\n\nimport \"x.land/p/demo/b\"\n");
        store.set_source("x.land/p/demo/b", "package b\n\nimport \"x.land/p/demo/ufmt\"\n");
        store.set("x.land/p/demo/b", "b1");

        let key = compute_cache_key("a_filetest.x", SOURCE.as_bytes(), &store).unwrap();
        assert_eq!(key.dependencies.len(), 2);
    }

    #[test]
    fn test_unknown_dependency_never_validates() {
        let (_dir, cache, _store, file) = setup();
        let empty = HashStore::default();
        cache
            .save(&file, SOURCE.as_bytes(), &empty, "", Duration::ZERO)
            .unwrap();
        assert!(cache.load(&file, SOURCE.as_bytes(), &empty).unwrap().is_none());
    }

    #[test]
    fn test_dependency_sets_must_match() {
        let old = TestCacheKey {
            file_hash: "f".to_string(),
            dependencies: BTreeMap::new(),
        };
        let mut new = old.clone();
        new.dependencies.insert(
            "a".to_string(),
            PackageInfo {
                content_hash: "h".to_string(),
                path: "a".to_string(),
                files: BTreeMap::new(),
            },
        );
        assert!(is_valid_cache(&old, &old));
        assert!(!is_valid_cache(&old, &new));
        assert!(!is_valid_cache(&new, &old));
        assert!(is_valid_cache(&new, &new));
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let (_dir, cache, store, file) = setup();
        cache
            .save(&file, SOURCE.as_bytes(), &store, "", Duration::ZERO)
            .unwrap();
        let cache_file = cache.cache_file_path(&file).unwrap();
        fs::write(&cache_file, b"{ not json").unwrap();

        let err = cache.load(&file, SOURCE.as_bytes(), &store).unwrap_err();
        assert!(matches!(err, TestError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_same_name_in_different_directories() {
        let (dir, cache, store, file) = setup();
        let other = dir.path().join("sub").join("a_filetest.x");
        assert_ne!(
            cache.cache_file_path(&file).unwrap(),
            cache.cache_file_path(&other).unwrap()
        );

        cache
            .save(&file, SOURCE.as_bytes(), &store, "", Duration::ZERO)
            .unwrap();
        assert!(cache.load(&other, SOURCE.as_bytes(), &store).unwrap().is_none());
    }

    #[test]
    fn test_stats_and_clear() {
        let (dir, cache, store, file) = setup();
        let other = dir.path().join("b_filetest.x");
        cache
            .save(&file, SOURCE.as_bytes(), &store, "", Duration::ZERO)
            .unwrap();
        cache
            .save(&other, SOURCE.as_bytes(), &store, "", Duration::ZERO)
            .unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_entries, 2);
        assert!(stats.total_size_bytes > 0);

        cache.clear(&file).unwrap();
        assert_eq!(cache.stats().unwrap().total_entries, 1);

        cache.clear_all().unwrap();
        assert_eq!(cache.stats().unwrap().total_entries, 0);
    }
}
