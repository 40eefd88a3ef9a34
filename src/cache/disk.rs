//! Persistent tier: one backing file per entry plus a JSON manifest

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::CacheError;
use super::value::{CacheValue, PayloadKind};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ENTRY_EXTENSION: &str = "cache";

/// Self-describing manifest record for one persisted entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Backing file name inside the cache directory
    pub file: String,
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    /// Size of the backing file in bytes
    pub size: u64,
    /// Seconds since the Unix epoch when the entry was written
    pub timestamp: f64,
}

/// Filesystem-safe backing file name derived from the key
#[must_use]
pub fn entry_file_name(key: &str) -> String {
    format!("{:x}.{ENTRY_EXTENSION}", md5::compute(key.as_bytes()))
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct DiskTier {
    dir: PathBuf,
    manifest: HashMap<String, ManifestEntry>,
}

impl DiskTier {
    /// Open (or create) a cache directory and load its manifest.
    /// A missing manifest is an empty cache; an unreadable one is an error.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| CacheError::Manifest(format!("cannot create {}: {e}", dir.display())))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = match fs::read(&manifest_path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                CacheError::Manifest(format!("cannot parse {}: {e}", manifest_path.display()))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(CacheError::Manifest(format!(
                    "cannot read {}: {e}",
                    manifest_path.display()
                )));
            }
        };

        debug!(
            "Opened disk cache at {} with {} entries",
            dir.display(),
            manifest.len()
        );
        Ok(Self { dir, manifest })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&ManifestEntry> {
        self.manifest.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.manifest.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    /// Read an entry. `Ok(None)` when the key is not persisted; `Err` when the
    /// manifest lists it but the backing file is missing or undecodable.
    pub fn read(&self, key: &str) -> Result<Option<CacheValue>, CacheError> {
        let Some(entry) = self.manifest.get(key) else {
            return Ok(None);
        };
        let data = fs::read(self.dir.join(&entry.file))?;
        CacheValue::decode(entry.kind, &data).map(Some)
    }

    /// Persist a value and record it in the manifest
    pub fn write(&mut self, key: &str, value: &CacheValue) -> Result<(), CacheError> {
        let (kind, data) = value.encode()?;
        let file = entry_file_name(key);
        fs::write(self.dir.join(&file), &data)?;

        self.manifest.insert(
            key.to_string(),
            ManifestEntry {
                file,
                kind,
                size: data.len() as u64,
                timestamp: now_secs(),
            },
        );
        self.save_manifest()
    }

    /// Remove an entry and its backing file. Returns whether it was listed.
    pub fn remove(&mut self, key: &str) -> Result<bool, CacheError> {
        let Some(entry) = self.manifest.remove(key) else {
            return Ok(false);
        };
        self.delete_file(&entry.file);
        self.save_manifest()?;
        Ok(true)
    }

    /// Remove entries whose stored timestamp is older than `max_age`
    pub fn expire(&mut self, max_age: Duration) -> Result<Vec<String>, CacheError> {
        let cutoff = now_secs() - max_age.as_secs_f64();
        let stale: Vec<String> = self
            .manifest
            .iter()
            .filter(|(_, entry)| entry.timestamp < cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        if stale.is_empty() {
            return Ok(stale);
        }

        for key in &stale {
            if let Some(entry) = self.manifest.remove(key) {
                self.delete_file(&entry.file);
            }
        }
        self.save_manifest()?;
        Ok(stale)
    }

    /// Delete every backing file, including ones the manifest lost track of
    pub fn clear(&mut self) -> Result<(), CacheError> {
        for (_, entry) in self.manifest.drain() {
            let path = self.dir.join(&entry.file);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to delete cache file {}: {e}", path.display());
                }
            }
        }

        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                    let _ = fs::remove_file(&path);
                }
            }
        }

        self.save_manifest()
    }

    fn delete_file(&self, file: &str) {
        let path = self.dir.join(file);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete cache file {}: {e}", path.display()),
        }
    }

    fn save_manifest(&self) -> Result<(), CacheError> {
        let write = || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&self.dir)?;
            serde_json::to_writer(&mut tmp, &self.manifest)?;
            tmp.flush()?;
            tmp.persist(self.dir.join(MANIFEST_FILE))
                .map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| CacheError::Manifest(format!("cannot write manifest: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_stable_and_safe() {
        let name = entry_file_name("doc.pdf#3@1.5/../../etc");
        assert_eq!(name, entry_file_name("doc.pdf#3@1.5/../../etc"));
        assert!(name.ends_with(".cache"));
        assert!(!name.contains('/'));
        assert_ne!(name, entry_file_name("doc.pdf#4@1.5"));
    }

    #[test]
    fn manifest_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut tier = DiskTier::open(dir.path()).unwrap();
            tier.write("greeting", &CacheValue::from("hello")).unwrap();
        }

        let tier = DiskTier::open(dir.path()).unwrap();
        let entry = tier.entry("greeting").unwrap();
        assert_eq!(entry.kind, PayloadKind::Blob);
        assert_eq!(entry.file, entry_file_name("greeting"));
        assert_eq!(
            tier.read("greeting").unwrap(),
            Some(CacheValue::from("hello"))
        );
    }

    #[test]
    fn manifest_uses_flat_key_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::open(dir.path()).unwrap();
        tier.write("k", &CacheValue::from(vec![1u8])).unwrap();

        let raw = fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["k"]["type"], "blob");
        assert!(json["k"]["timestamp"].is_f64());
        assert!(json["k"]["size"].is_u64());
    }

    #[test]
    fn missing_backing_file_is_an_error_for_that_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::open(dir.path()).unwrap();
        tier.write("k", &CacheValue::from("v")).unwrap();
        fs::remove_file(dir.path().join(entry_file_name("k"))).unwrap();

        assert!(tier.read("k").is_err());
        assert!(tier.remove("k").unwrap());
        assert_eq!(tier.read("k").unwrap(), None);
    }

    #[test]
    fn corrupt_manifest_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{not json").unwrap();
        assert!(matches!(
            DiskTier::open(dir.path()),
            Err(CacheError::Manifest(_))
        ));
    }

    #[test]
    fn expire_uses_stored_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::open(dir.path()).unwrap();
        tier.write("old", &CacheValue::from("a")).unwrap();
        tier.write("new", &CacheValue::from("b")).unwrap();
        if let Some(entry) = tier.manifest.get_mut("old") {
            entry.timestamp -= 3600.0;
        }

        let removed = tier.expire(Duration::from_secs(60)).unwrap();

        assert_eq!(removed, vec!["old".to_string()]);
        assert!(!dir.path().join(entry_file_name("old")).exists());
        assert!(tier.contains("new"));
    }

    #[test]
    fn clear_removes_all_backing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::open(dir.path()).unwrap();
        tier.write("a", &CacheValue::from("1")).unwrap();
        fs::write(dir.path().join("orphan.cache"), b"x").unwrap();

        tier.clear().unwrap();
        tier.clear().unwrap();

        assert!(tier.is_empty());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "cache"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
