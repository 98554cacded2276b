//! Key-value engines for the legacy backend
//!
//! A small synchronous string store with a total size quota. Writes are
//! all-or-nothing: a write that would exceed the quota leaves the old value.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

type Result<T> = std::result::Result<T, EngineError>;

/// Default quota, in bytes, matching what browsers grant per origin.
pub const DEFAULT_KV_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    fn remove_item(&self, key: &str) -> Result<()>;
}

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// In-process store. Contents are lost when dropped.
#[derive(Debug)]
pub struct MemoryKeyValueStore {
    quota_bytes: u64,
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_KV_QUOTA_BYTES)
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| entry_size(k, v))
            .sum()
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let current: u64 = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        let replaced = entries.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
        let required = current - replaced + entry_size(key, value);

        if required > self.quota_bytes {
            return Err(EngineError::QuotaExceeded {
                required,
                limit: self.quota_bytes,
            });
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Store backed by a directory, one file per key.
///
/// Values are written to a temporary file and renamed into place, so a crash
/// mid-write leaves the previous value intact.
#[derive(Debug)]
pub struct FileKeyValueStore {
    dir: PathBuf,
    quota_bytes: u64,
    write_lock: Mutex<()>,
}

impl FileKeyValueStore {
    pub fn open<P: AsRef<Path>>(dir: P, quota_bytes: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            quota_bytes,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }

    fn used_bytes_excluding(&self, excluded: &Path) -> Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path == excluded || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let key_len = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
                .map_or(0, |key| key.len() as u64);
            total += key_len + entry.metadata()?.len();
        }
        Ok(total)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(key);

        let required = self.used_bytes_excluding(&path)? + entry_size(key, value);
        if required > self.quota_bytes {
            return Err(EngineError::QuotaExceeded {
                required,
                limit: self.quota_bytes,
            });
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Hex-encode a key into a portable file stem.
fn encode_key(key: &str) -> String {
    key.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_key(stem: &str) -> Option<String> {
    if stem.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..stem.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(stem.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
