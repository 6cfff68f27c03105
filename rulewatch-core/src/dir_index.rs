//! Persistent per-tenant index of watched data directories.
//!
//! The index maps each directory below the tenant data root (relative path,
//! `.` for the root itself) to the mtime it had when last seen. It tells the
//! supervisor which directories to watch after a restart without rescanning,
//! and it lets the event core discover children that appeared inside a newly
//! created directory before a watch could be placed on it.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::codec::{load_record, save_record};
use crate::error::Result;
use crate::event::{ChangeKind, FsEvent};

const ROOT_KEY: &str = ".";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirState {
    pub mtime: i64,
}

#[derive(Debug)]
pub struct DirIndex {
    cache_file: Option<PathBuf>,
    data_root: PathBuf,
    entries: BTreeMap<String, DirState>,
}

impl DirIndex {
    /// Load the index from `cache_file`, or build it by walking `data_root`
    /// when no cache file exists yet.
    ///
    /// A cache file that exists but cannot be decoded is an error.
    pub fn load(cache_file: PathBuf, data_root: PathBuf) -> Result<Self> {
        if cache_file.exists() {
            let entries: BTreeMap<String, DirState> = load_record(&cache_file)?;
            info!(
                target: "rulewatch::supervisor",
                path = %cache_file.display(),
                directories = entries.len(),
                "loaded directory index"
            );
            return Ok(Self {
                cache_file: Some(cache_file),
                data_root,
                entries,
            });
        }

        let mut index = Self {
            cache_file: Some(cache_file),
            data_root,
            entries: BTreeMap::new(),
        };
        let root = index.data_root.clone();
        let scanned = index.scan(&root);
        info!(
            target: "rulewatch::supervisor",
            root = %root.display(),
            directories = scanned,
            "built directory index by scanning"
        );
        Ok(index)
    }

    /// An index that starts empty and is never persisted.
    pub fn ephemeral(data_root: PathBuf) -> Self {
        Self {
            cache_file: None,
            data_root,
            entries: BTreeMap::new(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let Some(cache_file) = &self.cache_file else {
            return Ok(());
        };
        save_record(&self.entries, cache_file)?;
        debug!(
            target: "rulewatch::supervisor",
            path = %cache_file.display(),
            directories = self.entries.len(),
            "saved directory index"
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.key_of(dir)
            .is_some_and(|key| self.entries.contains_key(&key))
    }

    pub fn mtime_of(&self, dir: &Path) -> Option<i64> {
        self.key_of(dir)
            .and_then(|key| self.entries.get(&key))
            .map(|state| state.mtime)
    }

    /// Absolute paths of every indexed directory below `prefix`.
    pub fn directories_under(&self, prefix: &Path) -> Vec<PathBuf> {
        self.entries
            .keys()
            .map(|key| self.absolute(key))
            .filter(|path| path.starts_with(prefix))
            .collect()
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        self.entries.keys().map(|key| self.absolute(key)).collect()
    }

    /// Walk `dir` and index every directory found. Returns how many were
    /// indexed.
    pub fn scan(&mut self, dir: &Path) -> usize {
        let mut count = 0;
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target: "rulewatch::supervisor", error = %err, "skipping unreadable entry while indexing");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if let Some(key) = self.key_of(entry.path()) {
                self.entries.insert(key, DirState { mtime: meta.mtime() });
                count += 1;
            }
        }
        count
    }

    /// Index a freshly created directory and return `created` events for
    /// children that appeared before the directory could be watched.
    ///
    /// A child is reported when it is a directory missing from the index, or
    /// when its ctime is newer than the mtime previously recorded for `dir`.
    /// Without a previous record every child is reported.
    pub fn refresh_on_create(&mut self, dir: &Path) -> Vec<FsEvent> {
        let Some(key) = self.key_of(dir) else {
            return Vec::new();
        };
        let meta = match fs::metadata(dir) {
            Ok(meta) => meta,
            Err(err) => {
                debug!(target: "rulewatch::events", path = %dir.display(), error = %err, "created directory vanished before indexing");
                return Vec::new();
            }
        };

        let previous = self.entries.insert(key, DirState { mtime: meta.mtime() });
        let previous_mtime = previous.map(|state| state.mtime);

        let children = match fs::read_dir(dir) {
            Ok(children) => children,
            Err(err) => {
                warn!(target: "rulewatch::events", path = %dir.display(), error = %err, "failed to list created directory");
                return Vec::new();
            }
        };

        let mut synthesized = Vec::new();
        for child in children.flatten() {
            let path = child.path();
            let Ok(child_meta) = fs::metadata(&path) else {
                continue;
            };
            let is_dir = child_meta.is_dir();
            let unseen_dir = is_dir && !self.contains(&path);
            let newer = previous_mtime.is_none_or(|mtime| child_meta.ctime() > mtime);
            if unseen_dir || newer {
                synthesized.push(FsEvent::new(path, ChangeKind::Created, is_dir));
            }
        }
        synthesized.sort_by(|a, b| a.path.cmp(&b.path));
        synthesized
    }

    /// Drop `dir` and everything indexed below it.
    pub fn remove_tree(&mut self, dir: &Path) -> usize {
        let before = self.entries.len();
        let data_root = self.data_root.clone();
        self.entries.retain(|key, _| {
            let path = if key == ROOT_KEY {
                data_root.clone()
            } else {
                data_root.join(key)
            };
            !path.starts_with(dir)
        });
        before - self.entries.len()
    }

    fn key_of(&self, dir: &Path) -> Option<String> {
        let rel = dir.strip_prefix(&self.data_root).ok()?;
        if rel.as_os_str().is_empty() {
            Some(ROOT_KEY.to_string())
        } else {
            Some(rel.to_string_lossy().into_owned())
        }
    }

    fn absolute(&self, key: &str) -> PathBuf {
        if key == ROOT_KEY {
            self.data_root.clone()
        } else {
            self.data_root.join(key)
        }
    }
}
