//! Durable cache backend: one packed entry per line, oldest insertion first.
//! All operations are best-effort; failures are logged and swallowed so the
//! cache fast path never sees them.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::warn;

use crate::cache::{Backend, Entry};

pub struct FileBackend {
    path: PathBuf,
    lines: Mutex<Vec<(u32, String)>>,
}

impl FileBackend {
    /// Opens the store at `path`, creating it lazily on the first write.
    /// Malformed lines are dropped with a warning and loading continues.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut lines = Vec::new();
        match fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Entry::unpack(line) {
                        Ok(entry) => lines.push((entry.key, line.to_string())),
                        Err(err) => {
                            warn!(
                                event = "persist_entry_skipped",
                                path = %path.display(),
                                error = %err,
                                "skipping malformed cache entry"
                            );
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("read cache store {}", path.display()))
            }
        }
        Ok(Self {
            path,
            lines: Mutex::new(lines),
        })
    }

    fn lines(&self) -> MutexGuard<'_, Vec<(u32, String)>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, lines: &[(u32, String)]) {
        let mut contents = String::new();
        for (_, line) in lines {
            contents.push_str(line);
            contents.push('\n');
        }
        if let Err(err) = fs::write(&self.path, contents) {
            warn!(
                event = "persist_write_failed",
                path = %self.path.display(),
                error = %err,
                "cache store write failed"
            );
        }
    }
}

impl Backend for FileBackend {
    fn set(&self, key: u32, entry: &Entry) {
        let line = match entry.pack() {
            Ok(line) => line,
            Err(err) => {
                warn!(event = "persist_pack_failed", key, error = %err, "cannot pack cache entry");
                return;
            }
        };
        let mut lines = self.lines();
        lines.retain(|(k, _)| *k != key);
        lines.push((key, line));
        self.flush(&lines);
    }

    fn evict(&self, key: u32) {
        let mut lines = self.lines();
        let before = lines.len();
        lines.retain(|(k, _)| *k != key);
        if lines.len() != before {
            self.flush(&lines);
        }
    }

    fn read(&self) -> Vec<Entry> {
        self.lines()
            .iter()
            .filter_map(|(_, line)| Entry::unpack(line).ok())
            .collect()
    }

    fn reset(&self) {
        let mut lines = self.lines();
        lines.clear();
        self.flush(&lines);
    }
}
