//! Filesystem watcher feeding the reload manager.
//!
//! Every `notify` event outside the skipped build and VCS directories is
//! hashed with blake3; a path is forwarded to
//! [`ReloadManager::schedule_reload`] only when its bytes differ from the
//! last forwarded version.
//!
//! Debouncing is left to the [`ReloadManager`]. Removals are always
//! forwarded; a file whose bytes did not change is not.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::reload::ReloadManager;

/// Path components that hide a change from the watcher.
pub const IGNORED_DIRS: &[&str] = &["node_modules", "target", "dist", ".git"];

/// What the watcher monitors.
#[derive(Debug, Clone, Default)]
pub struct WatcherConfig {
    /// Directories watched recursively.
    pub roots: Vec<PathBuf>,
}

/// Remembers the last forwarded content of every file.
#[derive(Debug, Default)]
pub(crate) struct ContentFilter {
    hashes: HashMap<PathBuf, blake3::Hash>,
}

impl ContentFilter {
    /// Decide whether a change to `path` is worth a reload.
    ///
    /// `hash` is `Ok(None)` for directories and `Err` when the file could
    /// not be read (usually because it is already gone).
    pub(crate) fn admit(
        &mut self,
        path: &Path,
        removed: bool,
        hash: std::io::Result<Option<blake3::Hash>>,
    ) -> bool {
        if removed {
            self.hashes.remove(path);
            return true;
        }
        match hash {
            Ok(Some(hash)) => {
                if self.hashes.get(path) == Some(&hash) {
                    debug!(path = %path.display(), "content unchanged, skipping reload");
                    return false;
                }
                self.hashes.insert(path.to_path_buf(), hash);
                true
            },
            Ok(None) => true,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "changed file unreadable");
                self.hashes.remove(path);
                true
            },
        }
    }
}

/// Watches plugin directories and schedules reloads for changed files.
pub struct PluginWatcher {
    config: WatcherConfig,
    filter: ContentFilter,
    /// Dropping the `notify` handle stops monitoring.
    watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    manager: ReloadManager,
}

impl PluginWatcher {
    /// Create a watcher forwarding into `manager`. Call [`run`](Self::run)
    /// to start it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Watch`] if the filesystem watcher cannot be
    /// initialized.
    pub fn new(config: WatcherConfig, manager: ReloadManager) -> RuntimeResult<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| RuntimeError::Watch(e.to_string()))?;

        Ok(Self {
            config,
            filter: ContentFilter::default(),
            watcher,
            raw_rx,
            manager,
        })
    }

    /// Watch the configured paths until the reload manager is disposed or
    /// the `notify` channel closes.
    pub async fn run(mut self) {
        for path in &self.config.roots {
            if !path.exists() {
                warn!(path = %path.display(), "watch path does not exist, skipping");
                continue;
            }
            match self.watcher.watch(path, RecursiveMode::Recursive) {
                Ok(()) => info!(path = %path.display(), "watching plugin directory"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to watch directory"),
            }
        }

        loop {
            tokio::select! {
                biased;

                () = self.manager.closed() => {
                    debug!("reload manager disposed, stopping watcher");
                    break;
                }

                event = self.raw_rx.recv() => match event {
                    Some(Ok(event)) => self.handle_raw_event(event).await,
                    Some(Err(e)) => warn!(error = %e, "filesystem watcher error"),
                    None => {
                        debug!("filesystem watcher channel closed, stopping");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_raw_event(&mut self, event: Event) {
        let removed = match event.kind {
            EventKind::Remove(_) => true,
            EventKind::Create(_) | EventKind::Modify(_) => false,
            _ => return,
        };

        let paths: Vec<PathBuf> = event
            .paths
            .into_iter()
            .filter(|p| !is_in_ignored_dir(p))
            .collect();
        if paths.is_empty() {
            return;
        }

        let hashed: Vec<(PathBuf, std::io::Result<Option<blake3::Hash>>)> = if removed {
            paths.into_iter().map(|p| (p, Ok(None))).collect()
        } else {
            match tokio::task::spawn_blocking(move || {
                paths
                    .into_iter()
                    .map(|p| {
                        let hash = hash_file(&p);
                        (p, hash)
                    })
                    .collect()
            })
            .await
            {
                Ok(hashed) => hashed,
                Err(e) => {
                    warn!(error = %e, "hash task was cancelled");
                    return;
                },
            }
        };

        for (path, hash) in hashed {
            if self.filter.admit(&path, removed, hash) {
                debug!(path = %path.display(), kind = ?event.kind, "file change detected");
                self.manager.schedule_reload(path);
            }
        }
    }
}

/// Whether `path` lies under one of [`IGNORED_DIRS`].
#[must_use]
pub fn is_in_ignored_dir(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| IGNORED_DIRS.contains(&s))
    })
}

/// blake3 hash of a file's bytes, or `None` for a directory.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> std::io::Result<Option<blake3::Hash>> {
    if path.is_dir() {
        return Ok(None);
    }
    let content = std::fs::read(path)?;
    Ok(Some(blake3::hash(&content)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignored_dirs() {
        assert!(is_in_ignored_dir(Path::new("/p/chat/node_modules/x.js")));
        assert!(is_in_ignored_dir(Path::new("/p/.git/HEAD")));
        assert!(is_in_ignored_dir(Path::new("/p/chat/target/debug/out")));
        assert!(!is_in_ignored_dir(Path::new("/p/chat/index")));
        assert!(!is_in_ignored_dir(Path::new("/p/distant/index")));
    }

    #[test]
    fn test_hash_file_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plugin.toml");
        std::fs::write(&file, "a = 1").unwrap();
        let first = hash_file(&file).unwrap().unwrap();
        std::fs::write(&file, "a = 2").unwrap();
        let second = hash_file(&file).unwrap().unwrap();
        assert_ne!(first, second);
        assert!(hash_file(dir.path()).unwrap().is_none());
        assert!(hash_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_filter_skips_unchanged_content() {
        let mut filter = ContentFilter::default();
        let path = Path::new("/p/chat/index");
        let h1 = blake3::hash(b"one");
        let h2 = blake3::hash(b"two");

        assert!(filter.admit(path, false, Ok(Some(h1))));
        assert!(!filter.admit(path, false, Ok(Some(h1))));
        assert!(filter.admit(path, false, Ok(Some(h2))));
        // Removal forgets the hash, so recreating identical content reloads.
        assert!(filter.admit(path, true, Ok(None)));
        assert!(filter.admit(path, false, Ok(Some(h2))));
    }

    #[test]
    fn test_filter_forwards_unreadable_and_directories() {
        let mut filter = ContentFilter::default();
        let path = Path::new("/p/chat");
        assert!(filter.admit(path, false, Ok(None)));
        let gone = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(filter.admit(path, false, Err(gone)));
    }
}
