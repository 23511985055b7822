//! File-system watcher.
//!
//! `notify` delivers events on its own background thread; the queue lives
//! on the tokio loop. The bridge is a thread-safe channel send and nothing
//! else — the notify callback never spawns tasks or touches the stores.
//! The daemon side of the channel debounces, filters, and turns surviving
//! events into jobs.
//!
//! Registration failures for individual roots are logged and skipped so one
//! bad path does not take down watching for the rest.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::config::Config;

/// A change that survived kind-level filtering, before debounce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    Changed(PathBuf),
    Removed(PathBuf),
}

pub struct FileWatcher {
    // Held for its Drop: dropping stops the notify thread.
    _watcher: RecommendedWatcher,
    watched_roots: usize,
}

impl FileWatcher {
    /// Register watchers for every enabled source root and forward raw
    /// changes into `tx`. Roots are canonicalized and deduplicated by
    /// inode identity so symlinked duplicates (and loops) are registered
    /// once.
    pub fn start(config: &Config, tx: UnboundedSender<FsChange>) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Ok(event) = res else { return };
                let changes = match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => event
                        .paths
                        .iter()
                        .map(|p| FsChange::Changed(p.clone()))
                        .collect::<Vec<_>>(),
                    EventKind::Remove(_) => event
                        .paths
                        .iter()
                        .map(|p| FsChange::Removed(p.clone()))
                        .collect(),
                    _ => Vec::new(),
                };
                for change in changes {
                    // Thread-safe hand-off onto the main loop; never block
                    // or spawn from the notify thread.
                    let _ = tx.send(change);
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        let mut seen_roots: HashSet<(u64, u64)> = HashSet::new();
        let mut watched = 0usize;

        for source in config.sources.iter().filter(|s| s.enabled) {
            let path = &source.path;
            if !path.exists() {
                warn!(path = %path.display(), "watch root does not exist, skipping");
                continue;
            }

            if let Some(identity) = inode_identity(path) {
                if !seen_roots.insert(identity) {
                    warn!(path = %path.display(), "watch root already registered via another link, skipping");
                    continue;
                }
            }

            let mode = if source.recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };

            match watcher.watch(path, mode) {
                Ok(()) => {
                    info!(path = %path.display(), recursive = source.recursive, "watching");
                    watched += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to watch root, continuing");
                }
            }
        }

        if watched == 0 {
            warn!("no valid watch roots; watcher idle");
        }

        Ok(Self {
            _watcher: watcher,
            watched_roots: watched,
        })
    }

    pub fn watched_roots(&self) -> usize {
        self.watched_roots
    }
}

#[cfg(unix)]
fn inode_identity(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn inode_identity(_path: &Path) -> Option<(u64, u64)> {
    None
}

/// Path-level filtering applied on the daemon side of the channel.
pub struct EventFilter {
    excluded_extensions: Vec<String>,
    file_types: Vec<Vec<String>>,
}

impl EventFilter {
    pub fn new(config: &Config) -> Self {
        Self {
            excluded_extensions: config.exclude.extensions.clone(),
            file_types: config
                .sources
                .iter()
                .filter(|s| s.enabled)
                .map(|s| s.file_types.iter().map(|t| t.to_lowercase()).collect())
                .collect(),
        }
    }

    /// Whether a changed path should become an extraction job.
    pub fn should_process(&self, path: &Path) -> bool {
        // Hidden files and anything under a hidden or VCS metadata directory.
        for component in path.components() {
            let name = component.as_os_str().to_string_lossy();
            if name.starts_with('.') && name.len() > 1 && name != "." && name != ".." {
                return false;
            }
            if matches!(
                name.as_ref(),
                "node_modules" | "target" | "__pycache__" | "CVS"
            ) {
                return false;
            }
        }

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if self.excluded_extensions.iter().any(|b| b == &ext) {
            return false;
        }

        // Per-source whitelists: if every configured source restricts
        // types, the extension must match at least one of them.
        if !self.file_types.is_empty() && self.file_types.iter().all(|t| !t.is_empty()) {
            return self.file_types.iter().any(|types| types.contains(&ext));
        }

        true
    }
}

/// Per-path debounce: at most one admitted event per window. Entries older
/// than two windows are pruned to bound the map.
pub struct Debouncer {
    window: Duration,
    last_admitted: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_admitted: HashMap::new(),
        }
    }

    pub fn admit(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(&last) = self.last_admitted.get(path) {
            if now.duration_since(last) < self.window {
                return false;
            }
        }
        self.last_admitted.insert(path.to_path_buf(), now);

        let horizon = self.window * 2;
        self.last_admitted
            .retain(|_, &mut t| now.duration_since(t) < horizon);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with(types: Vec<Vec<String>>, excluded: Vec<String>) -> EventFilter {
        EventFilter {
            excluded_extensions: excluded,
            file_types: types,
        }
    }

    #[test]
    fn test_hidden_and_vcs_paths_filtered() {
        let filter = filter_with(vec![], vec![]);
        assert!(!filter.should_process(Path::new("/home/u/.ssh/id_rsa")));
        assert!(!filter.should_process(Path::new("/repo/.git/objects/ab/cdef")));
        assert!(!filter.should_process(Path::new("/repo/node_modules/pkg/index.js")));
        assert!(filter.should_process(Path::new("/home/u/docs/plan.md")));
    }

    #[test]
    fn test_extension_blacklist() {
        let filter = filter_with(vec![], vec!["tmp".to_string(), "log".to_string()]);
        assert!(!filter.should_process(Path::new("/x/scratch.tmp")));
        assert!(!filter.should_process(Path::new("/x/daemon.log")));
        assert!(filter.should_process(Path::new("/x/notes.md")));
    }

    #[test]
    fn test_source_type_whitelist() {
        let filter = filter_with(vec![vec!["md".to_string(), "txt".to_string()]], vec![]);
        assert!(filter.should_process(Path::new("/x/a.md")));
        assert!(!filter.should_process(Path::new("/x/a.rs")));
    }

    #[test]
    fn test_unrestricted_source_admits_all() {
        // One source with no whitelist: everything (not otherwise excluded).
        let filter = filter_with(vec![vec![], vec!["md".to_string()]], vec![]);
        assert!(filter.should_process(Path::new("/x/a.rs")));
    }

    #[test]
    fn test_debounce_window() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let t0 = Instant::now();
        let path = Path::new("/x/a.md");

        assert!(debouncer.admit(path, t0));
        assert!(!debouncer.admit(path, t0 + Duration::from_millis(100)));
        assert!(!debouncer.admit(path, t0 + Duration::from_millis(499)));
        assert!(debouncer.admit(path, t0 + Duration::from_millis(501)));
    }

    #[test]
    fn test_debounce_independent_paths() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let t0 = Instant::now();
        assert!(debouncer.admit(Path::new("/x/a.md"), t0));
        assert!(debouncer.admit(Path::new("/x/b.md"), t0));
    }
}
