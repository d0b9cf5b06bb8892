//! Change watcher for the plugin and theme directories.
//!
//! ```text
//! filesystem events (notify)
//!   → drop ignored dirs, hidden and editor temp files
//!   → map to (addon directory, relative path)
//!   → debounce per file
//!   → blake3 hash the file, compare to the cached hash
//!   → emit AddonChange
//! ```
//!
//! Editors commonly write a file several times per save, and some touch
//! files without changing them; the debounce and the hash cache collapse
//! both into at most one notification per real change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::descriptor::AddonKind;
use crate::error::{AddonError, AddonResult};
use crate::host::{AddonChange, ChangeKind};

/// Directory names whose contents are never reported.
pub const IGNORED_DIRS: &[&str] = &["node_modules", "target", ".git"];

/// Suffixes editors use for swap and backup files.
const TEMP_SUFFIXES: &[&str] = &["~", ".swp", ".swx", ".tmp"];

struct WatchRoot {
    kind: AddonKind,
    path: PathBuf,
    /// Canonical form, since some backends report resolved paths.
    canonical: PathBuf,
}

/// Watches the addon directories and emits [`AddonChange`]s.
pub struct AddonWatcher {
    roots: Vec<WatchRoot>,
    debounce: Duration,
    /// blake3 hash per file seen so far.
    hash_cache: HashMap<PathBuf, String>,
    /// Dropping the handle stops filesystem monitoring.
    watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    event_tx: mpsc::Sender<AddonChange>,
}

impl std::fmt::Debug for AddonWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonWatcher")
            .field("debounce", &self.debounce)
            .field("tracked_files", &self.hash_cache.len())
            .finish_non_exhaustive()
    }
}

impl AddonWatcher {
    /// Create a watcher over `roots`.
    ///
    /// Returns the watcher and the receiver for its changes. Call
    /// [`run()`](Self::run) to start the event loop.
    ///
    /// # Errors
    ///
    /// Returns [`AddonError::Watcher`] if the platform watcher cannot be
    /// initialized.
    pub fn new(
        roots: Vec<(AddonKind, PathBuf)>,
        debounce: Duration,
    ) -> AddonResult<(Self, mpsc::Receiver<AddonChange>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| AddonError::Watcher(e.to_string()))?;

        let roots = roots
            .into_iter()
            .map(|(kind, path)| WatchRoot {
                kind,
                canonical: path.canonicalize().unwrap_or_else(|_| path.clone()),
                path,
            })
            .collect();

        Ok((
            Self {
                roots,
                debounce,
                hash_cache: HashMap::new(),
                watcher,
                raw_rx,
                event_tx,
            },
            event_rx,
        ))
    }

    /// Run the event loop until the receiver is dropped or the platform
    /// watcher shuts down.
    pub async fn run(mut self) {
        for root in &self.roots {
            if !root.path.exists() {
                warn!(path = %root.path.display(), "Addon directory does not exist, not watching");
                continue;
            }
            match self.watcher.watch(&root.path, RecursiveMode::Recursive) {
                Ok(()) => info!(path = %root.path.display(), kind = %root.kind, "Watching addon directory"),
                Err(e) => warn!(path = %root.path.display(), error = %e, "Failed to watch directory"),
            }
        }

        // Seed the cache so the first touch of an unchanged file is not
        // reported as a change.
        let seed_roots: Vec<PathBuf> = self.roots.iter().map(|r| r.path.clone()).collect();
        match tokio::task::spawn_blocking(move || seed_hashes(&seed_roots)).await {
            Ok(seeded) => {
                debug!(files = seeded.len(), "Seeded addon hash cache");
                self.hash_cache = seeded;
            },
            Err(e) => warn!(error = %e, "Hash seeding task was cancelled"),
        }

        let debounce = self.debounce;
        let mut pending: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();

        loop {
            let next_deadline = pending.values().copied().min();

            tokio::select! {
                biased;

                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = tokio::time::Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(path, _)| path.clone())
                        .collect();

                    for path in ready {
                        pending.remove(&path);
                        if !self.process_change(&path).await {
                            return;
                        }
                    }
                }

                event = self.raw_rx.recv() => {
                    match event {
                        Some(Ok(ev)) => self.handle_raw_event(&ev, &mut pending, debounce),
                        Some(Err(e)) => warn!(error = %e, "Filesystem watcher error"),
                        None => {
                            debug!("Filesystem watcher channel closed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_raw_event(
        &self,
        event: &Event,
        pending: &mut HashMap<PathBuf, tokio::time::Instant>,
        debounce: Duration,
    ) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {},
            _ => return,
        }

        for path in &event.paths {
            if is_ignored(path) || self.classify(path).is_none() {
                continue;
            }
            debug!(path = %path.display(), kind = ?event.kind, "Addon file event");
            #[allow(clippy::arithmetic_side_effects)]
            // Instant + Duration cannot overflow in practice
            let deadline = tokio::time::Instant::now() + debounce;
            pending.insert(path.clone(), deadline);
        }
    }

    /// Which addon directory `path` lives in, and its path relative to it.
    fn classify(&self, path: &Path) -> Option<(AddonKind, PathBuf)> {
        self.roots.iter().find_map(|root| {
            let relative = path
                .strip_prefix(&root.path)
                .or_else(|_| path.strip_prefix(&root.canonical))
                .ok()?;
            (!relative.as_os_str().is_empty()).then(|| (root.kind, relative.to_path_buf()))
        })
    }

    /// Hash the file and emit a change if its content differs from the cache.
    ///
    /// Returns `false` once the receiver has been dropped.
    async fn process_change(&mut self, path: &Path) -> bool {
        let Some((dir, relative)) = self.classify(path) else {
            return true;
        };

        let target = path.to_path_buf();
        let hashed = match tokio::task::spawn_blocking(move || hash_file(&target)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Hash task was cancelled");
                return true;
            },
        };

        let kind = match hashed {
            Ok(FileState::Present(hash)) => {
                match self.hash_cache.insert(path.to_path_buf(), hash.clone()) {
                    Some(previous) if previous == hash => {
                        debug!(path = %path.display(), "Content unchanged, skipping");
                        return true;
                    },
                    Some(_) => ChangeKind::Modified,
                    None => ChangeKind::Created,
                }
            },
            Ok(FileState::Missing) => {
                self.hash_cache.remove(path);
                ChangeKind::Removed
            },
            Ok(FileState::Directory) => return true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to hash changed file");
                return true;
            },
        };

        info!(%dir, path = %relative.display(), ?kind, "Addon file changed");
        if self
            .event_tx
            .send(AddonChange {
                dir,
                kind,
                path: relative,
            })
            .await
            .is_err()
        {
            debug!("Change receiver dropped, stopping watcher");
            return false;
        }
        true
    }
}

enum FileState {
    Present(String),
    Missing,
    Directory,
}

fn hash_file(path: &Path) -> std::io::Result<FileState> {
    if path.is_dir() {
        return Ok(FileState::Directory);
    }
    match std::fs::read(path) {
        Ok(bytes) => Ok(FileState::Present(blake3::hash(&bytes).to_hex().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileState::Missing),
        Err(e) => Err(e),
    }
}

fn seed_hashes(roots: &[PathBuf]) -> HashMap<PathBuf, String> {
    let mut hashes = HashMap::new();
    for root in roots {
        collect_hashes(root, &mut hashes);
    }
    hashes
}

fn collect_hashes(dir: &Path, hashes: &mut HashMap<PathBuf, String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() || is_ignored(&path) {
            continue;
        }
        if file_type.is_dir() {
            collect_hashes(&path, hashes);
        } else if let Ok(FileState::Present(hash)) = hash_file(&path) {
            hashes.insert(path, hash);
        }
    }
}

/// Whether changes to `path` are never reported.
fn is_ignored(path: &Path) -> bool {
    let in_ignored_dir = path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| IGNORED_DIRS.contains(&s))
    });
    let temp_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| {
            name.starts_with('.') || TEMP_SUFFIXES.iter().any(|s| name.ends_with(s))
        });
    in_ignored_dir || temp_name
}
