//! File watching for project directories.
//!
//! `WatcherFactory` is the seam the registry uses to create watchers. The
//! `notify`-backed implementation spawns one debounce thread per watcher that
//! turns bursts of relevant filesystem events into a single
//! `Event::FileChanged` for the event loop. Paths can be ignored with glob
//! patterns and `.gitignore` rules.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::events::Event;

/// Patterns that are never worth a test run.
pub const DEFAULT_IGNORES: &[&str] = &["node_modules", ".git"];

/// Shortest debounce window accepted.
const MIN_DEBOUNCE: Duration = Duration::from_millis(50);

/// Errors that can occur while setting up a watcher.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("failed to read ignore rules: {0}")]
    Gitignore(#[from] ignore::Error),

    #[error("failed to watch {}: {source}", path.display())]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// A live watcher. Closing it stops further change notifications.
pub trait WatchHandle: Send {
    fn close(&mut self);
}

/// Creates watchers that report changes under a path to the event loop.
pub trait WatcherFactory {
    type Handle: WatchHandle;

    fn create(&self, path: &Path, events: mpsc::Sender<Event>) -> Result<Self::Handle, WatchError>;
}

/// Watch settings shared by every watcher the factory creates.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Extra glob patterns to ignore, on top of `DEFAULT_IGNORES`.
    pub ignore: Vec<String>,
    /// Whether `.gitignore` and `.git/info/exclude` rules apply.
    pub use_gitignore: bool,
    /// Quiet period that ends a burst of changes.
    pub debounce: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            use_gitignore: true,
            debounce: Duration::from_millis(200),
        }
    }
}

/// `WatcherFactory` backed by the platform's recommended `notify` watcher.
#[derive(Debug, Clone, Default)]
pub struct NotifyWatcherFactory {
    options: WatchOptions,
}

impl NotifyWatcherFactory {
    pub fn new(options: WatchOptions) -> Self {
        Self { options }
    }
}

/// Handle to a running `notify` watcher and its debounce thread.
pub struct NotifyHandle {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
    closed: Arc<AtomicBool>,
}

impl WatchHandle for NotifyHandle {
    /// Stops the watcher. Only the first call does anything.
    fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the watcher drops its callback, which disconnects the debounce thread.
        self.watcher = None;
        debug!(path = %self.path.display(), "watcher closed");
    }
}

impl Drop for NotifyHandle {
    // Handles dropped without an explicit close still release the watcher.
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.close();
        }
    }
}

impl WatcherFactory for NotifyWatcherFactory {
    type Handle = NotifyHandle;

    fn create(&self, path: &Path, events: mpsc::Sender<Event>) -> Result<NotifyHandle, WatchError> {
        if !path.is_dir() {
            return Err(WatchError::NotADirectory(path.to_path_buf()));
        }
        let mut patterns: Vec<String> = DEFAULT_IGNORES.iter().map(|p| p.to_string()).collect();
        patterns.extend(self.options.ignore.iter().cloned());
        let matcher = IgnoreMatcher::new(path, &patterns, self.options.use_gitignore)?;

        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|source| WatchError::Notify {
            path: path.to_path_buf(),
            source,
        })?;
        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Notify {
                path: path.to_path_buf(),
                source,
            })?;

        let closed = Arc::new(AtomicBool::new(false));
        let debounce = self.options.debounce.max(MIN_DEBOUNCE);
        let thread_path = path.to_path_buf();
        let thread_closed = Arc::clone(&closed);
        std::thread::spawn(move || {
            debounce_changes(thread_path, raw_rx, matcher, debounce, thread_closed, events);
        });
        debug!(path = %path.display(), ?debounce, "watching directory");

        Ok(NotifyHandle {
            path: path.to_path_buf(),
            watcher: Some(watcher),
            closed,
        })
    }
}

// Collapses each burst of relevant events into one `FileChanged`.
fn debounce_changes(
    path: PathBuf,
    raw_rx: std::sync::mpsc::Receiver<notify::Result<NotifyEvent>>,
    matcher: IgnoreMatcher,
    debounce: Duration,
    closed: Arc<AtomicBool>,
    tx: mpsc::Sender<Event>,
) {
    loop {
        let event = match raw_rx.recv() {
            Ok(res) => res,
            Err(_) => break,
        };
        if !is_relevant(&event, &matcher) {
            continue;
        }
        if let Err(err) = &event {
            warn!(path = %path.display(), %err, "watcher reported an error");
        }

        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= debounce {
                break;
            }
            match raw_rx.recv_timeout(debounce - elapsed) {
                Ok(res) => {
                    if is_relevant(&res, &matcher) {
                        last = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        if closed.load(Ordering::SeqCst) {
            break;
        }
        trace!(path = %path.display(), "change detected");
        if tx
            .blocking_send(Event::FileChanged { path: path.clone() })
            .is_err()
        {
            break;
        }
    }
    trace!(path = %path.display(), "debounce thread finished");
}

fn is_relevant(event: &notify::Result<NotifyEvent>, matcher: &IgnoreMatcher) -> bool {
    let Ok(event) = event else {
        return true;
    };
    // The runner itself reads every test file.
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    if event.paths.is_empty() {
        return true;
    }
    event.paths.iter().any(|path| !matcher.is_ignored(path))
}

struct IgnoreMatcher {
    // Combines explicit ignore globs with optional gitignore rules.
    base: PathBuf,
    globset: Option<GlobSet>,
    gitignore: Option<Gitignore>,
}

impl IgnoreMatcher {
    fn new(base: &Path, patterns: &[String], use_gitignore: bool) -> Result<Self, WatchError> {
        let globset = if patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                for expanded in expand_pattern(pattern) {
                    builder.add(Glob::new(&expanded)?);
                }
            }
            Some(builder.build()?)
        };

        let gitignore = if use_gitignore {
            Some(build_gitignore(base)?)
        } else {
            None
        };

        Ok(Self {
            base: base.to_path_buf(),
            globset,
            gitignore,
        })
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if let Some(globset) = &self.globset {
            if let Ok(relative) = path.strip_prefix(&self.base) {
                if globset.is_match(relative) {
                    return true;
                }
            } else if globset.is_match(path) {
                return true;
            }
        }
        if let Some(gitignore) = &self.gitignore {
            let is_dir = path.is_dir();
            // Directory rules like `coverage/` must also cover the files inside.
            let matched = if path.starts_with(&self.base) {
                gitignore.matched_path_or_any_parents(path, is_dir)
            } else {
                gitignore.matched(path, is_dir)
            };
            if matched.is_ignore() {
                return true;
            }
        }
        false
    }
}

// Bare names match at any depth; paths with a slash stay anchored to the project root.
fn expand_pattern(pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim_end_matches('/');
    let has_glob = pattern.contains('*') || pattern.contains('?') || pattern.contains('[');
    if has_glob {
        return vec![pattern.to_string()];
    }
    let mut expanded = vec![trimmed.to_string(), format!("{}/**", trimmed)];
    if !trimmed.contains('/') {
        expanded.push(format!("**/{}", trimmed));
        expanded.push(format!("**/{}/**", trimmed));
    }
    expanded
}

fn build_gitignore(base: &Path) -> Result<Gitignore, WatchError> {
    let mut builder = GitignoreBuilder::new(base);
    for ancestor in base.ancestors() {
        let path = ancestor.join(".gitignore");
        if path.exists() {
            builder.add(path);
        }
        let exclude = ancestor.join(".git").join("info").join("exclude");
        if exclude.exists() {
            builder.add(exclude);
        }
    }
    Ok(builder.build()?)
}
