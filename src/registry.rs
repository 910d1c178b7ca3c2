//! Registry of active directory watchers.
//!
//! Holds at most one watcher per project path, together with the flag that
//! keeps watch-triggered runs for that path from overlapping. The registry is
//! owned by `App` and only touched from the event loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::events::Event;
use crate::watch::{WatchError, WatchHandle, WatcherFactory};

struct WatchEntry<H> {
    handle: H,
    running: bool,
    generation: u64,
}

/// Path → watcher mapping with a per-path running flag.
pub struct WatcherRegistry<F: WatcherFactory> {
    factory: F,
    events: mpsc::Sender<Event>,
    entries: HashMap<PathBuf, WatchEntry<F::Handle>>,
    next_generation: u64,
}

impl<F: WatcherFactory> WatcherRegistry<F> {
    pub fn new(factory: F, events: mpsc::Sender<Event>) -> Self {
        Self {
            factory,
            events,
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Starts watching `path` unless it is already watched.
    ///
    /// Returns `Ok(true)` when a new watcher was created and `Ok(false)` when
    /// an existing one was kept.
    pub fn watch(&mut self, path: &Path) -> Result<bool, WatchError> {
        if self.entries.contains_key(path) {
            debug!(path = %path.display(), "already watching");
            return Ok(false);
        }
        let handle = self.factory.create(path, self.events.clone())?;
        self.next_generation += 1;
        self.entries.insert(
            path.to_path_buf(),
            WatchEntry {
                handle,
                running: false,
                generation: self.next_generation,
            },
        );
        info!(path = %path.display(), "watching project");
        Ok(true)
    }

    /// Closes and forgets the watcher for `path`. Returns whether one existed.
    pub fn unwatch(&mut self, path: &Path) -> bool {
        match self.entries.remove(path) {
            Some(mut entry) => {
                entry.handle.close();
                info!(path = %path.display(), "stopped watching project");
                true
            }
            None => false,
        }
    }

    /// Closes every watcher. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.handle.close();
        }
        if count > 0 {
            info!(count, "closed all watchers");
        }
        count
    }

    /// Marks a watch-triggered run as in flight for `path`.
    ///
    /// Returns the watcher generation when the run may start, or `None` when
    /// `path` is not watched or a run is already in flight.
    pub fn begin_run(&mut self, path: &Path) -> Option<u64> {
        let entry = self.entries.get_mut(path)?;
        if entry.running {
            debug!(path = %path.display(), "run already in flight, skipping change");
            return None;
        }
        entry.running = true;
        Some(entry.generation)
    }

    /// Clears the running flag set by `begin_run`.
    ///
    /// Completions from a watcher that has since been replaced are ignored.
    pub fn finish_run(&mut self, path: &Path, generation: u64) {
        if let Some(entry) = self.entries.get_mut(path) {
            if entry.generation == generation {
                entry.running = false;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
impl<F: WatcherFactory> WatcherRegistry<F> {
    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn is_running(&self, path: &Path) -> bool {
        self.entries.get(path).map(|entry| entry.running).unwrap_or(false)
    }

    pub fn handle(&self, path: &Path) -> Option<&F::Handle> {
        self.entries.get(path).map(|entry| &entry.handle)
    }
}
