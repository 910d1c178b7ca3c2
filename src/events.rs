//! Event definitions for the application event loop.
//!
//! Everything that can change `App` state arrives as an `Event`: requests from
//! the UI, change notifications from watchers, and completions reported back
//! by spawned runner and storage tasks.

use std::path::PathBuf;

use crate::ipc::Request;

/// What caused a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Requested explicitly by the UI. Never deduplicated.
    Manual,
    /// Started by a file change seen by the watcher of the given generation.
    Watch { generation: u64 },
}

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A request decoded from the UI channel.
    Request(Request),
    /// The UI channel closed; every window is gone.
    WindowsClosed,
    /// Files under a watched path changed (already debounced).
    FileChanged { path: PathBuf },
    /// A run finished. `succeeded` is false when the runner reported an error.
    RunFinished {
        path: PathBuf,
        trigger: Trigger,
        succeeded: bool,
    },
    /// Storage finished removing a project.
    ProjectRemoved { path: PathBuf, was_removed: bool },
    /// The process received an interrupt or terminate signal.
    Shutdown,
}
