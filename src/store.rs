//! Persistence of tracked projects.
//!
//! `ProjectStore` is the seam the application talks to. `JsonFileStore` keeps
//! the whole project list in a single JSON file, rewriting it on every change.

use std::env;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::project::{Project, RunRecord};

const STORE_FILE: &str = "projects.json";

/// Errors that can occur while reading or writing the project list.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt project store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize projects for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted list of projects, keyed by path.
pub trait ProjectStore: Send + Sync + 'static {
    /// Returns every stored project.
    fn projects(&self) -> impl Future<Output = Result<Vec<Project>, StoreError>> + Send;

    /// Stores `record` as the latest run of `path`, creating the project if needed.
    fn update_project(
        &self,
        path: &Path,
        record: RunRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes `path`. Resolves to whether a project was actually removed.
    fn remove_project(&self, path: &Path) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// A `ProjectStore` backed by one JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Project>, StoreError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, projects: &[Project]) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }
        let serialized =
            serde_json::to_vec_pretty(projects).map_err(|source| StoreError::Serialize {
                path: self.path.clone(),
                source,
            })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!(path = %self.path.display(), count = projects.len(), "project store written");
        Ok(())
    }
}

impl ProjectStore for JsonFileStore {
    async fn projects(&self) -> Result<Vec<Project>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn update_project(&self, path: &Path, record: RunRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut projects = self.load().await?;
        match projects.iter_mut().find(|project| project.path == path) {
            Some(project) => project.apply(record),
            None => {
                let mut project = Project::new(path);
                project.apply(record);
                projects.push(project);
            }
        }
        self.save(&projects).await
    }

    async fn remove_project(&self, path: &Path) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut projects = self.load().await?;
        let before = projects.len();
        projects.retain(|project| project.path != path);
        if projects.len() == before {
            return Ok(false);
        }
        self.save(&projects).await?;
        Ok(true)
    }
}

/// Default location of the project store file.
pub fn default_store_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("testrack").join(STORE_FILE))
}

fn data_dir() -> Option<PathBuf> {
    if let Ok(path) = env::var("XDG_DATA_HOME") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    if cfg!(windows) {
        return env::var("LOCALAPPDATA").ok().map(PathBuf::from);
    }
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".local").join("share"))
}
