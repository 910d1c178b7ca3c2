//! Request routing and run orchestration.
//!
//! `App` owns the watcher registry and reacts to every `Event` the main loop
//! receives. Anything that may take time (test runs, storage access) is
//! spawned as a task that reports back through the event channel, so the loop
//! itself never waits on a collaborator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{Event, Trigger};
use crate::ipc::{Message, Outbox, Request};
use crate::project::{RunReport, TestResults};
use crate::registry::WatcherRegistry;
use crate::runner::{RunError, TestRunner};
use crate::store::ProjectStore;
use crate::watch::WatcherFactory;

/// Whether the main loop should keep going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// The main application state: collaborators plus the watcher registry.
pub struct App<S, R, F: WatcherFactory> {
    store: Arc<S>,
    runner: Arc<R>,
    registry: WatcherRegistry<F>,
    outbox: Outbox,
    events: mpsc::Sender<Event>,
    quit_on_all_windows_closed: bool,
}

impl<S, R, F> App<S, R, F>
where
    S: ProjectStore,
    R: TestRunner,
    F: WatcherFactory,
{
    /// Creates a new `App`. `events` must feed back into the loop that calls
    /// `handle_event`.
    pub fn new(
        store: Arc<S>,
        runner: Arc<R>,
        factory: F,
        outbox: Outbox,
        events: mpsc::Sender<Event>,
        quit_on_all_windows_closed: bool,
    ) -> Self {
        Self {
            store,
            runner,
            registry: WatcherRegistry::new(factory, events.clone()),
            outbox,
            events,
            quit_on_all_windows_closed,
        }
    }

    pub fn registry(&self) -> &WatcherRegistry<F> {
        &self.registry
    }

    /// Applies one event to the application state.
    pub async fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Request(request) => return self.handle_request(request).await,
            Event::WindowsClosed => {
                if self.quit_on_all_windows_closed {
                    info!("UI disconnected");
                    return self.quit();
                }
                if self.registry.is_empty() {
                    info!("UI disconnected, waiting for a signal to exit");
                } else {
                    info!(
                        watchers = self.registry.len(),
                        "UI disconnected, watchers stay active"
                    );
                }
            }
            Event::FileChanged { path } => {
                if let Some(generation) = self.registry.begin_run(&path) {
                    info!(path = %path.display(), "files changed");
                    self.run_test(path, Trigger::Watch { generation }).await;
                }
            }
            Event::RunFinished {
                path,
                trigger,
                succeeded,
            } => {
                debug!(path = %path.display(), ?trigger, succeeded, "run finished");
                if let Trigger::Watch { generation } = trigger {
                    self.registry.finish_run(&path, generation);
                }
            }
            Event::ProjectRemoved { path, was_removed } => {
                self.registry.unwatch(&path);
                self.outbox
                    .send(Message::ProjectRemoved { path, was_removed })
                    .await;
            }
            Event::Shutdown => return self.quit(),
        }
        Flow::Continue
    }

    async fn handle_request(&mut self, request: Request) -> Flow {
        match request {
            Request::Initialize => self.initialize(),
            Request::WatchDirectory(path) => self.watch_directory(path).await,
            Request::ExecuteTest(path) => self.run_test(path, Trigger::Manual).await,
            Request::RemoveProject(path) => self.remove_project(path),
            Request::Quit => return self.quit(),
        }
        Flow::Continue
    }

    fn initialize(&self) {
        let store = Arc::clone(&self.store);
        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            let projects = match store.projects().await {
                Ok(projects) => projects,
                Err(err) => {
                    warn!(%err, "failed to load projects");
                    Vec::new()
                }
            };
            debug!(count = projects.len(), "sending projects");
            outbox.send(Message::SetProjects(projects)).await;
        });
    }

    async fn watch_directory(&mut self, path: PathBuf) {
        if let Err(err) = self.registry.watch(&path) {
            warn!(path = %path.display(), %err, "failed to watch project");
            self.outbox
                .send(Message::WatchError {
                    path,
                    error: err.to_string(),
                })
                .await;
        }
    }

    /// Announces a run to the UI and spawns it.
    ///
    /// Completion is reported to the loop before results are delivered, so the
    /// running flag is released even if persistence is slow.
    async fn run_test(&self, path: PathBuf, trigger: Trigger) {
        self.outbox.send(Message::TestStart(path.clone())).await;

        let store = Arc::clone(&self.store);
        let runner = Arc::clone(&self.runner);
        let outbox = self.outbox.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = runner.run(&path).await;
            let _ = events
                .send(Event::RunFinished {
                    path: path.clone(),
                    trigger,
                    succeeded: result.is_ok(),
                })
                .await;
            deliver_run(store.as_ref(), &outbox, &path, result).await;
        });
    }

    fn remove_project(&self, path: PathBuf) {
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        tokio::spawn(async move {
            let was_removed = match store.remove_project(&path).await {
                Ok(removed) => removed,
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to remove project");
                    false
                }
            };
            let _ = events
                .send(Event::ProjectRemoved { path, was_removed })
                .await;
        });
    }

    fn quit(&mut self) -> Flow {
        let closed = self.registry.close_all();
        info!(closed, "shutting down");
        Flow::Quit
    }
}

/// Persists a finished run and pushes its outcome to the UI.
///
/// Runner errors are forwarded and never persisted. Persistence errors are
/// logged and the results are pushed anyway.
pub async fn deliver_run<S: ProjectStore>(
    store: &S,
    outbox: &Outbox,
    path: &Path,
    result: Result<RunReport, RunError>,
) {
    match result {
        Err(err) => {
            warn!(path = %path.display(), %err, "test run failed");
            outbox
                .send(Message::TestError {
                    error: err.to_string(),
                    path: path.to_path_buf(),
                })
                .await;
        }
        Ok(report) => {
            let results = TestResults::new(path, report, Utc::now());
            let stats = &results.report.stats;
            info!(
                path = %path.display(),
                tests = stats.tests,
                passes = stats.passes,
                failures = stats.failures,
                pending = stats.pending,
                "test run complete"
            );
            if let Err(err) = store.update_project(path, results.record()).await {
                warn!(path = %path.display(), %err, "failed to persist run statistics");
            }
            outbox.send(Message::TestResults(results)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use crate::project::{Project, RunRecord, RunStats};
    use crate::registry::tests::FakeFactory;
    use crate::store::StoreError;

    #[derive(Default)]
    struct FakeStore {
        projects: Mutex<Vec<Project>>,
        updates: Mutex<Vec<(PathBuf, RunRecord)>>,
        fail_updates: bool,
    }

    impl FakeStore {
        fn with_projects(paths: &[&str]) -> Self {
            let store = Self::default();
            *store.projects.lock().unwrap() = paths.iter().map(|p| Project::new(*p)).collect();
            store
        }

        fn updates(&self) -> Vec<(PathBuf, RunRecord)> {
            self.updates.lock().unwrap().clone()
        }
    }

    impl ProjectStore for FakeStore {
        async fn projects(&self) -> Result<Vec<Project>, StoreError> {
            Ok(self.projects.lock().unwrap().clone())
        }

        async fn update_project(&self, path: &Path, record: RunRecord) -> Result<(), StoreError> {
            self.updates
                .lock()
                .unwrap()
                .push((path.to_path_buf(), record));
            if self.fail_updates {
                return Err(StoreError::Io {
                    path: PathBuf::from("projects.json"),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
                });
            }
            Ok(())
        }

        async fn remove_project(&self, path: &Path) -> Result<bool, StoreError> {
            let mut projects = self.projects.lock().unwrap();
            let before = projects.len();
            projects.retain(|project| project.path != path);
            Ok(projects.len() != before)
        }
    }

    /// Runner whose runs only finish once a permit is released.
    struct FakeRunner {
        calls: AtomicUsize,
        gate: Semaphore,
        fail: bool,
    }

    impl FakeRunner {
        fn instant() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::instant()
            }
        }

        fn gated() -> Self {
            Self {
                gate: Semaphore::new(0),
                ..Self::instant()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn stats() -> RunStats {
        RunStats {
            suites: 1,
            tests: 3,
            passes: 3,
            ..RunStats::default()
        }
    }

    impl TestRunner for FakeRunner {
        async fn run(&self, path: &Path) -> Result<RunReport, RunError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            if self.fail {
                return Err(RunError::MissingProject(path.to_path_buf()));
            }
            Ok(RunReport {
                stats: stats(),
                ..RunReport::default()
            })
        }
    }

    struct Harness {
        app: App<FakeStore, FakeRunner, FakeFactory>,
        events: mpsc::Receiver<Event>,
        messages: mpsc::Receiver<Message>,
        store: Arc<FakeStore>,
        runner: Arc<FakeRunner>,
        factory: FakeFactory,
    }

    impl Harness {
        fn new(store: FakeStore, runner: FakeRunner) -> Self {
            Self::with_factory(store, runner, FakeFactory::default(), true)
        }

        fn with_factory(
            store: FakeStore,
            runner: FakeRunner,
            factory: FakeFactory,
            quit_on_close: bool,
        ) -> Self {
            let (event_tx, events) = mpsc::channel(64);
            let (outbox, messages) = Outbox::channel(64);
            let store = Arc::new(store);
            let runner = Arc::new(runner);
            let app = App::new(
                Arc::clone(&store),
                Arc::clone(&runner),
                factory.clone(),
                outbox,
                event_tx,
                quit_on_close,
            );
            Self {
                app,
                events,
                messages,
                store,
                runner,
                factory,
            }
        }

        async fn request(&mut self, request: Request) -> Flow {
            self.app.handle_event(Event::Request(request)).await
        }

        async fn changed(&mut self, path: &str) -> Flow {
            self.app
                .handle_event(Event::FileChanged {
                    path: PathBuf::from(path),
                })
                .await
        }

        async fn next_message(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(2), self.messages.recv())
                .await
                .expect("timed out waiting for message")
                .expect("outbox closed")
        }

        /// Feeds the next internal event back into the app.
        async fn pump(&mut self) -> Event {
            let event = tokio::time::timeout(Duration::from_secs(2), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            self.app.handle_event(event.clone()).await;
            event
        }

        fn release(&self, runs: usize) {
            self.runner.gate.add_permits(runs);
        }
    }

    #[tokio::test]
    async fn initialize_sends_stored_projects() {
        let mut h = Harness::new(FakeStore::with_projects(&["/work/a", "/work/b"]), FakeRunner::instant());
        assert_eq!(h.request(Request::Initialize).await, Flow::Continue);
        match h.next_message().await {
            Message::SetProjects(projects) => {
                let paths: Vec<_> = projects.into_iter().map(|p| p.path).collect();
                assert_eq!(paths, vec![PathBuf::from("/work/a"), PathBuf::from("/work/b")]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn watch_directory_keeps_existing_watcher() {
        let mut h = Harness::new(FakeStore::default(), FakeRunner::instant());
        let path = Path::new("/work/app");
        h.request(Request::WatchDirectory(path.to_path_buf())).await;
        let first = h.app.registry().handle(path).unwrap().id;
        h.request(Request::WatchDirectory(path.to_path_buf())).await;

        assert_eq!(h.app.registry().len(), 1);
        assert_eq!(h.factory.created_count(), 1);
        assert_eq!(h.app.registry().handle(path).unwrap().id, first);
    }

    #[tokio::test]
    async fn watch_failure_is_reported() {
        let factory = FakeFactory {
            fail: true,
            ..FakeFactory::default()
        };
        let mut h = Harness::with_factory(FakeStore::default(), FakeRunner::instant(), factory, true);
        h.request(Request::WatchDirectory(PathBuf::from("/missing"))).await;
        assert!(h.app.registry().is_empty());
        match h.next_message().await {
            Message::WatchError { path, .. } => assert_eq!(path, PathBuf::from("/missing")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn changes_ignored_for_unwatched_paths() {
        let mut h = Harness::new(FakeStore::default(), FakeRunner::instant());
        h.changed("/work/app").await;
        assert!(h.messages.try_recv().is_err());
        assert_eq!(h.runner.calls(), 0);
    }

    #[tokio::test]
    async fn change_during_run_does_not_start_another() {
        let mut h = Harness::new(FakeStore::default(), FakeRunner::gated());
        let path = PathBuf::from("/work/app");
        h.request(Request::WatchDirectory(path.clone())).await;

        h.changed("/work/app").await;
        assert_eq!(h.next_message().await, Message::TestStart(path.clone()));
        assert!(h.app.registry().is_running(&path));

        h.changed("/work/app").await;
        h.changed("/work/app").await;
        assert!(h.messages.try_recv().is_err());

        h.release(1);
        match h.pump().await {
            Event::RunFinished { trigger, succeeded, .. } => {
                assert!(matches!(trigger, Trigger::Watch { .. }));
                assert!(succeeded);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!h.app.registry().is_running(&path));
        assert!(matches!(h.next_message().await, Message::TestResults(_)));

        h.changed("/work/app").await;
        assert_eq!(h.next_message().await, Message::TestStart(path.clone()));
        h.release(1);
        h.pump().await;
        assert!(matches!(h.next_message().await, Message::TestResults(_)));
        assert_eq!(h.runner.calls(), 2);
    }

    #[tokio::test]
    async fn manual_runs_ignore_running_flag() {
        let mut h = Harness::new(FakeStore::default(), FakeRunner::gated());
        let path = PathBuf::from("/work/app");
        h.request(Request::WatchDirectory(path.clone())).await;
        h.changed("/work/app").await;
        h.request(Request::ExecuteTest(path.clone())).await;
        h.request(Request::ExecuteTest(path.clone())).await;

        for _ in 0..3 {
            assert_eq!(h.next_message().await, Message::TestStart(path.clone()));
        }
        assert!(h.app.registry().is_running(&path));

        h.release(3);
        for _ in 0..3 {
            h.pump().await;
        }
        assert_eq!(h.runner.calls(), 3);
        assert!(!h.app.registry().is_running(&path));
    }

    #[tokio::test]
    async fn successful_run_persists_and_pushes_results() {
        let mut h = Harness::new(FakeStore::default(), FakeRunner::instant());
        let path = PathBuf::from("/work/app");
        h.request(Request::ExecuteTest(path.clone())).await;

        assert_eq!(h.next_message().await, Message::TestStart(path.clone()));
        let results = match h.next_message().await {
            Message::TestResults(results) => results,
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(results.project_path, path);
        assert_eq!(results.report.stats, stats());

        let updates = h.store.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, path);
        assert_eq!(updates[0].1.stats, stats());
        assert_eq!(updates[0].1.updated_at, results.updated_at);

        match h.pump().await {
            Event::RunFinished { trigger, .. } => assert_eq!(trigger, Trigger::Manual),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(h.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_run_reports_error_without_persisting() {
        let mut h = Harness::new(FakeStore::default(), FakeRunner::failing());
        let path = PathBuf::from("/work/app");
        h.request(Request::ExecuteTest(path.clone())).await;

        assert_eq!(h.next_message().await, Message::TestStart(path.clone()));
        match h.next_message().await {
            Message::TestError { error, path: failed } => {
                assert_eq!(failed, path);
                assert!(error.contains("does not exist"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        match h.pump().await {
            Event::RunFinished { succeeded, .. } => assert!(!succeeded),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(h.store.updates().is_empty());
        assert!(h.messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn persistence_failure_still_pushes_results() {
        let store = FakeStore {
            fail_updates: true,
            ..FakeStore::default()
        };
        let mut h = Harness::new(store, FakeRunner::instant());
        h.request(Request::ExecuteTest(PathBuf::from("/work/app"))).await;

        h.next_message().await;
        assert!(matches!(h.next_message().await, Message::TestResults(_)));
        assert_eq!(h.store.updates().len(), 1);
    }

    #[tokio::test]
    async fn remove_project_closes_watcher_and_reports() {
        let mut h = Harness::new(FakeStore::with_projects(&["/work/app"]), FakeRunner::instant());
        let path = PathBuf::from("/work/app");
        h.request(Request::WatchDirectory(path.clone())).await;
        h.request(Request::RemoveProject(path.clone())).await;

        match h.pump().await {
            Event::ProjectRemoved { was_removed, .. } => assert!(was_removed),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!h.app.registry().contains(&path));
        assert_eq!(h.factory.closes_for(&path), vec![1]);
        assert_eq!(
            h.next_message().await,
            Message::ProjectRemoved {
                path,
                was_removed: true
            }
        );
    }

    #[tokio::test]
    async fn remove_unknown_project_reports_false() {
        let mut h = Harness::new(FakeStore::default(), FakeRunner::instant());
        let path = PathBuf::from("/work/other");
        h.request(Request::RemoveProject(path.clone())).await;
        h.pump().await;
        assert_eq!(
            h.next_message().await,
            Message::ProjectRemoved {
                path,
                was_removed: false
            }
        );
    }

    #[tokio::test]
    async fn quit_closes_every_watcher_once() {
        let mut h = Harness::new(FakeStore::default(), FakeRunner::instant());
        for path in ["/work/a", "/work/b", "/work/c"] {
            h.request(Request::WatchDirectory(PathBuf::from(path))).await;
        }
        assert_eq!(h.request(Request::Quit).await, Flow::Quit);
        assert!(h.app.registry().is_empty());
        for path in ["/work/a", "/work/b", "/work/c"] {
            assert_eq!(h.factory.closes_for(Path::new(path)), vec![1]);
        }
    }

    #[tokio::test]
    async fn windows_closed_follows_quit_policy() {
        let mut quitting = Harness::new(FakeStore::default(), FakeRunner::instant());
        assert_eq!(quitting.app.handle_event(Event::WindowsClosed).await, Flow::Quit);

        let mut staying = Harness::with_factory(
            FakeStore::default(),
            FakeRunner::instant(),
            FakeFactory::default(),
            false,
        );
        staying
            .request(Request::WatchDirectory(PathBuf::from("/work/a")))
            .await;
        assert_eq!(staying.app.handle_event(Event::WindowsClosed).await, Flow::Continue);
        assert!(staying.app.registry().contains(Path::new("/work/a")));
        assert_eq!(staying.app.handle_event(Event::Shutdown).await, Flow::Quit);
        assert_eq!(staying.factory.closes_for(Path::new("/work/a")), vec![1]);
    }
}
