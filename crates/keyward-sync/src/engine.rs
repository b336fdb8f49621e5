use std::{
    fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use keyward_core::{
    events::{EventSink, Severity, TracingEventSink},
    run_state::RunState,
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::{checksum, RunStateSource, ScriptRunner, SourceRefresher};

pub const EVENT_START: u32 = 1000;
pub const EVENT_WAITING: u32 = 1001;
pub const EVENT_SKIPPED: u32 = 1002;
pub const EVENT_APPLIED: u32 = 1003;
pub const EVENT_DONE: u32 = 1004;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SyncError {
    /// The script name does not resolve to a file under the repository.
    #[error("script name {name:?} must be a relative path ending in a file name")]
    InvalidScriptName { name: String },
    #[error("failed to read convergence engine state: {0:#}")]
    StateRead(#[source] anyhow::Error),
    /// The convergence engine stayed busy past the configured limit.
    #[error("convergence engine still {last_state} after waiting {waited:?}")]
    StateWaitExceeded { waited: Duration, last_state: RunState },
    #[error("configuration source refresh failed: {0:#}")]
    Refresh(#[source] anyhow::Error),
    #[error("configuration script failed: {0:#}")]
    Apply(#[source] anyhow::Error),
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The script ran but its hash could not be recorded; the next run re-applies.
    #[error("script applied but hash record {path} was not updated: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where the configuration script and its hash record live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub install_path: PathBuf,
    pub repository_path: PathBuf,
    pub script_name: String,
}

impl SyncTarget {
    pub fn new(
        install_path: impl Into<PathBuf>,
        repository_path: impl Into<PathBuf>,
        script_name: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let target = Self {
            install_path: install_path.into(),
            repository_path: repository_path.into(),
            script_name: script_name.into(),
        };
        target.validate()?;
        Ok(target)
    }

    /// The script name must be relative and name a file, so the hash record
    /// gets a real `<file>.hash` name.
    pub fn validate(&self) -> Result<(), SyncError> {
        let name = Path::new(&self.script_name);
        let well_formed = name.file_name().is_some()
            && name.components().all(|c| matches!(c, Component::Normal(_)));
        if well_formed {
            Ok(())
        } else {
            Err(SyncError::InvalidScriptName {
                name: self.script_name.clone(),
            })
        }
    }

    pub fn script_path(&self) -> PathBuf {
        self.repository_path.join(&self.script_name)
    }

    pub fn hash_record_path(&self) -> PathBuf {
        checksum::hash_record_path(&self.install_path, &self.script_path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub poll_interval: Duration,
    /// `None` waits for a safe run state indefinitely.
    pub max_wait: Option<Duration>,
    /// Apply even when the hash record matches.
    pub force: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    /// Number of unsafe run-state reads before proceeding.
    pub waits: u32,
    pub hash: Option<String>,
}

/// Pull-and-apply loop coordinated with the convergence engine.
pub struct SyncEngine {
    target: SyncTarget,
    options: SyncOptions,
    state: Arc<dyn RunStateSource>,
    refresher: Arc<dyn SourceRefresher>,
    runner: Arc<dyn ScriptRunner>,
    events: Arc<dyn EventSink>,
}

impl SyncEngine {
    pub fn new(
        target: SyncTarget,
        options: SyncOptions,
        state: Arc<dyn RunStateSource>,
        refresher: Arc<dyn SourceRefresher>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Self {
        Self {
            target,
            options,
            state,
            refresher,
            runner,
            events: Arc::new(TracingEventSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn target(&self) -> &SyncTarget {
        &self.target
    }

    /// Run once to completion. On any failure the hash record is left as it
    /// was, so the next run retries the same configuration.
    #[instrument(skip_all, fields(script = %self.target.script_name, force = self.options.force))]
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        self.target.validate()?;
        self.events
            .emit(EVENT_START, Severity::Information, "configuration sync started");

        let waits = self.wait_for_safe_state().await?;

        self.refresher.refresh().await.map_err(SyncError::Refresh)?;
        debug!("configuration source refreshed");

        let script = self.target.script_path();
        let record = self.target.hash_record_path();
        if !self.options.force && checksum::matches(&script, &record) {
            self.events.emit(
                EVENT_SKIPPED,
                Severity::Information,
                "configuration unchanged; skipping apply",
            );
            self.finish(SyncOutcome::Skipped);
            return Ok(SyncReport {
                outcome: SyncOutcome::Skipped,
                waits,
                hash: None,
            });
        }

        let staged = StagedHash::prepare(&script, &record)?;
        self.runner.run(&script).await.map_err(SyncError::Apply)?;
        let hash = staged.commit()?;

        self.events.emit(
            EVENT_APPLIED,
            Severity::Information,
            &format!("configuration applied ({hash})"),
        );
        self.finish(SyncOutcome::Applied);
        Ok(SyncReport {
            outcome: SyncOutcome::Applied,
            waits,
            hash: Some(hash),
        })
    }

    async fn wait_for_safe_state(&self) -> Result<u32, SyncError> {
        let started = Instant::now();
        let mut waits = 0;
        loop {
            let state = self
                .state
                .current_state()
                .await
                .map_err(SyncError::StateRead)?;
            if state.is_safe() {
                return Ok(waits);
            }

            if waits == 0 {
                self.events.emit(
                    EVENT_WAITING,
                    Severity::Warning,
                    &format!("convergence engine is {state}; waiting for it to become idle"),
                );
            }
            let waited = started.elapsed();
            if let Some(max) = self.options.max_wait {
                if waited >= max {
                    return Err(SyncError::StateWaitExceeded {
                        waited,
                        last_state: state,
                    });
                }
            }
            waits += 1;
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    fn finish(&self, outcome: SyncOutcome) {
        info!(?outcome, "configuration sync finished");
        self.events
            .emit(EVENT_DONE, Severity::Information, "configuration sync finished");
    }
}

/// New hash written next to the record before the script runs, moved into
/// place only after the script succeeds. Dropping it discards the staged file.
struct StagedHash {
    tmp: NamedTempFile,
    record: PathBuf,
    hash: String,
}

impl StagedHash {
    fn prepare(script: &Path, record: &Path) -> Result<Self, SyncError> {
        let hash = checksum::file_hash(script).map_err(|source| SyncError::Io {
            path: script.to_path_buf(),
            source,
        })?;

        let io_err = |source| SyncError::Io {
            path: record.to_path_buf(),
            source,
        };
        let parent = match record.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(hash.as_bytes()).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;

        Ok(Self {
            tmp,
            record: record.to_path_buf(),
            hash,
        })
    }

    fn commit(self) -> Result<String, SyncError> {
        let Self { tmp, record, hash } = self;
        tmp.persist(&record).map_err(|e| SyncError::Record {
            path: record.clone(),
            source: e.error,
        })?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use keyward_core::events::RecordingEventSink;

    use super::*;

    /// Yields queued states, then repeats the last one forever.
    struct ScriptedState {
        states: Mutex<VecDeque<RunState>>,
        reads: AtomicUsize,
    }

    impl ScriptedState {
        fn new(states: Vec<RunState>) -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(states.into()),
                reads: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RunStateSource for ScriptedState {
        async fn current_state(&self) -> Result<RunState> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut states = self.states.lock().expect("lock");
            if states.len() > 1 {
                Ok(states.pop_front().expect("state"))
            } else {
                states.front().cloned().ok_or_else(|| anyhow!("no state"))
            }
        }
    }

    /// Counts refreshes and records how many state reads preceded the first one.
    struct CountingRefresher {
        state: Arc<ScriptedState>,
        calls: AtomicUsize,
        reads_at_first_call: AtomicUsize,
        fail: bool,
    }

    impl CountingRefresher {
        fn new(state: Arc<ScriptedState>) -> Arc<Self> {
            Arc::new(Self {
                state,
                calls: AtomicUsize::new(0),
                reads_at_first_call: AtomicUsize::new(0),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl SourceRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.reads_at_first_call
                    .store(self.state.reads.load(Ordering::SeqCst), Ordering::SeqCst);
            }
            if self.fail {
                return Err(anyhow!("remote unreachable"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScriptRunner for CountingRunner {
        async fn run(&self, _script: &Path) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("exit code 1"));
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        target: SyncTarget,
    }

    fn fixture(script: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = SyncTarget {
            install_path: dir.path().join("install"),
            repository_path: dir.path().join("repo"),
            script_name: "site.ps1".into(),
        };
        fs::create_dir_all(&target.repository_path).expect("repo dir");
        fs::write(target.script_path(), script).expect("write script");
        Fixture { _dir: dir, target }
    }

    fn fast() -> SyncOptions {
        SyncOptions {
            poll_interval: Duration::from_millis(1),
            ..SyncOptions::default()
        }
    }

    fn engine(
        target: &SyncTarget,
        options: SyncOptions,
        state: Arc<ScriptedState>,
        runner: Arc<CountingRunner>,
    ) -> SyncEngine {
        let refresher = CountingRefresher::new(state.clone());
        SyncEngine::new(target.clone(), options, state, refresher, runner)
    }

    #[tokio::test]
    async fn unchanged_script_applies_once() {
        let fx = fixture("Configuration Site {}");
        let runner = Arc::new(CountingRunner::default());
        let engine = engine(
            &fx.target,
            fast(),
            ScriptedState::new(vec![RunState::Idle]),
            runner.clone(),
        );

        let first = engine.run().await.expect("first run");
        assert_eq!(first.outcome, SyncOutcome::Applied);
        let second = engine.run().await.expect("second run");
        assert_eq!(second.outcome, SyncOutcome::Skipped);

        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert!(checksum::matches(
            &fx.target.script_path(),
            &fx.target.hash_record_path()
        ));
    }

    #[tokio::test]
    async fn changed_script_is_reapplied_then_skipped() {
        let fx = fixture("v1");
        let runner = Arc::new(CountingRunner::default());
        let engine = engine(
            &fx.target,
            fast(),
            ScriptedState::new(vec![RunState::Idle]),
            runner.clone(),
        );

        engine.run().await.expect("apply v1");
        fs::write(fx.target.script_path(), "v2").expect("mutate script");

        let report = engine.run().await.expect("apply v2");
        assert_eq!(report.outcome, SyncOutcome::Applied);
        let recorded = fs::read_to_string(fx.target.hash_record_path()).expect("record");
        assert_eq!(
            recorded,
            checksum::file_hash(&fx.target.script_path()).expect("hash")
        );
        assert_eq!(report.hash.as_deref(), Some(recorded.as_str()));

        let third = engine.run().await.expect("third run");
        assert_eq!(third.outcome, SyncOutcome::Skipped);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_applies_even_when_hash_matches() {
        let fx = fixture("v1");
        let runner = Arc::new(CountingRunner::default());
        let state = ScriptedState::new(vec![RunState::Idle]);
        engine(&fx.target, fast(), state.clone(), runner.clone())
            .run()
            .await
            .expect("initial run");

        let forced = SyncOptions {
            force: true,
            ..fast()
        };
        let report = engine(&fx.target, forced, state, runner.clone())
            .run()
            .await
            .expect("forced run");
        assert_eq!(report.outcome, SyncOutcome::Applied);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn waits_for_safe_state_before_syncing() {
        let fx = fixture("v1");
        let state = ScriptedState::new(vec![
            RunState::Busy,
            RunState::PendingReboot,
            RunState::Busy,
            RunState::PendingConfiguration,
        ]);
        let refresher = CountingRefresher::new(state.clone());
        let runner = Arc::new(CountingRunner::default());
        let events = RecordingEventSink::new();
        let engine = SyncEngine::new(
            fx.target.clone(),
            fast(),
            state.clone(),
            refresher.clone(),
            runner,
        )
        .with_events(Arc::new(events.clone()));

        let report = engine.run().await.expect("run");
        assert_eq!(report.waits, 3);
        assert_eq!(refresher.reads_at_first_call.load(Ordering::SeqCst), 4);
        assert_eq!(
            events.ids(),
            vec![EVENT_START, EVENT_WAITING, EVENT_APPLIED, EVENT_DONE]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_gives_up() {
        let fx = fixture("v1");
        let state = ScriptedState::new(vec![RunState::Busy]);
        let refresher = CountingRefresher::new(state.clone());
        let runner = Arc::new(CountingRunner::default());
        let options = SyncOptions {
            poll_interval: Duration::from_secs(5),
            max_wait: Some(Duration::from_secs(30)),
            force: false,
        };
        let engine = SyncEngine::new(
            fx.target.clone(),
            options,
            state,
            refresher.clone(),
            runner.clone(),
        );

        let err = engine.run().await.expect_err("should time out");
        assert!(matches!(
            err,
            SyncError::StateWaitExceeded {
                last_state: RunState::Busy,
                ..
            }
        ));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_apply_keeps_previous_record() {
        let fx = fixture("v1");
        let state = ScriptedState::new(vec![RunState::Idle]);
        let ok_runner = Arc::new(CountingRunner::default());
        engine(&fx.target, fast(), state.clone(), ok_runner)
            .run()
            .await
            .expect("apply v1");
        let before = fs::read_to_string(fx.target.hash_record_path()).expect("record");

        fs::write(fx.target.script_path(), "v2").expect("mutate");
        let failing = Arc::new(CountingRunner {
            fail: true,
            ..CountingRunner::default()
        });
        let err = engine(&fx.target, fast(), state.clone(), failing)
            .run()
            .await
            .expect_err("apply fails");
        assert!(matches!(err, SyncError::Apply(_)));
        assert_eq!(
            fs::read_to_string(fx.target.hash_record_path()).expect("record"),
            before
        );

        let staged: Vec<_> = fs::read_dir(&fx.target.install_path)
            .expect("install dir")
            .collect();
        assert_eq!(staged.len(), 1, "staged hash must be discarded");

        let retry_runner = Arc::new(CountingRunner::default());
        let report = engine(&fx.target, fast(), state, retry_runner.clone())
            .run()
            .await
            .expect("retry");
        assert_eq!(report.outcome, SyncOutcome::Applied);
        assert_eq!(retry_runner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_failure_aborts_run() {
        let fx = fixture("v1");
        let state = ScriptedState::new(vec![RunState::Idle]);
        let refresher = Arc::new(CountingRefresher {
            state: state.clone(),
            calls: AtomicUsize::new(0),
            reads_at_first_call: AtomicUsize::new(0),
            fail: true,
        });
        let runner = Arc::new(CountingRunner::default());
        let engine = SyncEngine::new(fx.target.clone(), fast(), state, refresher, runner.clone());

        let err = engine.run().await.expect_err("refresh fails");
        assert!(matches!(err, SyncError::Refresh(_)));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
        assert!(!fx.target.hash_record_path().exists());
    }

    #[tokio::test]
    async fn missing_script_is_io_error() {
        let fx = fixture("v1");
        fs::remove_file(fx.target.script_path()).expect("remove");
        let runner = Arc::new(CountingRunner::default());
        let err = engine(
            &fx.target,
            fast(),
            ScriptedState::new(vec![RunState::Idle]),
            runner.clone(),
        )
        .run()
        .await
        .expect_err("no script");
        assert!(matches!(err, SyncError::Io { .. }));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn script_name_must_name_a_file() {
        for name in ["..", "", "/etc/site.ps1", "../site.ps1"] {
            let err = SyncTarget::new("/opt/keyward", "/srv/repo", name).expect_err(name);
            assert!(matches!(err, SyncError::InvalidScriptName { .. }), "{name}");
        }
        let target = SyncTarget::new("/opt/keyward", "/srv/repo", "dsc/site.ps1").expect("nested");
        assert_eq!(
            target.hash_record_path(),
            PathBuf::from("/opt/keyward/site.ps1.hash")
        );
    }

    #[tokio::test]
    async fn run_rejects_unnamed_script_before_touching_anything() {
        let fx = fixture("v1");
        let target = SyncTarget {
            script_name: "..".into(),
            ..fx.target.clone()
        };
        let state = ScriptedState::new(vec![RunState::Idle]);
        let runner = Arc::new(CountingRunner::default());
        let err = engine(&target, fast(), state, runner.clone())
            .run()
            .await
            .expect_err("invalid script name");

        assert!(matches!(err, SyncError::InvalidScriptName { .. }));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
        assert!(!target.install_path.join(".hash").exists());
    }
}
