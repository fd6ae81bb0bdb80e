//! Test execution functionality
//!
//! Every run happens in a fresh copy of the fixture's `config/` directory
//! below the process temp root. The copy is removed when its
//! [`RunDirectory`] guard is dropped, on every exit path.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::baseline::{evaluate, RotationTag, Sample};
use crate::comparison::Comparator;
use crate::config::{Mode, RunnerConfig};
use crate::discovery::{ConsistencyResult, Fixture, PerformanceResult, TestStatus};
use crate::history::History;
use crate::signal::ShutdownFlag;
use crate::TestError;

/// How the application terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self { code: status.code(), signal }
    }
}

/// Shared state every worker needs
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Arc<RunnerConfig>,
    pub history: Arc<History>,
    pub shutdown: ShutdownFlag,
    /// Process temp root holding the run directories
    pub run_root: PathBuf,
}

impl RunContext {
    fn comparator(&self) -> Comparator {
        Comparator::new(self.config.diff_max_threshold)
            .show_diff(self.config.show_diff)
            .ignore_files(self.config.expected_ignore.iter().cloned())
            .skip_dirs(self.history.metadata_dir())
    }
}

/// Ephemeral working copy of a fixture's `config/` directory
#[derive(Debug)]
pub struct RunDirectory {
    path: PathBuf,
}

impl RunDirectory {
    /// Copy `source` to `<root>/<name>` and strip version control metadata
    pub fn create(
        root: &Path,
        name: &str,
        source: &Path,
        history: &History,
    ) -> Result<Self, TestError> {
        let path = root.join(name);
        if path.exists() {
            fs::remove_dir_all(&path)
                .map_err(|e| TestError::Setup(format!("stale run directory: {}", e)))?;
        }

        // The guard owns the path from here so partial copies are cleaned up
        let run_dir = Self { path };
        copy_tree(source, &run_dir.path, &BTreeSet::new())
            .map_err(|e| TestError::Setup(e.to_string()))?;
        history.strip_metadata(&run_dir.path);

        Ok(run_dir)
    }

    /// Create the run directory of `fixture` on the blocking pool
    pub async fn materialize(fixture: &Fixture, ctx: &RunContext) -> Result<Self, TestError> {
        let root = ctx.run_root.clone();
        let name = fixture.name.clone();
        let source = fixture.config_dir();
        let history = Arc::clone(&ctx.history);

        tokio::task::spawn_blocking(move || Self::create(&root, &name, &source, &history))
            .await
            .map_err(|e| TestError::Setup(format!("copy task failed: {}", e)))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunDirectory {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clean up {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Copy a directory tree, skipping the given relative file paths
fn copy_tree(source: &Path, target: &Path, skip: &BTreeSet<PathBuf>) -> Result<(), TestError> {
    fs::create_dir_all(target)?;

    for entry in WalkDir::new(source).follow_links(true).min_depth(1) {
        let entry = entry.map_err(|e| TestError::Io(e.into()))?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else if !skip.contains(relative) {
            fs::copy(entry.path(), &destination)?;
        }
    }

    Ok(())
}

/// Relative paths of the files below `dir`, outside metadata directories
fn relative_files(dir: &Path, metadata_dir: Option<&str>) -> Result<BTreeSet<PathBuf>, TestError> {
    let mut files = BTreeSet::new();
    let walker = WalkDir::new(dir).follow_links(true).into_iter().filter_entry(|entry| {
        entry.depth() == 0 || metadata_dir.map_or(true, |name| entry.file_name() != name)
    });

    for entry in walker {
        let entry = entry.map_err(|e| TestError::Io(e.into()))?;
        if entry.file_type().is_file() {
            files.insert(entry.path().strip_prefix(dir).unwrap_or(entry.path()).to_path_buf());
        }
    }

    Ok(files)
}

/// Run the application in `cwd` and wait for it, draining its output.
///
/// With `echo` set, every output line is printed as `<echo> output: <line>`.
/// An interrupt kills the process and returns [`TestError::Interrupted`].
pub async fn run_app(
    app: &Path,
    args: &[String],
    cwd: &Path,
    echo: Option<&str>,
    shutdown: &ShutdownFlag,
) -> Result<ExitOutcome, TestError> {
    if shutdown.should_stop() {
        return Err(TestError::Interrupted);
    }

    let mut child = Command::new(app)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TestError::Invocation(format!("{}: {}", app.display(), e)))?;

    let label = echo.map(str::to_string);
    let mut drains = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        drains.push(drain(stdout, label.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(drain(stderr, label));
    }

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = shutdown.cancelled() => None,
    };

    let Some(status) = status else {
        debug!("Killing {} after interrupt", app.display());
        if let Err(e) = child.kill().await {
            warn!("Failed to kill {}: {}", app.display(), e);
        }
        // Grandchildren may still hold the pipes open
        for handle in drains {
            handle.abort();
        }
        return Err(TestError::Interrupted);
    };

    let status = status.map_err(|e| TestError::Invocation(format!("wait failed: {}", e)))?;
    futures::future::join_all(drains).await;

    Ok(ExitOutcome::from(status))
}

fn drain<R>(reader: R, echo: Option<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if let Some(name) = &echo {
                        let text = String::from_utf8_lossy(&line);
                        println!("{} output: {}", name, text.trim_end_matches(['\r', '\n']));
                    }
                }
            }
        }
    })
}

/// User time consumed so far by terminated, waited-for children, in seconds
#[cfg(unix)]
pub fn children_user_time() -> f64 {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided struct
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, usage.as_mut_ptr()) };
    if rc != 0 {
        return 0.0;
    }

    // SAFETY: initialized by the successful call above
    let usage = unsafe { usage.assume_init() };
    usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1_000_000.0
}

#[cfg(not(unix))]
pub fn children_user_time() -> f64 {
    0.0
}

fn failed(message: impl Into<String>) -> TestStatus {
    TestStatus::Failed(message.into())
}

/// Run the consistency phase of one fixture
pub async fn run_consistency(fixture: &Fixture, ctx: &RunContext) -> ConsistencyResult {
    let config = &ctx.config;
    let descriptor = &fixture.descriptor;

    if !fixture.is_consistency_test() {
        return ConsistencyResult::with_status(TestStatus::Skipped("not a consistency test".into()));
    }

    let mut has_expected = fixture.has_expected;
    if !has_expected && config.mode == Mode::Slave {
        return ConsistencyResult::with_status(TestStatus::Skipped("no expected results".into()));
    }

    if config.reset_expected {
        let expected = fixture.expected_dir();
        if expected.exists() {
            if let Err(e) = ctx.history.remove_directory(&expected).await {
                warn!("{}: {}", fixture.name, e);
                return ConsistencyResult::with_status(failed(
                    "unable to remove expected directory for reset",
                ));
            }
        }
        has_expected = false;
    }

    if has_expected && config.skip_tests {
        return ConsistencyResult::with_status(TestStatus::Skipped(String::new()));
    }

    if descriptor.consistency_long && !config.long_tests {
        return ConsistencyResult::with_status(TestStatus::Skipped("long".into()));
    }

    let start = Instant::now();
    let mut result = ConsistencyResult::with_status(TestStatus::Running);
    let status = consistency_run(fixture, ctx, has_expected, &mut result).await;
    result.status = status;
    result.duration = start.elapsed();
    result
}

async fn consistency_run(
    fixture: &Fixture,
    ctx: &RunContext,
    has_expected: bool,
    result: &mut ConsistencyResult,
) -> TestStatus {
    let config = &ctx.config;
    let descriptor = &fixture.descriptor;

    let run_dir = match RunDirectory::materialize(fixture, ctx).await {
        Ok(run_dir) => run_dir,
        Err(e) => {
            warn!("{}: {}", fixture.name, e);
            return failed("error occurred creating run directory");
        }
    };

    let args = match descriptor.argv() {
        Ok(args) => args,
        Err(e) => return failed(e.to_string()),
    };

    let echo = config.verbose.then_some(fixture.name.as_str());
    let exit = match run_app(&descriptor.app, &args, run_dir.path(), echo, &ctx.shutdown).await {
        Ok(exit) => exit,
        Err(TestError::Interrupted) => return TestStatus::Skipped("interrupted".into()),
        Err(e) => return failed(e.to_string()),
    };
    result.exit = Some(exit);

    if descriptor.exit_policy.violated_by(exit.success()) {
        return failed("failed");
    }

    if !has_expected {
        if config.mode == Mode::Slave {
            return TestStatus::Skipped("no expected results".into());
        }

        return match record_expectations(fixture, &run_dir, ctx).await {
            Ok(()) => {
                result.generated_expectations = true;
                TestStatus::Passed("new expected results generated".into())
            }
            Err(e) => {
                warn!("{}: {}", fixture.name, e);
                failed("unable to process new expected results")
            }
        };
    }

    let comparator = ctx.comparator();
    let actual = run_dir.path().to_path_buf();
    let expected = fixture.expected_dir();
    let comparison =
        tokio::task::spawn_blocking(move || comparator.compare(&actual, &expected)).await;

    match comparison {
        Ok(Ok(comparison)) if comparison.matches => TestStatus::Passed("passed".into()),
        Ok(Ok(comparison)) => {
            result.problems = comparison.problems;
            failed("failed")
        }
        Ok(Err(e)) => failed(e.to_string()),
        Err(e) => failed(format!("comparison task failed: {}", e)),
    }
}

/// Copy the produced files, minus the inputs, into `expected/` and track it
async fn record_expectations(
    fixture: &Fixture,
    run_dir: &RunDirectory,
    ctx: &RunContext,
) -> Result<(), TestError> {
    let source = fixture.config_dir();
    let produced = run_dir.path().to_path_buf();
    let expected = fixture.expected_dir();
    let target = expected.clone();
    let metadata_dir = ctx.history.metadata_dir().map(str::to_string);

    tokio::task::spawn_blocking(move || {
        let inputs = relative_files(&source, metadata_dir.as_deref())?;
        copy_tree(&produced, &target, &inputs)
    })
    .await
    .map_err(|e| TestError::Setup(format!("copy task failed: {}", e)))??;

    ctx.history.add_directory(&expected).await
}

/// Run the performance phase of one fixture
pub async fn run_performance(fixture: &Fixture, ctx: &RunContext) -> PerformanceResult {
    let config = &ctx.config;

    if fixture.has_perf_baseline && config.skip_tests {
        return PerformanceResult::with_status(TestStatus::Skipped(String::new()));
    }

    if fixture.descriptor.performance_long && !config.long_tests {
        return PerformanceResult::with_status(TestStatus::Skipped("long".into()));
    }

    let start = Instant::now();
    let mut result = PerformanceResult::with_status(TestStatus::Running);
    let status = performance_run(fixture, ctx, &mut result).await;
    result.status = status;
    result.duration = start.elapsed();
    result
}

async fn performance_run(
    fixture: &Fixture,
    ctx: &RunContext,
    result: &mut PerformanceResult,
) -> TestStatus {
    let config = &ctx.config;
    let descriptor = &fixture.descriptor;

    let run_dir = match RunDirectory::materialize(fixture, ctx).await {
        Ok(run_dir) => run_dir,
        Err(e) => {
            warn!("{}: {}", fixture.name, e);
            return failed("error occurred creating run directory");
        }
    };

    let args = match descriptor.argv() {
        Ok(args) => args,
        Err(e) => return failed(e.to_string()),
    };

    let mut samples = Vec::with_capacity(config.repeat);
    for _ in 0..config.repeat {
        let wall_start = Instant::now();
        let user_start = children_user_time();

        let exit = match run_app(&descriptor.app, &args, run_dir.path(), None, &ctx.shutdown).await
        {
            Ok(exit) => exit,
            Err(TestError::Interrupted) => return TestStatus::Skipped("interrupted".into()),
            Err(e) => return failed(e.to_string()),
        };

        let user = (children_user_time() - user_start).max(0.0);
        let wall = wall_start.elapsed().as_secs_f64();

        if descriptor.exit_policy.violated_by(exit.success()) {
            return failed("test app returned non-zero exit code");
        }
        samples.push(Sample { user, wall });
    }
    drop(run_dir);

    let store = fixture.baselines();
    let prior = if fixture.has_perf_baseline {
        match store.load() {
            Ok(prior) => prior,
            Err(e) => return failed(e.to_string()),
        }
    } else {
        None
    };

    let Some(evaluation) = evaluate(
        &samples,
        prior.as_ref(),
        config.user_margin,
        config.wall_margin,
        config.save_perf_results(),
    ) else {
        return failed("no timing samples collected");
    };

    if evaluation.updates_baseline() {
        if evaluation.rotates_baseline() {
            let revision = ctx.history.revision(&fixture.dir).await;
            if let Err(e) = store.rotate(RotationTag::Prev, &revision) {
                return failed(e.to_string());
            }
        }
        if let Err(e) = store.write(&evaluation.record) {
            return failed(e.to_string());
        }
    }

    let message = evaluation.message();
    let status = if evaluation.verdict.is_failure() {
        failed(message)
    } else {
        TestStatus::Passed(message)
    };
    result.evaluation = Some(evaluation);
    status
}
