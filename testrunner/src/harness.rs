//! Main test harness orchestrating the test phases
//!
//! Consistency tests run as tokio tasks gated by a semaphore of `jobs`
//! permits. Every dispatched task is joined before the performance phase,
//! which runs one fixture at a time so timings are not disturbed.

use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use crate::baseline::RotationTag;
use crate::config::RunnerConfig;
use crate::discovery::{self, ConsistencyResult, Fixture, TestStatus};
use crate::execution::{run_consistency, run_performance, RunContext};
use crate::history::History;
use crate::reporting::RunReport;
use crate::signal::ShutdownFlag;
use crate::TestError;

/// Drives discovery and both test phases
pub struct Scheduler {
    config: Arc<RunnerConfig>,
    history: Arc<History>,
    shutdown: ShutdownFlag,
}

impl Scheduler {
    /// Create a scheduler using the configured history backend
    pub fn new(config: RunnerConfig) -> Self {
        let history = History::from_config(&config);
        Self {
            config: Arc::new(config),
            history: Arc::new(history),
            shutdown: ShutdownFlag::manual(),
        }
    }

    /// Use `shutdown` to observe interrupts
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_history(mut self, history: History) -> Self {
        self.history = Arc::new(history);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Find the fixtures selected by the configuration
    pub fn discover(&self) -> Result<Vec<Fixture>, TestError> {
        discovery::discover(&self.config)
    }

    /// Discover and run every selected fixture
    pub async fn run(&self) -> Result<RunReport, TestError> {
        let fixtures = self.discover()?;
        self.run_fixtures(fixtures).await
    }

    /// Run both phases over already discovered fixtures
    pub async fn run_fixtures(&self, mut fixtures: Vec<Fixture>) -> Result<RunReport, TestError> {
        let start = Instant::now();
        let run_root = tempfile::Builder::new().suffix("_testrunner").tempdir()?;
        let ctx = RunContext {
            config: Arc::clone(&self.config),
            history: Arc::clone(&self.history),
            shutdown: self.shutdown.clone(),
            run_root: run_root.path().to_path_buf(),
        };

        if self.config.reset_perf_base {
            self.reset_baselines(&mut fixtures).await;
        }

        let mut consistency_ran = false;
        if self.config.run_consistency() {
            self.consistency_phase(&mut fixtures, &ctx).await?;
            consistency_ran = true;
        }

        let interrupted = self.shutdown.should_stop();
        let consistency_failed = fixtures.iter().any(|f| f.consistency.status.is_failure());

        let mut performance_ran = false;
        if self.config.run_perf
            && !interrupted
            && (self.config.ignore_consistency || !consistency_failed)
        {
            self.performance_phase(&mut fixtures, &ctx).await;
            performance_ran = true;
        }

        Ok(RunReport::new(
            fixtures,
            consistency_ran,
            performance_ran,
            self.config.force_perf,
            self.shutdown.should_stop(),
            start.elapsed(),
        ))
    }

    /// Move every recorded baseline aside before any phase runs
    async fn reset_baselines(&self, fixtures: &mut [Fixture]) {
        for fixture in fixtures.iter_mut().filter(|f| f.has_perf_baseline) {
            let revision = self.history.revision(&fixture.dir).await;
            match fixture.baselines().rotate(RotationTag::Reset, &revision) {
                Ok(_) => {
                    fixture.has_perf_baseline = false;
                    println!("{} : performance baseline reset", fixture.name);
                }
                Err(e) => warn!("{}: {}", fixture.name, e),
            }
        }
    }

    async fn consistency_phase(
        &self,
        fixtures: &mut [Fixture],
        ctx: &RunContext,
    ) -> Result<(), TestError> {
        let selected: Vec<usize> = (0..fixtures.len())
            .filter(|&i| fixtures[i].is_consistency_test())
            .collect();

        if selected.is_empty() {
            println!("No Consistency Tests Available (or Specified).");
            return Ok(());
        }

        println!("\nRunning Consistency Tests:\n");
        let total = selected.len();
        let progress = self.progress_bar(total)?;
        let semaphore = Arc::new(Semaphore::new(self.config.jobs.max(1)));
        let mut handles = Vec::with_capacity(total);

        for (position, index) in selected.into_iter().enumerate() {
            if self.shutdown.should_stop() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            fixtures[index].consistency.status = TestStatus::Running;
            let fixture = Arc::new(fixtures[index].clone());
            let ctx = ctx.clone();
            let progress = progress.clone();
            debug!("Dispatching {}", fixture.name);
            if self.config.verbose {
                println!("[{:3} of {}] {}", position + 1, total, truncate(&fixture.name, 65));
            }
            progress.set_message(fixture.name.clone());

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = run_consistency(&fixture, &ctx).await;
                progress.inc(1);
                result
            });
            handles.push((index, handle));
        }

        // Barrier: every dispatched fixture reaches a terminal state
        let joined = join_all(handles.into_iter().map(|(index, handle)| async move {
            (index, handle.await)
        }))
        .await;

        for (index, outcome) in joined {
            fixtures[index].consistency = match outcome {
                Ok(result) => result,
                Err(e) => ConsistencyResult::with_status(TestStatus::Failed(format!(
                    "worker panicked: {}",
                    e
                ))),
            };
        }

        progress.finish_and_clear();
        Ok(())
    }

    async fn performance_phase(&self, fixtures: &mut [Fixture], ctx: &RunContext) {
        let selected: Vec<usize> = (0..fixtures.len())
            .filter(|&i| self.config.force_perf || fixtures[i].is_performance_test())
            .collect();

        if selected.is_empty() {
            println!("No Performance Tests Available (or Specified).");
            return;
        }

        println!("\nRunning Performance Tests:\n");
        let total = selected.len();
        for (position, index) in selected.into_iter().enumerate() {
            if self.shutdown.should_stop() {
                break;
            }

            println!("[{:3} of {}] {}", position + 1, total, truncate(&fixtures[index].name, 65));
            fixtures[index].performance.status = TestStatus::Running;
            let result = run_performance(&fixtures[index], ctx).await;
            fixtures[index].performance = result;
        }
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar, TestError> {
        if self.config.verbose {
            return Ok(ProgressBar::hidden());
        }

        let progress = ProgressBar::new(len as u64);
        progress.set_style(ProgressStyle::with_template("[{pos:>3} of {len}] {msg}")?);
        Ok(progress)
    }
}

fn truncate(name: &str, width: usize) -> &str {
    match name.char_indices().nth(width) {
        Some((at, _)) => &name[..at],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 65), "short");
        assert_eq!(truncate("abcdef", 3), "abc");
    }

    #[tokio::test]
    async fn test_empty_run() {
        let temp = tempfile::TempDir::new().unwrap();
        let scheduler = Scheduler::new(RunnerConfig::new(temp.path()));

        let report = scheduler.run().await.unwrap();
        assert!(report.fixtures.is_empty());
        assert!(report.consistency_ran);
        assert!(!report.performance_ran);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_before_dispatch_leaves_fixtures_pending() {
        let temp = tempfile::TempDir::new().unwrap();
        let app = temp.path().join("app");
        std::fs::write(&app, "").unwrap();
        std::fs::create_dir_all(temp.path().join("tests").join("one").join("config")).unwrap();

        let mut config = RunnerConfig::new(temp.path().join("tests"));
        config.default_app = Some(app);
        config.run_perf = true;

        let shutdown = ShutdownFlag::manual();
        shutdown.trigger();
        let report = Scheduler::new(config).with_shutdown(shutdown).run().await.unwrap();

        assert!(report.interrupted);
        assert!(!report.performance_ran);
        assert_eq!(report.fixtures[0].consistency.status, TestStatus::Pending);
        assert_eq!(report.fixtures[0].consistency.status.to_string(), "not run");
    }
}
