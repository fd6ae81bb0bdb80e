//! Fixture discovery and per-fixture result state

use glob::Pattern;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::baseline::{BaselineStore, Evaluation};
use crate::comparison::Mismatch;
use crate::config::RunnerConfig;
use crate::descriptor::Descriptor;
use crate::execution::ExitOutcome;
use crate::ini::Vars;
use crate::TestError;

/// Input files copied into every run directory
pub const CONFIG_DIR: &str = "config";
/// Recorded expected output
pub const EXPECTED_DIR: &str = "expected";

/// Lifecycle state of one test phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum TestStatus {
    /// Not dispatched (yet)
    Pending,
    Running,
    Skipped(String),
    Passed(String),
    Failed(String),
}

impl TestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped(_) | Self::Passed(_) | Self::Failed(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("not run"),
            Self::Running => f.write_str("running"),
            Self::Skipped(reason) if reason.is_empty() => f.write_str("skipped"),
            Self::Skipped(reason) => write!(f, "skipped ({})", reason),
            Self::Passed(message) | Self::Failed(message) => f.write_str(message),
        }
    }
}

/// Outcome of the consistency phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyResult {
    pub status: TestStatus,
    /// How the application exited, if it ran
    pub exit: Option<ExitOutcome>,
    pub problems: Vec<Mismatch>,
    pub duration: Duration,
    /// Whether this run recorded new expected results
    pub generated_expectations: bool,
}

impl Default for ConsistencyResult {
    fn default() -> Self {
        Self::with_status(TestStatus::Pending)
    }
}

impl ConsistencyResult {
    pub fn with_status(status: TestStatus) -> Self {
        Self {
            status,
            exit: None,
            problems: Vec::new(),
            duration: Duration::ZERO,
            generated_expectations: false,
        }
    }
}

/// Outcome of the performance phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceResult {
    pub status: TestStatus,
    pub evaluation: Option<Evaluation>,
    pub duration: Duration,
}

impl Default for PerformanceResult {
    fn default() -> Self {
        Self::with_status(TestStatus::Pending)
    }
}

impl PerformanceResult {
    pub fn with_status(status: TestStatus) -> Self {
        Self { status, evaluation: None, duration: Duration::ZERO }
    }
}

/// A discovered test directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    /// Directory name, unique within the test directory
    pub name: String,
    pub dir: PathBuf,
    pub descriptor: Descriptor,
    pub has_expected: bool,
    pub has_perf_baseline: bool,
    pub consistency: ConsistencyResult,
    pub performance: PerformanceResult,
}

impl Fixture {
    /// Load a fixture and parse its `test_list`
    pub fn load(name: &str, dir: &Path, vars: &Vars) -> Result<Self, TestError> {
        let descriptor = Descriptor::parse(dir, vars)?;
        let expected = dir.join(EXPECTED_DIR);

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            descriptor,
            has_expected: expected.is_dir(),
            has_perf_baseline: BaselineStore::new(dir).exists(),
            consistency: ConsistencyResult::default(),
            performance: PerformanceResult::default(),
        })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dir.join(CONFIG_DIR)
    }

    pub fn expected_dir(&self) -> PathBuf {
        self.dir.join(EXPECTED_DIR)
    }

    pub fn baselines(&self) -> BaselineStore {
        BaselineStore::new(&self.dir)
    }

    pub fn is_consistency_test(&self) -> bool {
        self.descriptor.consistency_enabled
    }

    pub fn is_performance_test(&self) -> bool {
        self.descriptor.performance_enabled
    }

    /// One-line listing: `*` marks missing expected results, `c`/`p` the
    /// enabled test kinds
    pub fn describe(&self) -> String {
        format!(
            "{} {} {} {}",
            if self.has_expected { "  " } else { " *" },
            if self.is_consistency_test() { "c" } else { " " },
            if self.is_performance_test() { "p" } else { " " },
            self.name
        )
    }
}

/// Find every fixture under the configured test directory, sorted by name
pub fn discover(config: &RunnerConfig) -> Result<Vec<Fixture>, TestError> {
    let patterns = config
        .globs
        .iter()
        .map(|glob| {
            Pattern::new(glob)
                .map_err(|e| TestError::Config(format!("Invalid test pattern '{}': {}", glob, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let entries = fs::read_dir(&config.testdir).map_err(|e| {
        TestError::Config(format!(
            "Unable to read test directory {}: {}",
            config.testdir.display(),
            e
        ))
    })?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();

    let ignored_prefixes: &[char] = if patterns.is_empty() { &['.', '_'] } else { &['.'] };
    let vars = config.interpolation_vars();
    let mut fixtures = Vec::new();

    for name in names {
        if name.starts_with(ignored_prefixes) {
            continue;
        }
        if !patterns.is_empty() && !patterns.iter().any(|p| p.matches(&name)) {
            continue;
        }

        let dir = config.testdir.join(&name);
        if !dir.is_dir() || !dir.join(CONFIG_DIR).is_dir() {
            debug!("Skipping {}: no {} directory", name, CONFIG_DIR);
            continue;
        }

        fixtures.push(Fixture::load(&name, &dir, &vars)?);
    }

    Ok(fixtures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(names: &[&str]) -> (TempDir, RunnerConfig) {
        let temp = TempDir::new().unwrap();
        let app = temp.path().join("app.sh");
        fs::write(&app, "#!/bin/sh\n").unwrap();

        for name in names {
            fs::create_dir_all(temp.path().join(name).join(CONFIG_DIR)).unwrap();
        }

        let mut config = RunnerConfig::new(temp.path());
        config.default_app = Some(app);
        (temp, config)
    }

    fn names(fixtures: &[Fixture]) -> Vec<&str> {
        fixtures.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_discovery_sorted_and_filtered() {
        let (temp, config) = setup(&["zeta", "alpha", "_disabled", ".hidden", "mid"]);
        fs::create_dir_all(temp.path().join("no_config").join("expected")).unwrap();
        fs::write(temp.path().join("notes.txt"), "not a fixture").unwrap();

        let fixtures = discover(&config).unwrap();
        assert_eq!(names(&fixtures), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_globs_select_fixtures() {
        let (_temp, mut config) = setup(&["run_a", "run_b", "other", "_run_c", ".run_d"]);

        config.globs = vec!["run_*".to_string()];
        assert_eq!(names(&discover(&config).unwrap()), vec!["run_a", "run_b"]);

        // Underscore entries are reachable by name, hidden entries never are
        config.globs = vec!["*run_*".to_string()];
        assert_eq!(names(&discover(&config).unwrap()), vec!["_run_c", "run_a", "run_b"]);
    }

    #[test]
    fn test_invalid_glob_is_config_error() {
        let (_temp, mut config) = setup(&["a"]);
        config.globs = vec!["[".to_string()];
        assert!(matches!(discover(&config), Err(TestError::Config(_))));
    }

    #[test]
    fn test_fixture_flags_and_describe() {
        let (temp, config) = setup(&["recorded", "fresh"]);
        fs::create_dir_all(temp.path().join("recorded").join(EXPECTED_DIR)).unwrap();
        fs::create_dir_all(temp.path().join("recorded").join("perf~")).unwrap();
        fs::write(temp.path().join("recorded").join("perf~").join("baseline"), "1,1,1,1,1,1,1,1\n")
            .unwrap();

        let fixtures = discover(&config).unwrap();
        let fresh = &fixtures[0];
        let recorded = &fixtures[1];

        assert!(!fresh.has_expected);
        assert!(!fresh.has_perf_baseline);
        assert!(recorded.has_expected);
        assert!(recorded.has_perf_baseline);
        assert_eq!(fresh.consistency.status, TestStatus::Pending);

        assert_eq!(fresh.describe(), " * c   fresh");
        assert_eq!(recorded.describe(), "   c   recorded");
    }

    #[test]
    fn test_broken_test_list_aborts_discovery() {
        let (temp, config) = setup(&["broken"]);
        fs::write(temp.path().join("broken").join("test_list"), "[main]\napp = /nonexistent\n")
            .unwrap();

        assert!(matches!(discover(&config), Err(TestError::Config(_))));
    }

    #[test]
    fn test_missing_testdir_is_config_error() {
        let config = RunnerConfig::new("/nonexistent/testdir");
        assert!(matches!(discover(&config), Err(TestError::Config(_))));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TestStatus::Pending.to_string(), "not run");
        assert_eq!(TestStatus::Skipped(String::new()).to_string(), "skipped");
        assert_eq!(TestStatus::Skipped("long".into()).to_string(), "skipped (long)");
        assert_eq!(TestStatus::Passed("passed".into()).to_string(), "passed");
        assert!(TestStatus::Failed("failed".into()).is_failure());
        assert!(!TestStatus::Running.is_terminal());
    }
}
