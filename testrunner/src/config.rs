//! Configuration and settings for the test runner
//!
//! Settings are layered once at startup: built-in defaults, then the
//! global `testrunner.cfg`, then command line overrides. The resulting
//! `RunnerConfig` is shared read-only by every component.

use clap::{Parser, ValueEnum};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::descriptor::absolute;
use crate::ini::{IniFile, Vars};
use crate::TestError;

/// Default name of the global settings file
pub const SETTINGS_FILE: &str = "testrunner.cfg";
/// Test directory used when neither the settings file nor the command line names one
pub const DEFAULT_TESTDIR: &str = "tests";

/// Run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Mode {
    /// Developer machine; new expected results may be recorded
    Local,
    /// Build slave; fixtures without expected results are skipped
    Slave,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Slave => "slave",
        }
    }
}

/// Version control system tracking the fixtures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum HistoryKind {
    None,
    Git,
    Svn,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Git => "git",
            Self::Svn => "svn",
        }
    }
}

/// Command line interface
#[derive(Debug, Clone, Parser)]
#[command(name = "testrunner", version)]
#[command(about = "Consistency and performance regression test runner")]
pub struct Cli {
    /// Fixture name patterns to run (shell-style globs)
    #[arg(value_name = "TEST")]
    pub globs: Vec<String>,

    /// Set the path to the build directory
    #[arg(long, value_name = "DIR")]
    pub builddir: Option<String>,

    /// Global settings file [default: ./testrunner.cfg]
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Maximum expected file size, in bytes, for a full line diff
    #[arg(long, value_name = "BYTES")]
    pub diff_max_threshold: Option<u64>,

    /// Force active tests to be treated as performance tests
    #[arg(short, long)]
    pub force_perf: bool,

    /// Display a sample test configuration file
    #[arg(long)]
    pub help_test_cfg: bool,

    /// Run performance tests without the consistency phase; results are not saved
    #[arg(long)]
    pub ignore_consistency: bool,

    /// Number of concurrent consistency tests [default: available processors]
    #[arg(short = 'j', value_name = "N", allow_negative_numbers = true)]
    pub jobs: Option<i64>,

    /// Display a list of all tests
    #[arg(short, long)]
    pub list_tests: bool,

    /// Run tests that have been marked as 'long' running
    #[arg(long)]
    pub long_tests: bool,

    /// Set the test runner mode
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Set the version control system in use
    #[arg(long, value_enum)]
    pub scm: Option<HistoryKind>,

    /// Reset expected results for all tests run
    #[arg(long)]
    pub reset_expected: bool,

    /// Reset the performance baseline for all tests
    #[arg(long)]
    pub reset_perf_base: bool,

    /// Run available performance tests
    #[arg(short = 'p', long = "run-perf-tests")]
    pub run_perf: bool,

    /// Show full file diff for failed consistency tests
    #[arg(long)]
    pub show_diff: bool,

    /// Do not run tests, only generate new results where applicable
    #[arg(long)]
    pub skip_tests: bool,

    /// Git command
    #[arg(short = 'g', long, value_name = "PATH")]
    pub git: Option<String>,

    /// Subversion command
    #[arg(short = 's', long, value_name = "PATH")]
    pub svn: Option<String>,

    /// Svnversion command
    #[arg(long, value_name = "PATH")]
    pub svnversion: Option<String>,

    /// Subversion metadata directory name
    #[arg(long, value_name = "NAME")]
    pub svnmetadir: Option<String>,

    /// Set the path to the test directory
    #[arg(long, value_name = "DIR")]
    pub testdir: Option<PathBuf>,

    /// Enable verbose output, showing all test output
    #[arg(short, long)]
    pub verbose: bool,

    /// Write a JUnit-style XML report
    #[arg(long, value_name = "PATH")]
    pub xml_report: Option<PathBuf>,

    /// Write a JSON report of all results
    #[arg(long, value_name = "PATH")]
    pub json_report: Option<PathBuf>,
}

/// Resolved settings for one run
#[derive(Debug, Clone, Serialize)]
pub struct RunnerConfig {
    /// Directory containing the fixtures
    pub testdir: PathBuf,
    pub builddir: String,
    /// Application used by fixtures that do not name their own
    pub default_app: Option<PathBuf>,
    pub mode: Mode,
    pub scm: HistoryKind,
    pub git: String,
    /// Directory the git commands run in, relative to the fixture tree
    pub git_submodule: String,
    pub svn: String,
    pub svnversion: String,
    pub svnmetadir: String,
    /// Maximum number of concurrent consistency tests, at least 1
    pub jobs: usize,
    pub user_margin: f64,
    pub wall_margin: f64,
    /// Repetitions per performance test
    pub repeat: usize,
    pub diff_max_threshold: u64,
    /// File names never compared or recorded as expectations
    pub expected_ignore: Vec<String>,
    pub long_tests: bool,
    pub skip_tests: bool,
    pub reset_expected: bool,
    pub reset_perf_base: bool,
    pub run_perf: bool,
    pub force_perf: bool,
    pub ignore_consistency: bool,
    pub show_diff: bool,
    pub verbose: bool,
    /// Fixture name filters
    pub globs: Vec<String>,
}

impl RunnerConfig {
    /// Create a configuration with the built-in defaults
    pub fn new(testdir: impl Into<PathBuf>) -> Self {
        Self {
            testdir: testdir.into(),
            builddir: "build".to_string(),
            default_app: None,
            mode: Mode::Local,
            scm: HistoryKind::None,
            git: "git".to_string(),
            git_submodule: String::new(),
            svn: "svn".to_string(),
            svnversion: "svnversion".to_string(),
            svnmetadir: ".svn".to_string(),
            jobs: default_jobs(),
            user_margin: 0.05,
            wall_margin: 0.05,
            repeat: 5,
            diff_max_threshold: 1536,
            expected_ignore: vec![".gitignore".to_string()],
            long_tests: false,
            skip_tests: false,
            reset_expected: false,
            reset_perf_base: false,
            run_perf: false,
            force_perf: false,
            ignore_consistency: false,
            show_diff: false,
            verbose: false,
            globs: Vec::new(),
        }
    }

    /// Layer the settings file and command line over the defaults
    pub fn resolve(cli: &Cli) -> Result<Self, TestError> {
        let ini = match &cli.config {
            Some(path) if !path.is_file() => {
                return Err(TestError::Config(format!(
                    "Settings file not found: {}",
                    path.display()
                )));
            }
            Some(path) => IniFile::load(path)?,
            None => IniFile::load(Path::new(SETTINGS_FILE))?,
        };

        let mut config = Self::new(DEFAULT_TESTDIR);
        config.apply_settings(&ini)?;
        config.apply_cli(cli);

        let vars = config.interpolation_vars();
        let testdir = cli
            .testdir
            .clone()
            .or_else(|| setting(&ini, "main", "testdir", &vars).map(PathBuf::from))
            .or_else(|| setting(&ini, "testrunner", "testdir", &vars).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TESTDIR));
        config.testdir = absolute(&testdir.to_string_lossy())?;

        let vars = config.interpolation_vars();
        config.default_app = match setting(&ini, "main", "app", &vars) {
            Some(app) if !app.is_empty() => Some(absolute(&app)?),
            _ => {
                warn!("No default app configured");
                None
            }
        };

        Ok(config)
    }

    fn apply_settings(&mut self, ini: &IniFile) -> Result<(), TestError> {
        let vars = self.interpolation_vars();
        let get = |section: &str, key: &str, default: &str| ini.get_or(section, key, &vars, default);

        self.builddir = get("testrunner", "builddir", &self.builddir);
        self.mode = parse_enum(&get("testrunner", "mode", self.mode.as_str()), "mode")?;
        self.scm = parse_enum(&get("testrunner", "scm", self.scm.as_str()), "SCM")?;
        self.expected_ignore = get("testrunner", "expected_ignore", ".gitignore")
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        self.git = get("git", "cmd", &self.git);
        self.git_submodule = get("git", "submodule", &self.git_submodule);
        self.svn = get("svn", "cmd", &self.svn);
        self.svnversion = get("svn", "svnversion", &self.svnversion);
        self.svnmetadir = get("svn", "metadir", &self.svnmetadir);

        self.user_margin = parse_number(&get("performance", "usermargin", "0.05"), "usermargin")?;
        self.wall_margin = parse_number(&get("performance", "wallmargin", "0.05"), "wallmargin")?;
        self.repeat = parse_number::<usize>(&get("performance", "repeat", "5"), "repeat")?.max(1);

        Ok(())
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(builddir) = &cli.builddir {
            self.builddir = builddir.clone();
        }
        if let Some(threshold) = cli.diff_max_threshold {
            self.diff_max_threshold = threshold;
        }
        if let Some(jobs) = cli.jobs {
            self.jobs = jobs.max(1) as usize;
        }
        if let Some(mode) = cli.mode {
            self.mode = mode;
        }
        if let Some(scm) = cli.scm {
            self.scm = scm;
        }
        if let Some(git) = &cli.git {
            self.git = git.clone();
        }
        if let Some(svn) = &cli.svn {
            self.svn = svn.clone();
        }
        if let Some(svnversion) = &cli.svnversion {
            self.svnversion = svnversion.clone();
        }
        if let Some(svnmetadir) = &cli.svnmetadir {
            self.svnmetadir = svnmetadir.clone();
        }

        self.force_perf = cli.force_perf;
        self.ignore_consistency = cli.ignore_consistency;
        self.long_tests = cli.long_tests;
        self.reset_expected = cli.reset_expected;
        self.reset_perf_base = cli.reset_perf_base;
        self.run_perf = cli.run_perf;
        self.show_diff = cli.show_diff;
        self.skip_tests = cli.skip_tests;
        self.verbose = cli.verbose;
        self.globs = cli.globs.clone();
    }

    /// Variables available to `%(name)s` in every settings value
    pub fn interpolation_vars(&self) -> Vars {
        let default_app = self
            .default_app
            .as_ref()
            .map(|app| app.to_string_lossy().to_string())
            .unwrap_or_default();

        [
            ("builddir", self.builddir.clone()),
            ("default_app", default_app),
            ("mode", self.mode.as_str().to_string()),
            ("scm", self.scm.as_str().to_string()),
            ("git", self.git.clone()),
            ("git_submodule", self.git_submodule.clone()),
            ("svn", self.svn.clone()),
            ("svnversion", self.svnversion.clone()),
            ("svnmetadir", self.svnmetadir.clone()),
            ("testdir", self.testdir.to_string_lossy().to_string()),
            ("perf_user_margin", self.user_margin.to_string()),
            ("perf_wall_margin", self.wall_margin.to_string()),
            ("perf_repeat", self.repeat.to_string()),
            ("cpus", self.jobs.to_string()),
            ("diff-max-threshold", self.diff_max_threshold.to_string()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }

    /// Whether the consistency phase runs at all
    pub fn run_consistency(&self) -> bool {
        !self.run_perf || !self.ignore_consistency
    }

    /// Whether performance results may be written back to the baselines
    pub fn save_perf_results(&self) -> bool {
        !self.ignore_consistency
    }
}

/// Number of available processors
pub fn default_jobs() -> usize {
    std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1)
}

fn setting(ini: &IniFile, section: &str, key: &str, vars: &Vars) -> Option<String> {
    match ini.get(section, key, vars) {
        Ok(value) => value,
        Err(e) => {
            warn!("[{}] {}: {}", section, key, e);
            None
        }
    }
}

fn parse_enum<T: ValueEnum>(value: &str, what: &str) -> Result<T, TestError> {
    T::from_str(value.trim(), true)
        .map_err(|_| TestError::Config(format!("Unsupported {} '{}'", what, value)))
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, TestError> {
    value
        .trim()
        .parse()
        .map_err(|_| TestError::Config(format!("Invalid {} value '{}'", what, value)))
}
