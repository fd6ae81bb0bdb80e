//! # TestRunner
//!
//! A regression harness for applications that read a working directory
//! and write their results back into it. Each fixture is a directory of
//! input files plus, optionally, a recorded tree of expected output files
//! and a performance baseline.
//!
//! ## Architecture
//!
//! The framework is organized into several modules:
//! - `config`: Global run settings (settings file + command line)
//! - `ini`: Settings file parser with `%(name)s` interpolation
//! - `descriptor`: Per-fixture `test_list` configuration
//! - `history`: Version control adapters used to track expectations
//! - `discovery`: Fixture discovery and per-fixture result state
//! - `comparison`: Expected/actual output tree comparison
//! - `baseline`: Performance baseline statistics and persistence
//! - `execution`: Run directories, process invocation and fixture runs
//! - `harness`: Phase scheduling under bounded concurrency
//! - `reporting`: Result lines, summary, XML and JSON reports
//! - `signal`: Interrupt handling

pub mod baseline;
pub mod comparison;
pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod execution;
pub mod harness;
pub mod history;
pub mod ini;
pub mod reporting;
pub mod signal;

pub use baseline::{BaselineRecord, Evaluation, TimingStats, Verdict};
pub use comparison::{Comparator, Comparison, Mismatch, MismatchReason};
pub use config::{Cli, Mode, RunnerConfig};
pub use descriptor::{Descriptor, ExitPolicy};
pub use discovery::{Fixture, TestStatus};
pub use harness::Scheduler;
pub use history::History;
pub use reporting::RunReport;
pub use signal::ShutdownFlag;

/// Current version of the test runner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Test runner errors
#[derive(thiserror::Error, Debug)]
pub enum TestError {
    /// Broken global or fixture configuration; aborts the whole run
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run directory could not be materialized
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Invocation failed: {0}")]
    Invocation(String),

    /// A baseline file could not be read, written or rotated
    #[error("Baseline I/O failed: {0}")]
    BaselineIo(String),

    #[error("History backend error: {0}")]
    History(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),
}
