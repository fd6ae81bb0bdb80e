//! Performance baseline statistics and persistence
//!
//! A baseline is one line of eight comma-separated values stored at
//! `<fixture>/perf~/baseline`: min, max, mean and median of user time,
//! followed by the same four values of wall time. Superseded baselines are
//! moved aside, never overwritten.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::TestError;

/// Per-fixture performance directory
pub const PERF_DIR: &str = "perf~";
/// Baseline file name inside `perf~`
pub const PERF_BASE: &str = "baseline";

/// Timings of one application run, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// User time consumed by the child process
    pub user: f64,
    pub wall: f64,
}

/// Reduction of one timing series
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimingStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl TimingStats {
    /// Reduce a series; `None` if it is empty
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let median = median(samples)?;
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;

        Some(Self { min, max, mean, median })
    }
}

/// Middle value of the sorted series, or the mean of the two middle values
pub fn median(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Persisted performance baseline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub user: TimingStats,
    pub wall: TimingStats,
}

impl BaselineRecord {
    /// Parse a record line; only the first line of the file is read
    pub fn parse(content: &str) -> Result<Self, TestError> {
        let line = content.lines().next().unwrap_or("");
        let values = line
            .split(',')
            .map(|field| field.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TestError::BaselineIo(format!("malformed baseline '{}': {}", line, e)))?;

        if values.len() < 8 {
            return Err(TestError::BaselineIo(format!(
                "malformed baseline '{}': expected 8 values, found {}",
                line,
                values.len()
            )));
        }

        let stats = |at: usize| TimingStats {
            min: values[at],
            max: values[at + 1],
            mean: values[at + 2],
            median: values[at + 3],
        };
        Ok(Self { user: stats(0), wall: stats(4) })
    }

    /// Serialized record line, newline terminated
    pub fn to_line(&self) -> String {
        format!(
            "{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}\n",
            self.user.min,
            self.user.max,
            self.user.mean,
            self.user.median,
            self.wall.min,
            self.wall.max,
            self.wall.mean,
            self.wall.median
        )
    }
}

/// Performance decision against the stored baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// No baseline was recorded yet
    NewBaseline,
    /// Slower than the baseline plus its margin
    Exceeded,
    /// Faster than the baseline minus its margin in both series
    Improved,
    Pass,
}

impl Verdict {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Exceeded)
    }
}

/// Outcome of evaluating a fixture's timing samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Statistics of this run
    pub record: BaselineRecord,
    /// Baseline the run was judged against
    pub prior: Option<BaselineRecord>,
    /// Whether the result is written back to the baseline store
    pub save: bool,
}

impl Evaluation {
    /// Whether the baseline store must be updated
    pub fn updates_baseline(&self) -> bool {
        self.save && matches!(self.verdict, Verdict::NewBaseline | Verdict::Improved)
    }

    /// Whether the current baseline must be moved aside first
    pub fn rotates_baseline(&self) -> bool {
        self.save && self.verdict == Verdict::Improved
    }

    /// Result text shown for the fixture
    pub fn message(&self) -> String {
        let Some(prior) = &self.prior else {
            let prefix = if self.save { "new" } else { "*unsaved*" };
            return format!(
                "{} baseline - wall time: {:3.4} user time: {:3.4}",
                prefix, self.record.wall.min, self.record.user.min
            );
        };

        let head = match self.verdict {
            Verdict::Exceeded => "failed",
            Verdict::Improved => "improved",
            _ => "passed",
        };
        format!(
            "{}\n - wall: {:2.2}  base = {:3.4}  test = {:3.4}\n - user: {:2.2}  base = {:3.4}  test = {:3.4}",
            head,
            ratio(self.record.wall.min, prior.wall.min),
            prior.wall.min,
            self.record.wall.min,
            ratio(self.record.user.min, prior.user.min),
            prior.user.min,
            self.record.user.min
        )
    }
}

fn ratio(test: f64, base: f64) -> f64 {
    if base > 0.0 {
        test / base
    } else {
        0.0
    }
}

/// Judge timing samples against the prior baseline.
///
/// The decision uses the minimum of each series. A run fails when either
/// minimum exceeds its baseline by more than the margin, and improves only
/// when both fall below their lower bands.
pub fn evaluate(
    samples: &[Sample],
    prior: Option<&BaselineRecord>,
    user_margin: f64,
    wall_margin: f64,
    save: bool,
) -> Option<Evaluation> {
    let user: Vec<f64> = samples.iter().map(|s| s.user).collect();
    let wall: Vec<f64> = samples.iter().map(|s| s.wall).collect();
    let record = BaselineRecord {
        user: TimingStats::from_samples(&user)?,
        wall: TimingStats::from_samples(&wall)?,
    };

    let verdict = match prior {
        None => Verdict::NewBaseline,
        Some(prior) => {
            let user_band = user_margin * prior.user.min;
            let wall_band = wall_margin * prior.wall.min;

            if record.user.min > prior.user.min + user_band
                || record.wall.min > prior.wall.min + wall_band
            {
                Verdict::Exceeded
            } else if record.user.min < prior.user.min - user_band
                && record.wall.min < prior.wall.min - wall_band
            {
                Verdict::Improved
            } else {
                Verdict::Pass
            }
        }
    };

    Some(Evaluation { verdict, record, prior: prior.copied(), save })
}

/// Why a baseline is moved aside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTag {
    /// Superseded by an improved run
    Prev,
    /// Cleared by `--reset-perf-base`
    Reset,
}

impl fmt::Display for RotationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prev => "prev",
            Self::Reset => "reset",
        })
    }
}

/// Baseline files of one fixture
#[derive(Debug, Clone)]
pub struct BaselineStore {
    dir: PathBuf,
}

impl BaselineStore {
    pub fn new(fixture_dir: &Path) -> Self {
        Self { dir: fixture_dir.join(PERF_DIR) }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(PERF_BASE)
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir() && self.path().is_file()
    }

    /// Load the current baseline, `None` if none was recorded
    pub fn load(&self) -> Result<Option<BaselineRecord>, TestError> {
        if !self.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(self.path()).map_err(|e| {
            TestError::BaselineIo(format!("failed to read {}: {}", self.path().display(), e))
        })?;
        BaselineRecord::parse(&content).map(Some)
    }

    /// Write `record` as the current baseline
    pub fn write(&self, record: &BaselineRecord) -> Result<(), TestError> {
        if self.dir.exists() && !self.dir.is_dir() {
            return Err(TestError::BaselineIo(
                "unable to write out baseline, file exists".to_string(),
            ));
        }

        fs::create_dir_all(&self.dir)
            .and_then(|_| fs::write(self.path(), record.to_line()))
            .map_err(|e| {
                TestError::BaselineIo(format!("error occurred writing baseline results: {}", e))
            })
    }

    /// Move the current baseline to `perf-<timestamp>-<tag>-<revision>`
    pub fn rotate(&self, tag: RotationTag, revision: &str) -> Result<PathBuf, TestError> {
        let stamp = chrono::Local::now().format("%Y-%m-%d-%H.%M.%S");
        let name = format!("perf-{}-{}-{}", stamp, tag, revision);

        let mut target = self.dir.join(&name);
        let mut attempt = 1;
        while target.exists() {
            target = self.dir.join(format!("{}.{}", name, attempt));
            attempt += 1;
        }

        fs::rename(self.path(), &target).map_err(|e| {
            TestError::BaselineIo(format!("error rotating {}: {}", self.path().display(), e))
        })?;
        Ok(target)
    }
}
