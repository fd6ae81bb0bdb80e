//! Result lines, summary, XML and JSON reports
//!
//! The reporter only renders fixture states; every verdict was decided by
//! the phase that produced it.

use console::style;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use crate::discovery::{ConsistencyResult, Fixture, TestStatus};
use crate::TestError;

/// Highest exit code used for failures; 255 is reserved for configuration errors
pub const MAX_FAILURE_EXIT_CODE: usize = 254;

/// Outcome counts of one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounts {
    pub passed: usize,
    /// Skipped or never run
    pub disabled: usize,
    pub failed: usize,
}

impl PhaseCounts {
    fn from_statuses<'a>(statuses: impl Iterator<Item = &'a TestStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                TestStatus::Failed(_) => counts.failed += 1,
                TestStatus::Passed(_) => counts.passed += 1,
                _ => counts.disabled += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.passed + self.disabled + self.failed
    }

    fn merge(self, other: Self) -> Self {
        Self {
            passed: self.passed + other.passed,
            disabled: self.disabled + other.disabled,
            failed: self.failed + other.failed,
        }
    }
}

/// Complete results of one run
#[derive(Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub fixtures: Vec<Fixture>,
    pub consistency_ran: bool,
    pub performance_ran: bool,
    /// Every fixture was treated as a performance test
    pub force_perf: bool,
    /// The run was cut short by an interrupt
    pub interrupted: bool,
    pub duration: Duration,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RunReport {
    pub fn new(
        fixtures: Vec<Fixture>,
        consistency_ran: bool,
        performance_ran: bool,
        force_perf: bool,
        interrupted: bool,
        duration: Duration,
    ) -> Self {
        Self {
            fixtures,
            consistency_ran,
            performance_ran,
            force_perf,
            interrupted,
            duration,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn consistency_fixtures(&self) -> impl Iterator<Item = &Fixture> {
        self.fixtures.iter().filter(|f| f.is_consistency_test())
    }

    pub fn performance_fixtures(&self) -> impl Iterator<Item = &Fixture> {
        let force = self.force_perf;
        self.fixtures.iter().filter(move |f| force || f.is_performance_test())
    }

    pub fn consistency_counts(&self) -> PhaseCounts {
        if !self.consistency_ran {
            return PhaseCounts::default();
        }
        PhaseCounts::from_statuses(self.consistency_fixtures().map(|f| &f.consistency.status))
    }

    pub fn performance_counts(&self) -> PhaseCounts {
        if !self.performance_ran {
            return PhaseCounts::default();
        }
        PhaseCounts::from_statuses(self.performance_fixtures().map(|f| &f.performance.status))
    }

    pub fn totals(&self) -> PhaseCounts {
        self.consistency_counts().merge(self.performance_counts())
    }

    /// Process exit code: the number of failed tests, clamped
    pub fn exit_code(&self) -> i32 {
        self.totals().failed.min(MAX_FAILURE_EXIT_CODE) as i32
    }

    /// Final one-line verdict
    pub fn summary_line(&self) -> String {
        let totals = self.totals();
        if self.interrupted {
            format!(
                "Interrupted: {} of {} tests run ({} failed).",
                totals.passed + totals.failed,
                totals.total(),
                totals.failed
            )
        } else if totals.failed == 0 {
            "All tests passed.".to_string()
        } else if totals.disabled != 0 {
            format!(
                "{} of {} tests failed ({} disabled).",
                totals.failed,
                totals.total(),
                totals.disabled
            )
        } else {
            format!("{} of {} tests failed.", totals.failed, totals.total())
        }
    }

    /// Print every result line followed by the summary
    pub fn print(&self) {
        if self.consistency_ran {
            println!();
            for fixture in self.consistency_fixtures() {
                print_consistency(fixture);
            }
        }

        if self.performance_ran {
            println!();
            for fixture in self.performance_fixtures() {
                println!("{} : {}", fixture.name, styled(&fixture.performance.status));
            }
        }

        if self.interrupted {
            println!("\n{}", style("Interrupted... results are partial.").bold().yellow());
        }

        let summary = self.summary_line();
        if self.totals().failed != 0 {
            println!("\n{}", style(summary).bold().red());
        } else if self.interrupted {
            println!("\n{}", style(summary).bold().yellow());
        } else {
            println!("\n{}", style(summary).bold().green());
        }
    }

    /// JUnit-style XML report
    pub fn to_xml(&self) -> String {
        let totals = self.totals();
        let mut xml = String::new();

        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            xml,
            "<testsuites tests=\"{}\" failures=\"{}\" disabled=\"{}\" errors=\"0\" time=\"{:.3}\" name=\"AllTests\">",
            totals.total(),
            totals.failed,
            totals.disabled,
            self.duration.as_secs_f64()
        );

        // A skipped consistency phase contributes an empty suite
        let ran = self.consistency_ran;
        let cases = self.consistency_fixtures().filter(move |_| ran).map(|f| {
            (f.name.as_str(), &f.consistency.status, f.consistency.duration, consistency_message(&f.consistency))
        });
        write_suite(&mut xml, "ConsistencyTests", self.consistency_counts(), cases);

        if self.performance_ran {
            let cases = self.performance_fixtures().map(|f| {
                (f.name.as_str(), &f.performance.status, f.performance.duration, f.performance.status.to_string())
            });
            write_suite(&mut xml, "PerformanceTests", self.performance_counts(), cases);
        }

        xml.push_str("</testsuites>\n");
        xml
    }

    pub fn write_xml(&self, path: &Path) -> Result<(), TestError> {
        std::fs::write(path, self.to_xml())?;
        Ok(())
    }

    /// Export report as JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), TestError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

fn write_suite<'a>(
    xml: &mut String,
    name: &str,
    counts: PhaseCounts,
    cases: impl Iterator<Item = (&'a str, &'a TestStatus, Duration, String)>,
) {
    let cases: Vec<_> = cases.collect();
    let time: f64 = cases.iter().map(|(_, _, duration, _)| duration.as_secs_f64()).sum();

    let _ = writeln!(
        xml,
        "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" disabled=\"{}\" errors=\"0\" time=\"{:.3}\">",
        name,
        counts.total(),
        counts.failed,
        counts.disabled,
        time
    );

    for (case, status, duration, message) in cases {
        let run = if matches!(status, TestStatus::Passed(_) | TestStatus::Failed(_)) {
            "run"
        } else {
            "disabled"
        };
        let _ = write!(
            xml,
            "    <testcase name=\"{}\" status=\"{}\" time=\"{:.3}\" classname=\"{}\"",
            xml_escape(case),
            run,
            duration.as_secs_f64(),
            name
        );

        if status.is_failure() {
            xml.push_str(">\n");
            let _ = writeln!(xml, "      <failure message=\"{}\" type=\"\"/>", xml_escape(&message));
            xml.push_str("    </testcase>\n");
        } else {
            xml.push_str("/>\n");
        }
    }

    xml.push_str("  </testsuite>\n");
}

/// Detail lines explaining a consistency failure
pub fn failure_details(result: &ConsistencyResult) -> Vec<String> {
    if !result.problems.is_empty() {
        let mut lines = vec!["output variance(s):".to_string()];
        lines.extend(result.problems.iter().map(ToString::to_string));
        return lines;
    }

    let Some(exit) = &result.exit else { return Vec::new() };
    let mut lines = Vec::new();
    if let Some(code) = exit.code {
        lines.push(format!("exit code: {}", code));
    }
    if let Some(signal) = exit.signal {
        lines.push(format!("term signal: {}", signal));
    }
    lines
}

/// Full result text of a consistency run
pub fn consistency_message(result: &ConsistencyResult) -> String {
    let mut message = result.status.to_string();
    if result.status.is_failure() {
        for line in failure_details(result) {
            message.push('\n');
            message.push_str(&line);
        }
    }
    message
}

fn print_consistency(fixture: &Fixture) {
    let result = &fixture.consistency;
    println!("{} : {}", fixture.name, styled(&result.status));

    if result.status.is_failure() {
        println!();
        for line in failure_details(result) {
            println!("{}", line);
        }
        println!();
    }
}

fn styled(status: &TestStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        TestStatus::Passed(_) => style(text).green(),
        TestStatus::Failed(_) => style(text).red(),
        TestStatus::Skipped(_) | TestStatus::Pending => style(text).yellow(),
        TestStatus::Running => style(text).dim(),
    }
}

/// Escape a string for use in an XML attribute
pub fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '\n' => escaped.push_str("&#10;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
