//! Per-fixture `test_list` configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::ini::{is_true, IniFile, Vars};
use crate::TestError;

/// Name of the per-fixture settings file
pub const TEST_LIST: &str = "test_list";

/// How the application's exit code affects the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitPolicy {
    /// Non-zero exit codes are failures
    Disallow,
    /// Any exit code is acceptable
    Allow,
    /// Zero exit codes are failures, for testing application error checks
    Require,
}

impl ExitPolicy {
    /// Parse a `nonzeroexit` value; unknown values behave as `disallow`
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "allow" => Self::Allow,
            "require" => Self::Require,
            _ => Self::Disallow,
        }
    }

    /// Whether an exit with the given success flag violates this policy
    pub fn violated_by(&self, exited_successfully: bool) -> bool {
        match self {
            Self::Disallow => !exited_successfully,
            Self::Require => exited_successfully,
            Self::Allow => false,
        }
    }
}

impl fmt::Display for ExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disallow => "disallow",
            Self::Allow => "allow",
            Self::Require => "require",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot of a fixture's settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Absolute path of the application to run
    pub app: PathBuf,
    /// Argument string passed to the application
    pub args: String,
    pub exit_policy: ExitPolicy,
    pub consistency_enabled: bool,
    pub consistency_long: bool,
    pub performance_enabled: bool,
    pub performance_long: bool,
}

impl Descriptor {
    /// Parse `<fixture_dir>/test_list`, defaulting every missing key.
    ///
    /// `vars` holds the global settings available to `%(name)s`
    /// interpolation; `default_app` is used when `[main] app` is absent.
    pub fn parse(fixture_dir: &Path, vars: &Vars) -> Result<Self, TestError> {
        let ini = IniFile::load(&fixture_dir.join(TEST_LIST))?;
        let default_app = vars.get("default_app").map(String::as_str).unwrap_or("");

        let app = ini.get_or("main", "app", vars, default_app);
        if app.is_empty() {
            return Err(TestError::Config(format!(
                "No application configured for {}",
                fixture_dir.display()
            )));
        }

        let app = absolute(&app)?;
        if !app.exists() {
            return Err(TestError::Config(format!("Application ({}) not found", app.display())));
        }
        if !app.is_file() {
            return Err(TestError::Config(format!(
                "Application ({}) is not a file",
                app.display()
            )));
        }

        Ok(Self {
            app,
            args: ini.get_or("main", "args", vars, ""),
            exit_policy: ExitPolicy::parse(&ini.get_or("main", "nonzeroexit", vars, "disallow")),
            consistency_enabled: is_true(&ini.get_or("consistency", "enabled", vars, "yes")),
            consistency_long: is_true(&ini.get_or("consistency", "long", vars, "no")),
            performance_enabled: is_true(&ini.get_or("performance", "enabled", vars, "no"))
                && cfg!(unix),
            performance_long: is_true(&ini.get_or("performance", "long", vars, "no")),
        })
    }

    /// Split the argument string into an argv vector
    pub fn argv(&self) -> Result<Vec<String>, TestError> {
        shlex::split(&self.args).ok_or_else(|| {
            TestError::Setup(format!("Unable to parse application arguments: {}", self.args))
        })
    }
}

/// Resolve a path against the current directory
pub(crate) fn absolute(path: &str) -> Result<PathBuf, TestError> {
    let path = Path::new(path);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Sample `test_list` printed by `--help-test-cfg`
pub fn sample_test_list(vars: &Vars) -> String {
    let mut text = format!(";--- Begin Test Configuration File ({}) ---\n", TEST_LIST);
    text.push_str(
        "[main]
; Command line arguments to pass to the application
args =

app = %(default_app)s            ; Application path to test
nonzeroexit = disallow   ; Exit code handling (disallow, allow, or require)
                         ;  disallow - treat non-zero exit codes as failures
                         ;  allow - all exit codes are acceptable
                         ;  require - treat zero exit codes as failures, useful
                         ;            for creating tests for app error checking
createdby =              ; Who created the test
email =                  ; Email address for the test's creator

[consistency]
enabled = yes            ; Is this test a consistency test?
long = no                ; Is this test a long test?

[performance]
enabled = no             ; Is this test a performance test?
long = no                ; Is this test a long test?

; The following variables can be used in constructing setting values by calling
; them with %(variable_name)s.  For example see 'app' above.
;
",
    );
    for name in vars.keys() {
        text.push_str(&format!("; {}\n", name));
    }
    text.push_str(";--- End Test Configuration File ---");
    text
}
