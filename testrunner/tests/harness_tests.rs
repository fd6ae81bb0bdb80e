//! End-to-end harness tests
//!
//! Fixtures are driven by small shell scripts, so these only run on unix.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use testrunner::{Mode, RunnerConfig, Scheduler, ShutdownFlag, TestStatus};

/// Write an executable shell script
fn script(path: &Path, body: &str) -> PathBuf {
    fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

/// Create `tests/<name>/config` with the given inputs and `test_list`
fn fixture(testdir: &Path, name: &str, inputs: &[(&str, &str)], test_list: &str) -> PathBuf {
    let dir = testdir.join(name);
    fs::create_dir_all(dir.join("config")).unwrap();
    for (file, content) in inputs {
        fs::write(dir.join("config").join(file), content).unwrap();
    }
    if !test_list.is_empty() {
        fs::write(dir.join("test_list"), test_list).unwrap();
    }
    dir
}

fn setup(app_body: &str) -> (TempDir, RunnerConfig) {
    let temp = TempDir::new().unwrap();
    let app = script(&temp.path().join("app.sh"), app_body);
    let testdir = temp.path().join("tests");
    fs::create_dir_all(&testdir).unwrap();

    let mut config = RunnerConfig::new(&testdir);
    config.default_app = Some(app);
    config.jobs = 2;
    (temp, config)
}

#[tokio::test]
async fn test_record_then_compare() {
    let (temp, config) = setup("cat input.txt > output.txt\necho done > log.txt");
    let dir = fixture(&temp.path().join("tests"), "echo", &[("input.txt", "42\n")], "");

    let report = Scheduler::new(config.clone()).run().await.unwrap();
    assert_eq!(
        report.fixtures[0].consistency.status,
        TestStatus::Passed("new expected results generated".into())
    );
    assert!(report.fixtures[0].consistency.generated_expectations);
    assert_eq!(fs::read_to_string(dir.join("expected").join("output.txt")).unwrap(), "42\n");
    assert!(dir.join("expected").join("log.txt").is_file());
    assert!(!dir.join("expected").join("input.txt").exists());

    let mut slave = config.clone();
    slave.mode = Mode::Slave;
    let report = Scheduler::new(slave).run().await.unwrap();
    assert_eq!(report.fixtures[0].consistency.status, TestStatus::Passed("passed".into()));
    assert_eq!(report.summary_line(), "All tests passed.");
    assert_eq!(report.exit_code(), 0);

    fs::write(dir.join("expected").join("output.txt"), "41\n").unwrap();
    let report = Scheduler::new(config).run().await.unwrap();
    let result = &report.fixtures[0].consistency;
    assert_eq!(result.status, TestStatus::Failed("failed".into()));
    assert_eq!(result.problems.len(), 1);
    assert_eq!(result.problems[0].path, "output.txt");
    assert_eq!(report.summary_line(), "1 of 1 tests failed.");
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_slave_without_expected_is_skipped() {
    let (temp, mut config) = setup("echo out > output.txt");
    let dir = fixture(&temp.path().join("tests"), "fresh", &[], "");
    config.mode = Mode::Slave;

    let report = Scheduler::new(config).run().await.unwrap();
    assert_eq!(
        report.fixtures[0].consistency.status,
        TestStatus::Skipped("no expected results".into())
    );
    assert!(!dir.join("expected").exists());
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_nonzero_exit_disallowed() {
    let (temp, config) = setup("exit 3");
    let testdir = temp.path().join("tests");
    fixture(&testdir, "strict", &[], "");
    fixture(&testdir, "lenient", &[], "[main]\nnonzeroexit = allow\n");
    fixture(&testdir, "inverted", &[], "[main]\nnonzeroexit = require\n");

    let report = Scheduler::new(config).run().await.unwrap();
    let status = |name: &str| {
        let fixture = report.fixtures.iter().find(|f| f.name == name).unwrap();
        fixture.consistency.clone()
    };

    let strict = status("strict");
    assert_eq!(strict.status, TestStatus::Failed("failed".into()));
    assert_eq!(strict.exit.unwrap().code, Some(3));
    assert!(strict.problems.is_empty());

    assert!(!status("lenient").status.is_failure());
    assert!(!status("inverted").status.is_failure());
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_long_and_disabled_fixtures() {
    let (temp, config) = setup("true");
    let testdir = temp.path().join("tests");
    fixture(&testdir, "long", &[], "[consistency]\nlong = yes\n");
    fixture(&testdir, "off", &[], "[consistency]\nenabled = no\n");

    let report = Scheduler::new(config.clone()).run().await.unwrap();
    assert_eq!(report.fixtures[0].consistency.status, TestStatus::Skipped("long".into()));
    assert_eq!(report.consistency_counts().total(), 1);

    let mut long = config;
    long.long_tests = true;
    let report = Scheduler::new(long).run().await.unwrap();
    assert!(matches!(report.fixtures[0].consistency.status, TestStatus::Passed(_)));
}

#[tokio::test]
async fn test_concurrency_bounded_by_jobs() {
    let temp = TempDir::new().unwrap();
    let markers = temp.path().join("markers");
    fs::create_dir_all(&markers).unwrap();
    let app = script(
        &temp.path().join("app.sh"),
        "touch \"$1/running.$$\"\n\
         ls \"$1\" | grep -c running > \"$1/count.$$\"\n\
         sleep 1\n\
         rm \"$1/running.$$\"",
    );

    let testdir = temp.path().join("tests");
    let test_list = format!("[main]\nargs = '{}'\n", markers.display());
    for i in 0..10 {
        fixture(&testdir, &format!("fixture{:02}", i), &[], &test_list);
    }

    let mut config = RunnerConfig::new(&testdir);
    config.default_app = Some(app);
    config.jobs = 4;

    let report = Scheduler::new(config).run().await.unwrap();
    assert_eq!(report.fixtures.len(), 10);
    assert!(report.fixtures.iter().all(|f| f.consistency.status.is_terminal()));

    let counts: Vec<usize> = fs::read_dir(&markers)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.file_name().unwrap().to_string_lossy().starts_with("count."))
        .map(|path| fs::read_to_string(path).unwrap().trim().parse().unwrap())
        .collect();

    assert_eq!(counts.len(), 10);
    let max = counts.iter().copied().max().unwrap();
    assert!(max >= 1 && max <= 4, "observed {} concurrent runs", max);
}

#[tokio::test]
async fn test_performance_baseline_and_reset() {
    let (temp, mut config) = setup("echo perf > output.txt");
    let dir = fixture(&temp.path().join("tests"), "timed", &[], "[performance]\nenabled = yes\n");
    config.run_perf = true;
    config.repeat = 2;

    let report = Scheduler::new(config.clone()).run().await.unwrap();
    assert!(report.consistency_ran);
    assert!(report.performance_ran);
    let perf = &report.fixtures[0].performance;
    assert!(perf.status.to_string().starts_with("new baseline - wall time: "));
    assert!(perf.evaluation.is_some());
    assert!(dir.join("perf~").join("baseline").is_file());

    config.reset_perf_base = true;
    let report = Scheduler::new(config).run().await.unwrap();
    assert!(report.fixtures[0].performance.status.to_string().starts_with("new baseline"));

    let rotated: Vec<String> = fs::read_dir(dir.join("perf~"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("perf-"))
        .collect();
    assert_eq!(rotated.len(), 1);
    assert!(rotated[0].ends_with("-reset-exported"), "unexpected name {}", rotated[0]);
    assert!(dir.join("perf~").join("baseline").is_file());
}

#[tokio::test]
async fn test_performance_skipped_after_consistency_failure() {
    let (temp, mut config) = setup("exit 1");
    fixture(&temp.path().join("tests"), "broken", &[], "[performance]\nenabled = yes\n");
    config.run_perf = true;
    config.repeat = 1;

    let report = Scheduler::new(config.clone()).run().await.unwrap();
    assert!(report.consistency_ran);
    assert!(!report.performance_ran);
    assert_eq!(report.fixtures[0].performance.status, TestStatus::Pending);

    config.ignore_consistency = true;
    let report = Scheduler::new(config).run().await.unwrap();
    assert!(!report.consistency_ran);
    assert!(report.performance_ran);
    assert_eq!(
        report.fixtures[0].performance.status,
        TestStatus::Failed("test app returned non-zero exit code".into())
    );
}

#[tokio::test]
async fn test_skip_tests_only_skips_recorded_fixtures() {
    let (temp, mut config) = setup("echo new > output.txt");
    let testdir = temp.path().join("tests");
    let recorded = fixture(&testdir, "recorded", &[], "[performance]\nenabled = yes\n");
    fs::create_dir_all(recorded.join("expected")).unwrap();
    fs::write(recorded.join("expected").join("output.txt"), "old\n").unwrap();
    fs::create_dir_all(recorded.join("perf~")).unwrap();
    fs::write(recorded.join("perf~").join("baseline"), "1,1,1,1,1,1,1,1\n").unwrap();
    let fresh = fixture(&testdir, "fresh", &[], "");

    config.skip_tests = true;
    config.run_perf = true;
    config.repeat = 1;
    let report = Scheduler::new(config).run().await.unwrap();

    let fresh_result = &report.fixtures[0];
    let recorded_result = &report.fixtures[1];
    assert_eq!(
        fresh_result.consistency.status,
        TestStatus::Passed("new expected results generated".into())
    );
    assert_eq!(fs::read_to_string(fresh.join("expected").join("output.txt")).unwrap(), "new\n");

    assert_eq!(recorded_result.consistency.status, TestStatus::Skipped(String::new()));
    assert_eq!(recorded_result.consistency.status.to_string(), "skipped");
    assert!(recorded_result.consistency.exit.is_none());
    assert_eq!(
        fs::read_to_string(recorded.join("expected").join("output.txt")).unwrap(),
        "old\n"
    );

    assert!(report.performance_ran);
    assert_eq!(recorded_result.performance.status, TestStatus::Skipped(String::new()));
    assert_eq!(
        fs::read_to_string(recorded.join("perf~").join("baseline")).unwrap(),
        "1,1,1,1,1,1,1,1\n"
    );
}

#[tokio::test]
async fn test_reset_expected_rerecords() {
    let (temp, mut config) = setup("echo new > output.txt");
    let dir = fixture(&temp.path().join("tests"), "reset", &[], "");
    fs::create_dir_all(dir.join("expected")).unwrap();
    fs::write(dir.join("expected").join("output.txt"), "old\n").unwrap();
    fs::write(dir.join("expected").join("stale.txt"), "gone\n").unwrap();

    config.reset_expected = true;
    let report = Scheduler::new(config).run().await.unwrap();

    let result = &report.fixtures[0].consistency;
    assert_eq!(result.status, TestStatus::Passed("new expected results generated".into()));
    assert!(result.generated_expectations);
    assert!(!dir.join("expected").join("stale.txt").exists());
    assert_eq!(fs::read_to_string(dir.join("expected").join("output.txt")).unwrap(), "new\n");
}

#[tokio::test]
async fn test_interrupt_kills_running_fixtures() {
    let temp = TempDir::new().unwrap();
    let markers = temp.path().join("markers");
    fs::create_dir_all(&markers).unwrap();
    let app = script(&temp.path().join("app.sh"), "pwd > \"$1/cwd.$$\"\nexec sleep 30");

    let testdir = temp.path().join("tests");
    let test_list =
        format!("[main]\nargs = '{}'\n[performance]\nenabled = yes\n", markers.display());
    for name in ["a", "b", "c"] {
        fixture(&testdir, name, &[], &test_list);
    }

    let mut config = RunnerConfig::new(&testdir);
    config.default_app = Some(app);
    config.jobs = 2;
    config.run_perf = true;

    let shutdown = ShutdownFlag::manual();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.trigger();
    });

    let start = Instant::now();
    let report = Scheduler::new(config).with_shutdown(shutdown).run().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));

    assert!(report.interrupted);
    assert!(!report.performance_ran);
    let statuses: Vec<&TestStatus> =
        report.fixtures.iter().map(|f| &f.consistency.status).collect();
    assert_eq!(statuses[0], &TestStatus::Skipped("interrupted".into()));
    assert_eq!(statuses[1], &TestStatus::Skipped("interrupted".into()));
    assert_eq!(statuses[2], &TestStatus::Pending);
    assert!(report.fixtures.iter().all(|f| f.performance.status == TestStatus::Pending));
    assert!(report.summary_line().starts_with("Interrupted: 0 of 3 tests run"));
    assert_eq!(report.exit_code(), 0);

    // Every run directory the killed processes worked in is gone
    let run_dirs: Vec<PathBuf> = fs::read_dir(&markers)
        .unwrap()
        .map(|entry| PathBuf::from(fs::read_to_string(entry.unwrap().path()).unwrap().trim()))
        .collect();
    assert!(run_dirs.len() <= 2);
    for run_dir in run_dirs {
        assert!(!run_dir.exists(), "{} was left behind", run_dir.display());
        assert!(!run_dir.parent().unwrap().exists());
    }
}
