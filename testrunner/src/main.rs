//! Main binary for running fixture regression tests

use clap::Parser;
use log::{debug, LevelFilter};
use std::process;

use testrunner::{
    descriptor::sample_test_list, Cli, RunnerConfig, Scheduler, ShutdownFlag, TestError,
};

/// Exit code for configuration errors
const CONFIG_ERROR_EXIT: i32 = 255;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match RunnerConfig::resolve(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(CONFIG_ERROR_EXIT);
        }
    };

    if cli.help_test_cfg {
        println!("{}", sample_test_list(&config.interpolation_vars()));
        return;
    }

    debug!("Resolved configuration: {:?}", config);
    let scheduler = Scheduler::new(config).with_shutdown(ShutdownFlag::new());

    let fixtures = match scheduler.discover() {
        Ok(fixtures) => fixtures,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(exit_code_for(&e));
        }
    };

    println!("Reading Test Configurations:");
    for fixture in &fixtures {
        println!("{}", fixture.describe());
    }

    if cli.list_tests {
        return;
    }

    let report = match scheduler.run_fixtures(fixtures).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Test execution failed: {}", e);
            process::exit(exit_code_for(&e));
        }
    };

    report.print();

    if let Some(path) = &cli.xml_report {
        if let Err(e) = report.write_xml(path) {
            eprintln!("Unable to write XML report {}: {}", path.display(), e);
        }
    }

    if let Some(path) = &cli.json_report {
        if let Err(e) = report.write_json(path) {
            eprintln!("Unable to write JSON report {}: {}", path.display(), e);
        }
    }

    process::exit(report.exit_code());
}

fn init_logging(verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn exit_code_for(error: &TestError) -> i32 {
    match error {
        TestError::Config(_) => CONFIG_ERROR_EXIT,
        _ => 1,
    }
}
