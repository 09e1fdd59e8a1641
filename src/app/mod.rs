mod data_io;
mod extract;
mod fetch;
mod pool;
mod runtime;
mod server;
mod types;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runtime::{RunEnd, execute};
use types::{AuditConfig, AuditError, Cli};

const EXIT_DIRTY: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,sitemap_audit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Where the one-line run summary goes.
#[derive(Debug, PartialEq, Eq)]
enum Summary {
    Stdout(String),
    Stderr(String),
    Silent,
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let config = match AuditConfig::from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("sitemap audit could not start: {err}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let (code, summary) = finish(&config, execute(&config).await);
    match summary {
        Summary::Stdout(line) => println!("{line}"),
        Summary::Stderr(line) => eprintln!("{line}"),
        Summary::Silent => {}
    }
    ExitCode::from(code)
}

fn finish(config: &AuditConfig, result: Result<RunEnd, AuditError>) -> (u8, Summary) {
    match result {
        Ok(RunEnd::Finished(report)) if report.is_clean() => (
            0,
            Summary::Stdout(format!(
                "sitemap audit passed: {} pages and {} assets reachable at {}",
                report.pages_checked, report.assets_checked, report.base
            )),
        ),
        Ok(RunEnd::Finished(report)) => (
            EXIT_DIRTY,
            Summary::Stderr(format!(
                "sitemap audit failed: {} failures ({} pages, {} assets) out of {} pages and {} assets checked, see {}",
                report.failure_count(),
                report.page_failures.len(),
                report.asset_failures.len(),
                report.pages_checked,
                report.assets_checked,
                config.report_path.display()
            )),
        ),
        Ok(RunEnd::Interrupted) => (EXIT_INTERRUPTED, Summary::Silent),
        Err(err) => (
            EXIT_FATAL,
            Summary::Stderr(format!("sitemap audit aborted: {err}")),
        ),
    }
}
