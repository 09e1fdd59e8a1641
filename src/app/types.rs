use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use url::Url;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "sitemap-audit",
    version,
    about = "Crawl a site's sitemap and verify every page and same-origin asset is reachable"
)]
pub struct Cli {
    #[arg(long, env = "AUDIT_BASE_URL", default_value = "http://127.0.0.1:3000")]
    pub base_url: String,

    #[arg(
        long,
        env = "AUDIT_CONCURRENCY",
        value_name = "N",
        default_value_t = 20,
        allow_negative_numbers = true
    )]
    pub concurrency: i64,

    #[arg(long, env = "AUDIT_TIMEOUT_MS", value_name = "MS", default_value_t = 15000)]
    pub timeout_ms: u64,

    #[arg(long, env = "AUDIT_SAMPLE_LIMIT", value_name = "N")]
    pub sample_limit: Option<usize>,

    #[arg(long, env = "AUDIT_READY_PATH", default_value = "/")]
    pub ready_path: String,

    #[arg(
        long,
        env = "AUDIT_READY_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 60000
    )]
    pub ready_timeout_ms: u64,

    #[arg(
        long,
        env = "AUDIT_READY_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 500
    )]
    pub ready_interval_ms: u64,

    #[arg(long, env = "AUDIT_SITEMAP_PATH", default_value = "/sitemap.xml")]
    pub sitemap_path: String,

    #[arg(
        long = "report",
        env = "AUDIT_REPORT_PATH",
        value_name = "FILE",
        default_value = "reports/audit-sitemap.json"
    )]
    pub report_path: PathBuf,

    /// Shell command that starts the site; omit to audit a server that is already running.
    #[arg(long, env = "AUDIT_SERVER_CMD", value_name = "CMD")]
    pub server_cmd: Option<String>,

    /// Build output that must exist before the server is started.
    #[arg(long, env = "AUDIT_BUILD_DIR", value_name = "PATH")]
    pub build_dir: Option<PathBuf>,

    #[arg(long, env = "AUDIT_EXTRACTOR", value_enum, default_value_t = ExtractorKind::Scan)]
    pub extractor: ExtractorKind,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum ExtractorKind {
    Scan,
    Dom,
}

/// Immutable run configuration, built once from the CLI and passed down by reference.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub base_url: Url,
    pub concurrency: usize,
    pub timeout: Duration,
    pub sample_limit: Option<usize>,
    pub ready_path: String,
    pub ready_timeout: Duration,
    pub ready_interval: Duration,
    pub sitemap_path: String,
    pub report_path: PathBuf,
    pub server_cmd: Option<String>,
    pub build_dir: Option<PathBuf>,
    pub extractor: ExtractorKind,
}

impl AuditConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, AuditError> {
        let base_url = Url::parse(cli.base_url.trim()).map_err(|source| {
            AuditError::InvalidBaseUrl {
                url: cli.base_url.clone(),
                source,
            }
        })?;

        if cli.concurrency < 1 {
            tracing::warn!(requested = cli.concurrency, "concurrency below 1, using 1");
        }

        Ok(Self {
            base_url,
            concurrency: sanitize_concurrency(cli.concurrency),
            timeout: Duration::from_millis(cli.timeout_ms.max(1)),
            sample_limit: cli.sample_limit.filter(|limit| *limit > 0),
            ready_path: cli.ready_path,
            ready_timeout: Duration::from_millis(cli.ready_timeout_ms),
            ready_interval: Duration::from_millis(cli.ready_interval_ms.max(10)),
            sitemap_path: cli.sitemap_path,
            report_path: cli.report_path,
            server_cmd: cli.server_cmd.filter(|cmd| !cmd.trim().is_empty()),
            build_dir: cli.build_dir,
            extractor: cli.extractor,
        })
    }

    /// Resolve a site-relative path such as `/sitemap.xml` against the audited origin.
    pub fn endpoint(&self, path: &str) -> Result<Url, AuditError> {
        self.base_url
            .join(path)
            .map_err(|source| AuditError::InvalidBaseUrl {
                url: format!("{}{path}", self.base_url),
                source,
            })
    }
}

/// Values below 1 become 1. There is no upper cap.
pub fn sanitize_concurrency(value: i64) -> usize {
    usize::try_from(value.max(1)).unwrap_or(usize::MAX)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Head,
}

impl RequestMethod {
    pub fn label(self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Head => "HEAD",
        }
    }
}

/// Result of one fetch. `status` is 0 when no response was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub url: Url,
    pub status: u16,
    pub ok: bool,
    pub body: Option<String>,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn response(url: Url, status: u16, body: Option<String>) -> Self {
        Self {
            url,
            status,
            ok: is_ok_status(status),
            body,
            error: None,
        }
    }

    pub fn transport_failure(url: Url, error: impl Into<String>) -> Self {
        Self {
            url,
            status: 0,
            ok: false,
            body: None,
            error: Some(error.into()),
        }
    }

    pub fn html(&self) -> Option<&str> {
        if self.ok { self.body.as_deref() } else { None }
    }
}

pub fn is_ok_status(status: u16) -> bool {
    (200..400).contains(&status)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditFailure {
    pub path: String,
    pub status: u16,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub base: String,
    pub generated_at: String,
    pub pages_checked: usize,
    pub assets_checked: usize,
    pub page_failures: Vec<AuditFailure>,
    pub asset_failures: Vec<AuditFailure>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.page_failures.is_empty() && self.asset_failures.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.page_failures.len() + self.asset_failures.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("invalid base url {url}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("build output not found at {}", .0.display())]
    MissingBuild(PathBuf),

    #[error("failed to start target server: {0}")]
    ServerSpawn(String),

    #[error("server at {url} not ready after {}ms", .waited.as_millis())]
    ServerNotReady { url: String, waited: Duration },

    #[error("sitemap {url} unavailable: {}", sitemap_reason(.status, .error))]
    SitemapUnavailable {
        url: String,
        status: u16,
        error: Option<String>,
    },

    #[error("failed to build http client: {0}")]
    ClientBuild(#[from] reqwest::Error),

    #[error("failed to write report {}: {source}", .path.display())]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn sitemap_reason(status: &u16, error: &Option<String>) -> String {
    match error {
        Some(err) => err.clone(),
        None => format!("http {status}"),
    }
}
