use std::collections::HashSet;

use chrono::Utc;
use url::Url;

use super::data_io::write_report;
use super::extract::{LinkExtractor, extractor_for, is_same_origin, path_and_query};
use super::fetch::{Fetcher, wait_until_ready};
use super::pool::run_pool;
use super::server::{AttachedServer, SpawnedServer, TargetServer};
use super::types::{AuditConfig, AuditError, AuditFailure, AuditReport, FetchOutcome, RequestMethod};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuditStage {
    WaitingForReady,
    FetchingSitemap,
    CheckingPages,
    ExtractingAssets,
    CheckingAssets,
    WritingReport,
}

impl AuditStage {
    pub fn label(self) -> &'static str {
        match self {
            AuditStage::WaitingForReady => "waiting_for_ready",
            AuditStage::FetchingSitemap => "fetching_sitemap",
            AuditStage::CheckingPages => "checking_pages",
            AuditStage::ExtractingAssets => "extracting_assets",
            AuditStage::CheckingAssets => "checking_assets",
            AuditStage::WritingReport => "writing_report",
        }
    }
}

fn enter(stage: AuditStage) {
    tracing::info!(stage = stage.label(), "audit stage");
}

#[derive(Debug)]
pub enum RunEnd {
    Finished(AuditReport),
    Interrupted,
}

/// Full run: build check, target lifecycle, audit, and shutdown on SIGINT/SIGTERM.
pub async fn execute(config: &AuditConfig) -> Result<RunEnd, AuditError> {
    if let Some(dir) = &config.build_dir {
        if !dir.exists() {
            return Err(AuditError::MissingBuild(dir.clone()));
        }
    }

    let fetcher = Fetcher::new(config.timeout)?;
    let extractor = extractor_for(config.extractor);
    let mut server: Box<dyn TargetServer> = match &config.server_cmd {
        Some(cmd) => Box::new(SpawnedServer::new(cmd.clone())),
        None => Box::new(AttachedServer),
    };
    server.start()?;

    let result = tokio::select! {
        audited = run_audit(config, &fetcher, extractor.as_ref(), || server.check_alive()) => {
            audited.map(RunEnd::Finished)
        }
        _ = shutdown_signal() => {
            tracing::warn!("interrupted, stopping target server");
            Ok(RunEnd::Interrupted)
        }
    };

    server.stop();
    result
}

/// Readiness, sitemap, page pass, asset pass, then the report. Only setup
/// failures return `Err`; broken pages and assets end up in the report.
pub async fn run_audit(
    config: &AuditConfig,
    fetcher: &Fetcher,
    extractor: &dyn LinkExtractor,
    check_alive: impl FnMut() -> Result<(), AuditError>,
) -> Result<AuditReport, AuditError> {
    enter(AuditStage::WaitingForReady);
    let ready_url = config.endpoint(&config.ready_path)?;
    wait_until_ready(
        fetcher,
        &ready_url,
        config.ready_timeout,
        config.ready_interval,
        check_alive,
    )
    .await?;

    enter(AuditStage::FetchingSitemap);
    let mut pages = fetch_sitemap(config, fetcher, extractor).await?;
    if let Some(limit) = config.sample_limit {
        pages.truncate(limit);
    }
    tracing::info!(pages = pages.len(), "sitemap parsed");

    enter(AuditStage::CheckingPages);
    let page_results = check_urls(fetcher, pages, RequestMethod::Get, config.concurrency).await;

    enter(AuditStage::ExtractingAssets);
    let assets = collect_assets(&page_results, &config.base_url, extractor);
    tracing::info!(assets = assets.len(), "assets discovered");

    enter(AuditStage::CheckingAssets);
    let asset_results = check_urls(fetcher, assets, RequestMethod::Head, config.concurrency).await;

    enter(AuditStage::WritingReport);
    let report = build_report(&config.base_url, &page_results, &asset_results);
    write_report(&config.report_path, &report)?;
    Ok(report)
}

async fn fetch_sitemap(
    config: &AuditConfig,
    fetcher: &Fetcher,
    extractor: &dyn LinkExtractor,
) -> Result<Vec<Url>, AuditError> {
    let sitemap_url = config.endpoint(&config.sitemap_path)?;
    let outcome = fetcher.fetch_text(sitemap_url).await;
    let body = match (outcome.ok, outcome.body) {
        (true, Some(body)) => body,
        (true, None) => String::new(),
        (false, _) => {
            return Err(AuditError::SitemapUnavailable {
                url: outcome.url.to_string(),
                status: outcome.status,
                error: outcome.error,
            });
        }
    };
    Ok(extractor.sitemap_urls(&body, &config.base_url))
}

async fn check_urls(
    fetcher: &Fetcher,
    urls: Vec<Url>,
    method: RequestMethod,
    concurrency: usize,
) -> Vec<FetchOutcome> {
    let fetcher = fetcher.clone();
    let results = check_each(urls, concurrency, move |url| {
        let fetcher = fetcher.clone();
        async move { fetcher.fetch(url, method).await }
    })
    .await;

    for failed in results.iter().filter(|outcome| !outcome.ok) {
        tracing::warn!(
            url = %failed.url,
            status = failed.status,
            error = failed.error.as_deref().unwrap_or(""),
            method = method.label(),
            "check failed"
        );
    }
    results
}

/// One outcome per URL, even when a check panics or is cancelled.
async fn check_each<F, Fut>(urls: Vec<Url>, concurrency: usize, check: F) -> Vec<FetchOutcome>
where
    F: Fn(Url) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome> + Send + 'static,
{
    run_pool(urls, concurrency, move |url: Url| {
        let checked = tokio::spawn(check(url.clone()));
        async move {
            match checked.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => {
                    FetchOutcome::transport_failure(url, format!("panicked: {err}"))
                }
                Err(err) => FetchOutcome::transport_failure(url, format!("cancelled: {err}")),
            }
        }
    })
    .await
}

/// Same-origin assets of every page that loaded as HTML, deduplicated across pages.
fn collect_assets(pages: &[FetchOutcome], base: &Url, extractor: &dyn LinkExtractor) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for page in pages {
        let Some(html) = page.html() else {
            continue;
        };
        for asset in extractor.asset_urls(html, &page.url) {
            if is_same_origin(&asset, base) && seen.insert(asset.as_str().to_string()) {
                out.push(asset);
            }
        }
    }
    out
}

fn build_report(base: &Url, pages: &[FetchOutcome], assets: &[FetchOutcome]) -> AuditReport {
    AuditReport {
        base: base.origin().ascii_serialization(),
        generated_at: Utc::now().to_rfc3339(),
        pages_checked: pages.len(),
        assets_checked: assets.len(),
        page_failures: failures(pages),
        asset_failures: failures(assets),
    }
}

fn failures(outcomes: &[FetchOutcome]) -> Vec<AuditFailure> {
    let mut out = outcomes
        .iter()
        .filter(|outcome| !outcome.ok)
        .map(|outcome| AuditFailure {
            path: path_and_query(&outcome.url),
            status: outcome.status,
            error: outcome.error.clone(),
        })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
