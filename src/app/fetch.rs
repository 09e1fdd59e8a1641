use std::error::Error as _;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio::time::Instant;
use url::Url;

use super::types::{AuditError, FetchOutcome, RequestMethod};

const USER_AGENT: &str = concat!("sitemap-audit/", env!("CARGO_PKG_VERSION"));
const ACCEPT_ANY: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BodyPolicy {
    HtmlOnly,
    Always,
}

/// Single-shot HTTP checker. Cloning is cheap and shares the connection pool.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self, AuditError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_ANY));
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .build()?;
        Ok(Self { client })
    }

    /// Fetch `url` once. HEAD answered with 405 is retried as GET; nothing else is retried.
    pub async fn fetch(&self, url: Url, method: RequestMethod) -> FetchOutcome {
        match method {
            RequestMethod::Get => self.send(url, RequestMethod::Get, BodyPolicy::HtmlOnly).await,
            RequestMethod::Head => {
                let outcome = self.send(url, RequestMethod::Head, BodyPolicy::HtmlOnly).await;
                if outcome.status == StatusCode::METHOD_NOT_ALLOWED.as_u16() {
                    tracing::debug!(url = %outcome.url, "HEAD rejected, retrying with GET");
                    self.send(outcome.url, RequestMethod::Get, BodyPolicy::HtmlOnly)
                        .await
                } else {
                    outcome
                }
            }
        }
    }

    /// GET keeping the body whatever its content type, for documents such as the sitemap.
    pub async fn fetch_text(&self, url: Url) -> FetchOutcome {
        self.send(url, RequestMethod::Get, BodyPolicy::Always).await
    }

    async fn send(&self, url: Url, method: RequestMethod, policy: BodyPolicy) -> FetchOutcome {
        let request = match method {
            RequestMethod::Get => self.client.get(url.clone()),
            RequestMethod::Head => self.client.head(url.clone()),
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return transport_failure(url, method, err),
        };

        let status = response.status().as_u16();
        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false);

        let wants_body = match policy {
            BodyPolicy::HtmlOnly => is_html,
            BodyPolicy::Always => true,
        };
        let body = if method == RequestMethod::Get && wants_body {
            match response.text().await {
                Ok(text) => Some(text),
                Err(err) => return transport_failure(url, method, err),
            }
        } else {
            None
        };

        tracing::debug!(%url, method = method.label(), status, "fetched");
        FetchOutcome::response(url, status, body)
    }
}

fn transport_failure(url: Url, method: RequestMethod, err: reqwest::Error) -> FetchOutcome {
    let reason = if err.is_timeout() {
        "timeout".to_string()
    } else {
        describe_error(&err)
    };
    tracing::debug!(%url, method = method.label(), error = %reason, "request failed");
    FetchOutcome::transport_failure(url, reason)
}

fn describe_error(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message = format!("{message}: {inner}");
        source = inner.source();
    }
    message
}

/// Poll `url` with GET until it answers with a success status or `deadline` passes.
/// Connection errors are expected while the server is still binding and are not fatal.
/// `check_alive` runs before every attempt so a crashed target fails fast.
pub async fn wait_until_ready(
    fetcher: &Fetcher,
    url: &Url,
    deadline: Duration,
    interval: Duration,
    mut check_alive: impl FnMut() -> Result<(), AuditError>,
) -> Result<(), AuditError> {
    let started = Instant::now();
    loop {
        check_alive()?;
        let remaining = deadline.saturating_sub(started.elapsed());
        let attempt = fetcher.send(url.clone(), RequestMethod::Get, BodyPolicy::HtmlOnly);
        let Ok(outcome) = tokio::time::timeout(remaining, attempt).await else {
            return Err(AuditError::ServerNotReady {
                url: url.to_string(),
                waited: started.elapsed(),
            });
        };
        if outcome.ok {
            tracing::info!(%url, waited_ms = started.elapsed().as_millis() as u64, "target ready");
            return Ok(());
        }
        tracing::debug!(
            %url,
            status = outcome.status,
            error = outcome.error.as_deref().unwrap_or(""),
            "target not ready yet"
        );

        if started.elapsed() + interval > deadline {
            return Err(AuditError::ServerNotReady {
                url: url.to_string(),
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fetcher() -> Fetcher {
        Fetcher::new(Duration::from_secs(5)).unwrap()
    }

    fn url_for(server: &mockito::Server, path: &str) -> Url {
        Url::parse(&server.url()).unwrap().join(path).unwrap()
    }

    #[tokio::test]
    async fn head_405_falls_back_to_get() {
        let mut server = mockito::Server::new_async().await;
        let head = server
            .mock("HEAD", "/asset.js")
            .with_status(405)
            .create_async()
            .await;
        let get = server
            .mock("GET", "/asset.js")
            .with_status(200)
            .with_header("content-type", "application/javascript")
            .with_body("console.log(1)")
            .create_async()
            .await;

        let outcome = fetcher()
            .fetch(url_for(&server, "/asset.js"), RequestMethod::Head)
            .await;

        head.assert_async().await;
        get.assert_async().await;
        assert!(outcome.ok);
        assert_eq!(outcome.status, 200);
        assert!(outcome.body.is_none());
    }

    #[tokio::test]
    async fn other_head_errors_are_returned_as_is() {
        let mut server = mockito::Server::new_async().await;
        let _head = server
            .mock("HEAD", "/gone.png")
            .with_status(404)
            .create_async()
            .await;
        let get = server
            .mock("GET", "/gone.png")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let outcome = fetcher()
            .fetch(url_for(&server, "/gone.png"), RequestMethod::Head)
            .await;

        get.assert_async().await;
        assert!(!outcome.ok);
        assert_eq!(outcome.status, 404);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn get_keeps_body_only_for_html() {
        let mut server = mockito::Server::new_async().await;
        let _page = server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<img src=\"/a.png\">")
            .create_async()
            .await;
        let _json = server
            .mock("GET", "/data.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let fetcher = fetcher();
        let page = fetcher
            .fetch(url_for(&server, "/page"), RequestMethod::Get)
            .await;
        let data = fetcher
            .fetch(url_for(&server, "/data.json"), RequestMethod::Get)
            .await;

        assert_eq!(page.body.as_deref(), Some("<img src=\"/a.png\">"));
        assert!(data.body.is_none());
        assert!(data.ok);
    }

    #[tokio::test]
    async fn fetch_text_keeps_xml_bodies() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body("<urlset></urlset>")
            .create_async()
            .await;

        let outcome = fetcher().fetch_text(url_for(&server, "/sitemap.xml")).await;

        assert!(outcome.ok);
        assert_eq!(outcome.body.as_deref(), Some("<urlset></urlset>"));
    }

    #[tokio::test]
    async fn http_errors_are_data_not_transport_failures() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/broken")
            .with_status(500)
            .create_async()
            .await;

        let outcome = fetcher()
            .fetch(url_for(&server, "/broken"), RequestMethod::Get)
            .await;

        assert!(!outcome.ok);
        assert_eq!(outcome.status, 500);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn redirects_are_followed() {
        let mut server = mockito::Server::new_async().await;
        let _old = server
            .mock("GET", "/old")
            .with_status(301)
            .with_header("location", "/new")
            .create_async()
            .await;
        let _new = server
            .mock("GET", "/new")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<p>moved</p>")
            .create_async()
            .await;

        let outcome = fetcher()
            .fetch(url_for(&server, "/old"), RequestMethod::Get)
            .await;

        assert!(outcome.ok);
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.url.path(), "/old");
    }

    #[tokio::test]
    async fn stalled_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let fetcher = Fetcher::new(Duration::from_millis(200)).unwrap();
        let url = Url::parse(&format!("http://{addr}/slow")).unwrap();
        let outcome = fetcher.fetch(url, RequestMethod::Get).await;

        hold.abort();
        assert!(!outcome.ok);
        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn readiness_deadline_bounds_a_stalled_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let started = Instant::now();
        let err = wait_until_ready(
            &fetcher(),
            &url,
            Duration::from_millis(200),
            Duration::from_millis(10),
            || Ok(()),
        )
        .await
        .unwrap_err();

        hold.abort();
        assert!(matches!(err, AuditError::ServerNotReady { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let outcome = fetcher().fetch(url, RequestMethod::Head).await;

        assert!(!outcome.ok);
        assert_eq!(outcome.status, 0);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn readiness_succeeds_once_target_answers() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(200)
            .create_async()
            .await;

        let result = wait_until_ready(
            &fetcher(),
            &url_for(&server, "/"),
            Duration::from_secs(2),
            Duration::from_millis(20),
            || Ok(()),
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn readiness_gives_up_after_deadline() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let err = wait_until_ready(
            &fetcher(),
            &url_for(&server, "/health"),
            Duration::from_millis(150),
            Duration::from_millis(30),
            || Ok(()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AuditError::ServerNotReady { .. }));
    }

    #[tokio::test]
    async fn readiness_stops_when_target_exits() {
        let mut server = mockito::Server::new_async().await;
        let probe = server
            .mock("GET", "/")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let err = wait_until_ready(
            &fetcher(),
            &url_for(&server, "/"),
            Duration::from_secs(5),
            Duration::from_millis(20),
            || Err(AuditError::ServerSpawn("exited with status 1".to_string())),
        )
        .await
        .unwrap_err();

        probe.assert_async().await;
        assert!(matches!(err, AuditError::ServerSpawn(_)));
    }
}
