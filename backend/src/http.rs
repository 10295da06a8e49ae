//! HTTP client for a single remote datastore instance.

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::WriteError;

/// Forwarded on every fanned-out query so operators can tell proxy traffic
/// from direct client traffic in the remote's logs.
const QUERY_ORIGIN_HEADER: &str = "Query-Origin";
const QUERY_ORIGIN_PARALLEL: &str = "Parallel";

/// Options for a single remote endpoint.
#[derive(Debug, Clone)]
pub struct HttpBackendOptions {
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub check_interval: Duration,
}

/// A single remote's write/query client with a background health probe.
///
/// `active` starts true and is flipped by the probe; writers skip the remote
/// entirely while it is inactive and spill straight to the backlog.
#[derive(Debug)]
pub struct HttpBackend {
    pub name: String,
    pub url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    active: AtomicBool,
    health_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HttpBackend {
    /// Create the client and start its health probe.
    pub fn new(opts: HttpBackendOptions) -> Arc<Self> {
        let backend = Arc::new(Self::new_simple(opts.clone()));
        let task = tokio::spawn(health_loop(Arc::downgrade(&backend), opts.check_interval));
        *backend.health_task.lock() = Some(task);
        backend
    }

    /// A client without a health probe; used by the transfer service to talk
    /// to backends that are being removed from a circle.
    pub fn new_simple(opts: HttpBackendOptions) -> Self {
        let client = reqwest::Client::builder()
            .timeout(opts.write_timeout)
            .pool_idle_timeout(opts.idle_timeout)
            .build()
            .expect("reqwest client construction cannot fail with these options");
        Self {
            name: opts.name,
            url: opts.url.trim_end_matches('/').to_string(),
            username: opts.username,
            password: opts.password,
            client,
            active: AtomicBool::new(true),
            health_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Stop the health probe.
    pub fn close(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
    }

    fn credentials(&self) -> Vec<(&str, &str)> {
        if self.username.is_empty() && self.password.is_empty() {
            Vec::new()
        } else {
            vec![("u", self.username.as_str()), ("p", self.password.as_str())]
        }
    }

    /// POST a raw line-protocol batch to `db`.
    ///
    /// 2xx maps to success; 400 and 404 are poison-pill rejections the
    /// caller must not retry; everything else is transient.
    pub async fn write_uncompressed(&self, db: &str, payload: Bytes) -> Result<(), WriteError> {
        let resp = self
            .client
            .post(format!("{}/write", self.url))
            .query(&[("db", db)])
            .query(&self.credentials())
            .body(payload)
            .send()
            .await
            .map_err(|e| WriteError::Transient(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::BAD_REQUEST => Err(WriteError::BadRequest),
            StatusCode::NOT_FOUND => Err(WriteError::NotFound),
            s => Err(WriteError::Transient(format!("status {s}"))),
        }
    }

    /// Forward an InfluxQL query and return the response body. The request
    /// is tagged with `Query-Origin: Parallel`; gzip-encoded responses are
    /// decompressed by the client.
    pub async fn query(&self, method: Method, params: &[(String, String)]) -> QueryResult {
        let url = format!("{}/query", self.url);
        let req = if method == Method::POST {
            self.client.post(url).form(params)
        } else {
            self.client.get(url).query(params)
        };
        let result = req
            .query(&self.credentials())
            .header(QUERY_ORIGIN_HEADER, QUERY_ORIGIN_PARALLEL)
            .send()
            .await;
        match result {
            Ok(resp) => {
                let status = resp.status();
                match resp.bytes().await {
                    Ok(body) => QueryResult {
                        status,
                        body,
                        err: None,
                    },
                    Err(e) => QueryResult::error(e.to_string()),
                }
            }
            Err(e) => QueryResult::error(e.to_string()),
        }
    }

    /// Cheap liveness probe.
    pub async fn ping(&self) -> bool {
        match self
            .client
            .get(format!("{}/ping", self.url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// `SHOW DATABASES` against this remote.
    pub async fn get_databases(&self) -> Result<Vec<String>, WriteError> {
        self.show_values(&[("q".to_string(), "SHOW DATABASES".to_string())])
            .await
    }

    /// `SHOW MEASUREMENTS` on `db` against this remote.
    pub async fn get_measurements(&self, db: &str) -> Result<Vec<String>, WriteError> {
        self.show_values(&[
            ("db".to_string(), db.to_string()),
            ("q".to_string(), "SHOW MEASUREMENTS".to_string()),
        ])
        .await
    }

    async fn show_values(&self, params: &[(String, String)]) -> Result<Vec<String>, WriteError> {
        let result = self.query(Method::GET, params).await;
        if let Some(err) = result.err {
            return Err(WriteError::Transient(err));
        }
        if !result.status.is_success() {
            return Err(WriteError::Transient(format!("status {}", result.status)));
        }
        let parsed: ShowResponse = serde_json::from_slice(&result.body)
            .map_err(|e| WriteError::Transient(format!("invalid SHOW response: {e}")))?;
        let mut names = Vec::new();
        for result in parsed.results {
            for series in result.series.unwrap_or_default() {
                for row in series.values.unwrap_or_default() {
                    if let Some(serde_json::Value::String(name)) = row.into_iter().next() {
                        // Internal databases are not routable data.
                        if name != "_internal" {
                            names.push(name);
                        }
                    }
                }
            }
        }
        Ok(names)
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Outcome of one fanned-out query.
#[derive(Debug)]
pub struct QueryResult {
    pub status: StatusCode,
    pub body: Bytes,
    pub err: Option<String>,
}

impl QueryResult {
    fn error(msg: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: Bytes::new(),
            err: Some(msg),
        }
    }
}

async fn health_loop(backend: Weak<HttpBackend>, check_interval: Duration) {
    let mut tick = tokio::time::interval(check_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(backend) = backend.upgrade() else {
            return;
        };
        let up = backend.ping().await;
        let was = backend.is_active();
        backend.set_active(up);
        if up != was {
            if up {
                info!(name = %backend.name, url = %backend.url, "backend recovered");
            } else {
                warn!(name = %backend.name, url = %backend.url, "backend unreachable");
            }
        } else {
            debug!(name = %backend.name, active = up, "health probe");
        }
    }
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    #[serde(default)]
    results: Vec<ShowResult>,
}

#[derive(Debug, Deserialize)]
struct ShowResult {
    #[serde(default)]
    series: Option<Vec<ShowSeries>>,
}

#[derive(Debug, Deserialize)]
struct ShowSeries {
    #[serde(default)]
    values: Option<Vec<Vec<serde_json::Value>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn options(url: &str) -> HttpBackendOptions {
        HttpBackendOptions {
            name: "b0".to_string(),
            url: url.to_string(),
            username: String::new(),
            password: String::new(),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn write_maps_statuses_to_error_kinds() {
        let mut server = mockito::Server::new_async().await;

        let ok = server
            .mock("POST", "/write")
            .match_query(mockito::Matcher::UrlEncoded("db".into(), "db0".into()))
            .match_body("cpu v=1 1\n")
            .with_status(204)
            .create_async()
            .await;
        let backend = HttpBackend::new_simple(options(&server.url()));
        backend
            .write_uncompressed("db0", Bytes::from_static(b"cpu v=1 1\n"))
            .await
            .unwrap();
        ok.assert_async().await;

        server
            .mock("POST", "/write")
            .match_body("junk")
            .with_status(400)
            .create_async()
            .await;
        let err = backend
            .write_uncompressed("db0", Bytes::from_static(b"junk"))
            .await
            .unwrap_err();
        assert_matches!(err, WriteError::BadRequest);
        assert!(err.is_poison());

        server
            .mock("POST", "/write")
            .match_body("cpu v=3 3\n")
            .with_status(503)
            .create_async()
            .await;
        let err = backend
            .write_uncompressed("db0", Bytes::from_static(b"cpu v=3 3\n"))
            .await
            .unwrap_err();
        assert_matches!(err, WriteError::Transient(_));
        assert!(!err.is_poison());
    }

    #[tokio::test]
    async fn transport_failure_is_transient() {
        // Nothing listens on this port.
        let backend = HttpBackend::new_simple(options("http://127.0.0.1:1"));
        let err = backend
            .write_uncompressed("db0", Bytes::from_static(b"cpu v=1 1\n"))
            .await
            .unwrap_err();
        assert_matches!(err, WriteError::Transient(_));
    }

    #[tokio::test]
    async fn query_carries_the_parallel_origin_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/query")
            .match_header(QUERY_ORIGIN_HEADER, QUERY_ORIGIN_PARALLEL)
            .match_query(mockito::Matcher::UrlEncoded(
                "q".into(),
                "SHOW DATABASES".into(),
            ))
            .with_status(200)
            .with_body(r#"{"results":[]}"#)
            .create_async()
            .await;

        let backend = HttpBackend::new_simple(options(&server.url()));
        let result = backend
            .query(
                Method::GET,
                &[("q".to_string(), "SHOW DATABASES".to_string())],
            )
            .await;
        assert!(result.err.is_none());
        assert_eq!(result.body, Bytes::from_static(br#"{"results":[]}"#));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn show_measurements_parses_series_values() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/query")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"results":[{"statement_id":0,"series":[{"name":"measurements","columns":["name"],"values":[["cpu"],["mem"]]}]}]}"#,
            )
            .create_async()
            .await;

        let backend = HttpBackend::new_simple(options(&server.url()));
        let names = backend.get_measurements("db0").await.unwrap();
        assert_eq!(names, vec!["cpu", "mem"]);
    }

    #[tokio::test]
    async fn health_probe_flips_active() {
        let mut server = mockito::Server::new_async().await;
        // No /ping mock: the probe fails and the backend goes inactive.
        let opts = HttpBackendOptions {
            check_interval: Duration::from_millis(50),
            ..options(&server.url())
        };
        let backend = HttpBackend::new(opts);
        assert!(backend.is_active());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!backend.is_active());

        server
            .mock("GET", "/ping")
            .with_status(204)
            .create_async()
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(backend.is_active());
        backend.close();
    }
}
