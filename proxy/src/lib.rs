//! The proxy core: replica circles of backends, per-line write fan-out, and
//! InfluxQL query routing.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cipher;
mod config;
pub mod transfer;

pub use config::{
    BackendConfig, CircleConfig, ConfigError, MqttConfig, ProxyConfig, VERSION,
};

use backend::{Backend, BackendOptions, Method, QueryResult};
use bytes::Bytes;
use line_protocol::Precision;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum Error {
    #[error("database not found")]
    DatabaseRequired,

    #[error("database forbidden: {0}")]
    DatabaseForbidden(String),

    #[error("query parameter 'q' not found")]
    QueryRequired,

    #[error(transparent)]
    LineProtocol(#[from] line_protocol::Error),

    #[error(transparent)]
    InfluxQl(#[from] influxql::Error),

    #[error(transparent)]
    Backend(#[from] backend::Error),

    #[error("no active backend able to serve the query")]
    NoActiveBackend,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A query outcome ready to be relayed to the client.
#[derive(Debug)]
pub struct QueryResponse {
    pub status: u16,
    pub body: Bytes,
}

impl From<QueryResult> for QueryResponse {
    fn from(qr: QueryResult) -> Self {
        Self {
            status: qr.status.as_u16(),
            body: qr.body,
        }
    }
}

/// One replica group: its consistent-hash ring plus the live backends.
#[derive(Debug)]
pub struct ProxyCircle {
    pub circle_id: usize,
    pub name: String,
    ring: sharder::Circle,
    pub backends: Vec<Arc<Backend>>,
    urls: Vec<String>,
    write_only: AtomicBool,
}

impl ProxyCircle {
    async fn new(
        circle_id: usize,
        circle_cfg: &CircleConfig,
        cfg: &ProxyConfig,
    ) -> Result<Self, Error> {
        let identities = circle_cfg
            .backends
            .iter()
            .enumerate()
            .map(|(idx, b)| cfg.hash_key.identity(idx, &b.name, &b.url));
        let ring = sharder::Circle::new(identities);

        let mut backends = Vec::with_capacity(circle_cfg.backends.len());
        let mut urls = Vec::with_capacity(circle_cfg.backends.len());
        for bcfg in &circle_cfg.backends {
            let backend = Backend::new(BackendOptions {
                name: bcfg.name.clone(),
                url: bcfg.url.clone(),
                username: bcfg.username.clone(),
                password: bcfg.password.clone(),
                data_dir: cfg.data_dir.clone(),
                flush_size: cfg.flush_size,
                flush_time: cfg.flush_time(),
                check_interval: cfg.check_interval(),
                rewrite_interval: cfg.rewrite_interval(),
                conn_pool_size: cfg.conn_pool_size,
                write_timeout: cfg.write_timeout(),
                idle_timeout: cfg.idle_timeout(),
            })
            .await?;
            urls.push(backend.url().to_string());
            backends.push(Arc::new(backend));
        }

        Ok(Self {
            circle_id,
            name: circle_cfg.name.clone(),
            ring,
            backends,
            urls,
            write_only: AtomicBool::new(false),
        })
    }

    pub fn ring(&self) -> &sharder::Circle {
        &self.ring
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// The backend owning a routing key within this circle.
    pub fn get_backend(&self, key: &str) -> &Arc<Backend> {
        &self.backends[self.ring.get(key)]
    }

    /// While a circle is transferring it keeps accepting writes but is
    /// skipped as a query target.
    pub fn is_write_only(&self) -> bool {
        self.write_only.load(Ordering::Acquire)
    }

    pub fn set_write_only(&self, value: bool) {
        self.write_only.store(value, Ordering::Release);
    }
}

/// Owns every circle and the optional database allowlist.
#[derive(Debug)]
pub struct Proxy {
    pub circles: Vec<Arc<ProxyCircle>>,
    pub db_set: HashSet<String>,
}

impl Proxy {
    pub async fn new(cfg: &ProxyConfig) -> Result<Self, Error> {
        let mut circles = Vec::with_capacity(cfg.circles.len());
        for (circle_id, circle_cfg) in cfg.circles.iter().enumerate() {
            circles.push(Arc::new(ProxyCircle::new(circle_id, circle_cfg, cfg).await?));
        }
        Ok(Self {
            circles,
            db_set: cfg.db_list.iter().cloned().collect(),
        })
    }

    /// Whether a database passes the configured allowlist.
    pub fn is_db_allowed(&self, db: &str) -> bool {
        self.db_set.is_empty() || self.db_set.contains(db)
    }

    /// The replica set owning a routing key: one backend per circle.
    pub fn get_backends(&self, key: &str) -> Vec<Arc<Backend>> {
        self.circles
            .iter()
            .map(|c| Arc::clone(c.get_backend(key)))
            .collect()
    }

    /// Split a write payload and enqueue every point on the owning backend
    /// of each circle. Once a point is enqueued its delivery is the write
    /// engine's problem; only parse failures surface to the client.
    pub async fn write(&self, payload: &[u8], db: &str, precision: Precision) -> Result<(), Error> {
        let points = line_protocol::split_lines(payload, db, precision)?;
        for point in points {
            let key = sharder::get_key(&point.db, &point.measurement);
            for circle in &self.circles {
                if let Err(e) = circle.get_backend(&key).write_point(point.clone()).await {
                    error!(db = %point.db, circle = circle.circle_id, error = %e, "enqueue failed");
                }
            }
        }
        Ok(())
    }

    /// Route an InfluxQL statement.
    ///
    /// Measurement-scoped reads go to one healthy owner; measurement-scoped
    /// cluster statements (`DROP`, `DELETE`, …) fan out to every replica
    /// owner; database-level statements broadcast to every backend. The
    /// first transport error aborts a fan-out.
    pub async fn query(
        &self,
        method: Method,
        params: &[(String, String)],
    ) -> Result<QueryResponse, Error> {
        let q = param(params, "q").ok_or(Error::QueryRequired)?;
        let param_db = param(params, "db").unwrap_or_default();

        match influxql::measurement_from_influxql(&q) {
            Ok(measurement) => {
                let db = if param_db.is_empty() {
                    influxql::database_from_influxql(&q).map_err(|_| Error::DatabaseRequired)?
                } else {
                    param_db
                };
                self.check_db(&db)?;
                let key = sharder::get_key(&db, &measurement);
                if is_read_statement(&q) {
                    self.query_one(&key, method, params).await
                } else {
                    let owners = self.get_backends(&key);
                    self.query_all(&owners, method, params).await
                }
            }
            Err(_) => {
                if let Ok(db) = influxql::database_from_influxql(&q) {
                    self.check_db(&db)?;
                    let all: Vec<Arc<Backend>> = self
                        .circles
                        .iter()
                        .flat_map(|c| c.backends.iter().map(Arc::clone))
                        .collect();
                    self.query_all(&all, method, params).await
                } else if is_read_statement(&q) {
                    // e.g. SHOW DATABASES: any live backend can answer.
                    if !param_db.is_empty() {
                        self.check_db(&param_db)?;
                    }
                    self.query_any(method, params).await
                } else {
                    Err(Error::InfluxQl(influxql::Error::NoMatch))
                }
            }
        }
    }

    fn check_db(&self, db: &str) -> Result<(), Error> {
        if self.is_db_allowed(db) {
            Ok(())
        } else {
            Err(Error::DatabaseForbidden(db.to_string()))
        }
    }

    /// Forward to the first healthy owner, skipping write-only circles.
    async fn query_one(
        &self,
        key: &str,
        method: Method,
        params: &[(String, String)],
    ) -> Result<QueryResponse, Error> {
        for circle in &self.circles {
            if circle.is_write_only() {
                continue;
            }
            let backend = circle.get_backend(key);
            if !backend.is_active() {
                continue;
            }
            let result = backend.http().query(method.clone(), params).await;
            if let Some(err) = result.err {
                debug!(backend = backend.name(), error = %err, "query attempt failed");
                continue;
            }
            return Ok(result.into());
        }
        Err(Error::NoActiveBackend)
    }

    async fn query_all(
        &self,
        backends: &[Arc<Backend>],
        method: Method,
        params: &[(String, String)],
    ) -> Result<QueryResponse, Error> {
        let (results, inactive) = backend::query_in_parallel(backends, method, params).await?;
        debug!(replies = results.len(), inactive, "parallel query complete");
        results
            .into_iter()
            .next()
            .map(Into::into)
            .ok_or(Error::NoActiveBackend)
    }

    async fn query_any(
        &self,
        method: Method,
        params: &[(String, String)],
    ) -> Result<QueryResponse, Error> {
        for circle in &self.circles {
            if circle.is_write_only() {
                continue;
            }
            for backend in &circle.backends {
                if !backend.is_active() {
                    continue;
                }
                let result = backend.http().query(method.clone(), params).await;
                if result.err.is_none() {
                    return Ok(result.into());
                }
            }
        }
        Err(Error::NoActiveBackend)
    }

    /// Per-backend health, each judged against its own circle's ring.
    pub async fn get_health(&self) -> Vec<backend::HealthReport> {
        let mut futures = Vec::new();
        for circle in &self.circles {
            for b in &circle.backends {
                let backend = Arc::clone(b);
                let circle = Arc::clone(circle);
                futures.push(async move {
                    backend.get_health(circle.ring(), circle.urls()).await
                });
            }
        }
        futures::future::join_all(futures).await
    }

    /// Close every backend's write channel and wait for the drains.
    pub async fn close(&self) {
        for circle in &self.circles {
            for backend in &circle.backends {
                backend.close().await;
            }
        }
    }
}

fn param(params: &[(String, String)], name: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

/// `SELECT` (without `INTO`) and `SHOW` statements read; everything else
/// mutates cluster state and must reach every replica.
fn is_read_statement(q: &str) -> bool {
    let trimmed = q.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '(' | '[' | '{'));
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default();
    if first.eq_ignore_ascii_case("show") {
        return true;
    }
    if first.eq_ignore_ascii_case("select") {
        return !trimmed
            .split_whitespace()
            .any(|w| w.eq_ignore_ascii_case("into"));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_statement_classification() {
        assert!(is_read_statement("SELECT * FROM cpu"));
        assert!(is_read_statement("  (select *) from cpu"));
        assert!(is_read_statement("show measurements"));
        assert!(!is_read_statement(
            "SELECT mean(\"value\") INTO \"cpu_1h\".:MEASUREMENT FROM /cpu.*/"
        ));
        assert!(!is_read_statement("DROP MEASUREMENT cpu"));
        assert!(!is_read_statement("DELETE FROM cpu"));
    }

    #[test]
    fn param_lookup() {
        let params = vec![
            ("db".to_string(), "mydb".to_string()),
            ("q".to_string(), "SHOW DATABASES".to_string()),
        ];
        assert_eq!(param(&params, "q").as_deref(), Some("SHOW DATABASES"));
        assert_eq!(param(&params, "epoch"), None);
    }

    #[tokio::test]
    async fn replica_set_is_one_backend_per_circle_and_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
circles:
  - name: c0
    backends:
      - {{ name: a0, url: "http://127.0.0.1:7001" }}
      - {{ name: a1, url: "http://127.0.0.1:7002" }}
  - name: c1
    backends:
      - {{ name: b0, url: "http://127.0.0.1:7003" }}
      - {{ name: b1, url: "http://127.0.0.1:7004" }}
hash_key: name
data_dir: {}
"#,
            dir.path().display()
        );
        let mut cfg: ProxyConfig = serde_yaml::from_str(&yaml).unwrap();
        cfg.set_defaults();
        cfg.validate().unwrap();

        let proxy = Proxy::new(&cfg).await.unwrap();
        let key = sharder::get_key("mydb", "cpu");
        let replicas = proxy.get_backends(&key);
        assert_eq!(replicas.len(), 2);
        assert!(replicas[0].name().starts_with('a'));
        assert!(replicas[1].name().starts_with('b'));

        // Same config, fresh proxy: identical placement.
        let proxy2 = Proxy::new(&cfg).await.unwrap();
        let replicas2 = proxy2.get_backends(&key);
        assert_eq!(replicas[0].name(), replicas2[0].name());
        assert_eq!(replicas[1].name(), replicas2[1].name());

        proxy.close().await;
        proxy2.close().await;
    }

    #[tokio::test]
    async fn db_allowlist_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
circles:
  - backends:
      - {{ name: b0, url: "http://127.0.0.1:7001" }}
db_list: ["allowed"]
data_dir: {}
"#,
            dir.path().display()
        );
        let mut cfg: ProxyConfig = serde_yaml::from_str(&yaml).unwrap();
        cfg.set_defaults();
        let proxy = Proxy::new(&cfg).await.unwrap();

        assert!(proxy.is_db_allowed("allowed"));
        assert!(!proxy.is_db_allowed("other"));

        let params = vec![
            ("db".to_string(), "other".to_string()),
            ("q".to_string(), "select * from cpu".to_string()),
        ];
        let err = proxy.query(Method::GET, &params).await.unwrap_err();
        assert!(matches!(err, Error::DatabaseForbidden(_)));
        proxy.close().await;
    }
}
