//! The proxy's HTTP surface.
//!
//! Hand-routed `(method, path)` dispatch over hyper. Every response carries
//! `X-Influxdb-Version`; error responses additionally carry
//! `X-Influxdb-Error` and a JSON `{"error": …}` body, matching what 1.x
//! client libraries expect.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use line_protocol::Precision;
use proxy::transfer::{Params, Transfer, DEFAULT_BATCH, DEFAULT_LIMIT, DEFAULT_WORKER};
use proxy::{cipher, Proxy, ProxyConfig, VERSION};
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::metrics;

type HandlerResult = Result<Response<Body>, HttpError>;

/// An error ready to be shaped into an InfluxDB-style response.
#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<proxy::Error> for HttpError {
    fn from(e: proxy::Error) -> Self {
        Self::bad_request(e.to_string())
    }
}

#[derive(Debug)]
pub struct HttpService {
    proxy: Arc<Proxy>,
    transfer: Arc<Transfer>,
    username: String,
    password: String,
    auth_secure: bool,
    write_tracing: bool,
    query_tracing: bool,
    write_timeout: Duration,
    idle_timeout: Duration,
}

impl HttpService {
    pub fn new(cfg: &ProxyConfig, proxy: Arc<Proxy>, transfer: Arc<Transfer>) -> Self {
        Self {
            proxy,
            transfer,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            auth_secure: cfg.auth_secure,
            write_tracing: cfg.write_tracing,
            query_tracing: cfg.query_tracing,
            write_timeout: cfg.write_timeout(),
            idle_timeout: cfg.idle_timeout(),
        }
    }

    /// Dispatch one request. Never fails; errors become shaped responses.
    pub async fn route(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        let pretty = param(&query_params(&req), "pretty").as_deref() == Some("true");

        let (handler, result) = match path.as_str() {
            "/ping" => ("ping", self.handle_ping()),
            "/query" => ("query", self.handle_query(req).await),
            "/write" => ("write", self.handle_write(req).await),
            "/health" => ("health", self.handle_health(req).await),
            "/replica" => ("replica", self.handle_replica(req)),
            "/encrypt" => ("encrypt", self.handle_encrypt(req)),
            "/decrypt" => ("decrypt", self.handle_decrypt(req)),
            "/rebalance" => ("rebalance", self.handle_rebalance(req).await),
            "/recovery" => ("recovery", self.handle_recovery(req)),
            "/resync" => ("resync", self.handle_resync(req)),
            "/cleanup" => ("cleanup", self.handle_cleanup(req)),
            "/transfer/state" => ("transfer_state", self.handle_transfer_state(req)),
            "/transfer/stats" => ("transfer_stats", self.handle_transfer_stats(req)),
            "/metrics" => ("metrics", self.handle_metrics()),
            p if p.starts_with("/debug/pprof") => (
                "pprof",
                Err(HttpError::new(
                    StatusCode::NOT_IMPLEMENTED,
                    "pprof support is not compiled",
                )),
            ),
            _ => (
                "unknown",
                Err(HttpError::new(StatusCode::NOT_FOUND, "not found")),
            ),
        };

        let response = match result {
            Ok(resp) => resp,
            Err(e) => error_response(e.status, &e.message, pretty),
        };
        metrics::HTTP_REQUESTS_TOTAL
            .with_label_values(&[handler, response.status().as_str()])
            .inc();
        response
    }

    fn handle_ping(&self) -> HandlerResult {
        Ok(empty_response(StatusCode::NO_CONTENT))
    }

    async fn handle_query(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::GET, Method::POST])?;
        self.check_auth(&req)?;

        let method = req.method().clone();
        let mut params = query_params(&req);
        if method == Method::POST && is_form(&req) {
            let body = read_body(req).await?;
            params.extend(parse_form(&body));
        }
        // Backend credentials are appended per backend; the client's are not
        // forwarded.
        let forwarded: Vec<(String, String)> = params
            .iter()
            .filter(|(k, _)| k != "u" && k != "p")
            .cloned()
            .collect();

        let result = self.proxy.query(method.clone(), &forwarded).await;
        if self.query_tracing {
            let db = param(&params, "db").unwrap_or_default();
            let q = param(&params, "q").unwrap_or_default();
            info!(%method, db, q, ok = result.is_ok(), "query");
        }
        match result {
            Ok(resp) => {
                let status = StatusCode::from_u16(resp.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Ok(response_builder(status)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(resp.body))
                    .expect("static response construction"))
            }
            Err(e) => {
                debug!(error = %e, "query failed");
                Err(HttpError::bad_request(e.to_string()))
            }
        }
    }

    async fn handle_write(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::POST])?;
        self.check_auth(&req)?;

        let params = query_params(&req);
        let precision: Precision = param(&params, "precision")
            .unwrap_or_default()
            .parse()
            .map_err(|e: line_protocol::Error| HttpError::bad_request(e.to_string()))?;
        let db = param(&params, "db")
            .filter(|db| !db.is_empty())
            .ok_or_else(|| HttpError::bad_request("database not found"))?;
        if !self.proxy.is_db_allowed(&db) {
            return Err(HttpError::bad_request(format!("database forbidden: {db}")));
        }

        let gzipped = req
            .headers()
            .get(CONTENT_ENCODING)
            .is_some_and(|v| v.as_bytes() == b"gzip");
        let body = read_body(req).await?;
        let payload = if gzipped { gunzip(&body)? } else { body };

        self.proxy.write(&payload, &db, precision).await?;

        let points = payload
            .split(|&b| b == b'\n')
            .filter(|l| !l.is_empty())
            .count();
        metrics::POINTS_ROUTED_TOTAL.inc_by(points as u64);
        if self.write_tracing {
            info!(db, %precision, bytes = payload.len(), points, "write");
        }
        Ok(empty_response(StatusCode::NO_CONTENT))
    }

    async fn handle_health(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::GET])?;
        self.check_auth(&req)?;
        let pretty = wants_pretty(&req);
        let health = self.proxy.get_health().await;
        let inactive = health.iter().filter(|h| !h.active).count();
        metrics::BACKENDS_INACTIVE.set(inactive as i64);
        Ok(json_response(StatusCode::OK, &health, pretty))
    }

    fn handle_replica(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::GET])?;
        self.check_auth(&req)?;
        let params = query_params(&req);
        let pretty = wants_pretty(&req);
        let db = param(&params, "db").unwrap_or_default();
        let meas = param(&params, "meas").unwrap_or_default();
        if db.is_empty() || meas.is_empty() {
            return Err(HttpError::bad_request("invalid db or meas"));
        }
        let key = sharder::get_key(&db, &meas);
        let data: Vec<serde_json::Value> = self
            .proxy
            .circles
            .iter()
            .map(|circle| {
                let backend = circle.get_backend(&key);
                json!({
                    "backend": {"name": backend.name(), "url": backend.url()},
                    "circle": {"id": circle.circle_id, "name": circle.name},
                })
            })
            .collect();
        Ok(json_response(StatusCode::OK, &data, pretty))
    }

    fn handle_encrypt(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::GET])?;
        let text = param(&query_params(&req), "text").unwrap_or_default();
        Ok(text_response(StatusCode::OK, &cipher::encrypt(&text)))
    }

    fn handle_decrypt(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::GET])?;
        let text = param(&query_params(&req), "text").unwrap_or_default();
        match cipher::decrypt(&text) {
            Some(plain) => Ok(text_response(StatusCode::OK, &plain)),
            None => Err(HttpError::bad_request("invalid cipher text")),
        }
    }

    async fn handle_rebalance(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::POST])?;
        self.check_auth(&req)?;
        let params = query_params(&req);
        let circle_id = self.circle_id(&params, "circle_id")?;
        let operation = param(&params, "operation").unwrap_or_default();
        if operation != "add" && operation != "rm" {
            return Err(HttpError::bad_request("invalid operation"));
        }

        let mut removed = Vec::new();
        if operation == "rm" {
            let body = read_body(req).await?;
            let parsed: serde_json::Value = serde_json::from_slice(&body)
                .map_err(|_| HttpError::bad_request("invalid backends from body"))?;
            let backends = parsed
                .get("backends")
                .and_then(|b| b.as_array())
                .ok_or_else(|| HttpError::bad_request("invalid backends from body"))?;
            for b in backends {
                removed.push(Arc::new(backend::HttpBackend::new_simple(
                    backend::HttpBackendOptions {
                        name: str_field(b, "name"),
                        url: str_field(b, "url"),
                        username: str_field(b, "username"),
                        password: str_field(b, "password"),
                        write_timeout: self.write_timeout,
                        idle_timeout: self.idle_timeout,
                        check_interval: Duration::from_secs(1),
                    },
                )));
            }
        }

        self.check_not_busy(&[circle_id])?;
        self.set_params(&params)?;

        let dbs = list_param(&params, "dbs");
        tokio::spawn(Arc::clone(&self.transfer).rebalance(circle_id, removed, dbs));
        Ok(text_response(StatusCode::ACCEPTED, "accepted"))
    }

    fn handle_recovery(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::POST])?;
        self.check_auth(&req)?;
        let params = query_params(&req);
        let from = self.circle_id(&params, "from_circle_id")?;
        let to = self.circle_id(&params, "to_circle_id")?;
        if from == to {
            return Err(HttpError::bad_request(
                "from_circle_id and to_circle_id cannot be same",
            ));
        }
        self.check_not_busy(&[from, to])?;
        self.set_params(&params)?;

        let backend_urls = list_param(&params, "backend_urls");
        let dbs = list_param(&params, "dbs");
        tokio::spawn(Arc::clone(&self.transfer).recovery(from, to, backend_urls, dbs));
        Ok(text_response(StatusCode::ACCEPTED, "accepted"))
    }

    fn handle_resync(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::POST])?;
        self.check_auth(&req)?;
        let params = query_params(&req);
        let tick = match param(&params, "tick") {
            None => 0,
            Some(t) => t
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|t| *t >= 0)
                .ok_or_else(|| {
                    HttpError::bad_request("invalid tick, require non-negative integer")
                })?,
        };

        let all: Vec<usize> = (0..self.proxy.circles.len()).collect();
        self.check_not_busy(&all)?;
        self.set_params(&params)?;

        let dbs = list_param(&params, "dbs");
        tokio::spawn(Arc::clone(&self.transfer).resync(dbs, tick));
        Ok(text_response(StatusCode::ACCEPTED, "accepted"))
    }

    fn handle_cleanup(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::POST])?;
        self.check_auth(&req)?;
        let params = query_params(&req);
        let circle_id = self.circle_id(&params, "circle_id")?;
        self.check_not_busy(&[circle_id])?;
        self.set_params(&params)?;

        tokio::spawn(Arc::clone(&self.transfer).cleanup(circle_id));
        Ok(text_response(StatusCode::ACCEPTED, "accepted"))
    }

    fn handle_transfer_state(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::GET, Method::POST])?;
        self.check_auth(&req)?;
        let params = query_params(&req);
        let pretty = wants_pretty(&req);

        if req.method() == Method::GET {
            let circles: Vec<serde_json::Value> = self
                .transfer
                .circle_states
                .iter()
                .map(|cs| {
                    json!({
                        "id": cs.circle_id,
                        "name": cs.name,
                        "transferring": cs.is_transferring(),
                    })
                })
                .collect();
            let state = json!({
                "resyncing": self.transfer.is_resyncing(),
                "circles": circles,
            });
            return Ok(json_response(StatusCode::OK, &state, pretty));
        }

        let mut state = serde_json::Map::new();
        if let Some(resyncing) = param(&params, "resyncing") {
            let value: bool = resyncing
                .parse()
                .map_err(|_| HttpError::bad_request("illegal resyncing"))?;
            self.transfer.set_resyncing(value);
            state.insert("resyncing".to_string(), json!(value));
        }
        if param(&params, "circle_id").is_some() || param(&params, "transferring").is_some() {
            let circle_id = self.circle_id(&params, "circle_id")?;
            let transferring: bool = param(&params, "transferring")
                .unwrap_or_default()
                .parse()
                .map_err(|_| HttpError::bad_request("illegal transferring"))?;
            self.transfer.set_circle_transferring(circle_id, transferring);
            let cs = &self.transfer.circle_states[circle_id];
            state.insert(
                "circle".to_string(),
                json!({
                    "id": cs.circle_id,
                    "name": cs.name,
                    "transferring": cs.is_transferring(),
                }),
            );
        }
        if state.is_empty() {
            return Err(HttpError::bad_request("missing query parameter"));
        }
        Ok(json_response(
            StatusCode::OK,
            &serde_json::Value::Object(state),
            pretty,
        ))
    }

    fn handle_transfer_stats(&self, req: Request<Body>) -> HandlerResult {
        self.check_method(&req, &[Method::GET])?;
        self.check_auth(&req)?;
        let params = query_params(&req);
        let pretty = wants_pretty(&req);
        let circle_id = self.circle_id(&params, "circle_id")?;
        let stats_type = param(&params, "type").unwrap_or_default();
        if !matches!(
            stats_type.as_str(),
            "rebalance" | "recovery" | "resync" | "cleanup"
        ) {
            return Err(HttpError::bad_request("invalid stats type"));
        }
        let stats = self.transfer.circle_states[circle_id].stats.lock().clone();
        Ok(json_response(StatusCode::OK, &stats, pretty))
    }

    fn handle_metrics(&self) -> HandlerResult {
        Ok(response_builder(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(metrics::render()))
            .expect("static response construction"))
    }

    fn check_method(&self, req: &Request<Body>, allowed: &[Method]) -> Result<(), HttpError> {
        if allowed.contains(req.method()) {
            Ok(())
        } else {
            Err(HttpError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allow",
            ))
        }
    }

    fn check_auth(&self, req: &Request<Body>) -> Result<(), HttpError> {
        if self.username.is_empty() && self.password.is_empty() {
            return Ok(());
        }
        let params = query_params(req);
        let u = param(&params, "u").unwrap_or_default();
        let p = param(&params, "p").unwrap_or_default();
        if self.trans_auth(&u) == self.username && self.trans_auth(&p) == self.password {
            return Ok(());
        }
        if let Some((u, p)) = basic_auth(req) {
            if self.trans_auth(&u) == self.username && self.trans_auth(&p) == self.password {
                return Ok(());
            }
        }
        Err(HttpError::new(
            StatusCode::UNAUTHORIZED,
            "authentication failed",
        ))
    }

    fn trans_auth(&self, text: &str) -> String {
        if self.auth_secure {
            cipher::encrypt(text)
        } else {
            text.to_string()
        }
    }

    fn circle_id(
        &self,
        params: &[(String, String)],
        key: &str,
    ) -> Result<usize, HttpError> {
        param(params, key)
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|id| *id < self.proxy.circles.len())
            .ok_or_else(|| HttpError::bad_request(format!("invalid {key}")))
    }

    /// Transfer operations take exclusive ownership of their circles.
    fn check_not_busy(&self, circle_ids: &[usize]) -> Result<(), HttpError> {
        for &id in circle_ids {
            if self.transfer.circle_states[id].is_transferring() {
                return Err(HttpError::bad_request(format!(
                    "circle {id} is transferring"
                )));
            }
        }
        if self.transfer.is_resyncing() {
            return Err(HttpError::bad_request("proxy is resyncing"));
        }
        Ok(())
    }

    fn set_params(&self, params: &[(String, String)]) -> Result<(), HttpError> {
        let worker = positive_or(params, "worker", DEFAULT_WORKER)
            .map_err(|_| HttpError::bad_request("invalid worker, require positive integer"))?;
        let batch = positive_or(params, "batch", DEFAULT_BATCH)
            .map_err(|_| HttpError::bad_request("invalid batch, require positive integer"))?;
        let limit = positive_or(params, "limit", DEFAULT_LIMIT)
            .map_err(|_| HttpError::bad_request("invalid limit, require positive integer"))?;
        let ha_addrs = list_param(params, "ha_addrs");
        match ha_addrs.len() {
            0 => {}
            1 => {
                return Err(HttpError::bad_request(
                    "invalid ha_addrs, require at least two addresses as <host:port>, comma-separated",
                ))
            }
            _ => {
                for addr in &ha_addrs {
                    if !valid_host_port(addr) {
                        return Err(HttpError::bad_request(
                            "invalid ha_addrs, require at least two addresses as <host:port>, comma-separated",
                        ));
                    }
                }
            }
        }
        *self.transfer.params.lock() = Params {
            worker,
            batch,
            limit,
            ha_addrs,
        };
        Ok(())
    }
}

fn positive_or(
    params: &[(String, String)],
    key: &str,
    default: usize,
) -> Result<usize, ()> {
    match param(params, key) {
        None => Ok(default),
        Some(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return Ok(default);
            }
            raw.parse::<usize>().ok().filter(|v| *v > 0).ok_or(())
        }
    }
}

fn valid_host_port(addr: &str) -> bool {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return false;
    };
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !port.is_empty()
        && port.len() <= 5
        && port.chars().all(|c| c.is_ascii_digit())
}

fn query_params(req: &Request<Body>) -> Vec<(String, String)> {
    req.uri()
        .query()
        .map(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).unwrap_or_default())
        .unwrap_or_default()
}

fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(body).unwrap_or_default()
}

fn param(params: &[(String, String)], name: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

/// A comma-separated multi-value parameter, trimmed like the admin CLI
/// sends it.
fn list_param(params: &[(String, String)], name: &str) -> Vec<String> {
    param(params, name)
        .map(|v| {
            v.trim_matches([',', ' '])
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn is_form(req: &Request<Body>) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

fn wants_pretty(req: &Request<Body>) -> bool {
    param(&query_params(req), "pretty").as_deref() == Some("true")
}

fn basic_auth(req: &Request<Body>) -> Option<(String, String)> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn read_body(req: Request<Body>) -> Result<Bytes, HttpError> {
    hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| HttpError::bad_request(format!("unable to read body: {e}")))
}

fn gunzip(body: &[u8]) -> Result<Bytes, HttpError> {
    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| HttpError::bad_request("unable to decode gzip body"))?;
    Ok(out.into())
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn response_builder(status: StatusCode) -> hyper::http::response::Builder {
    Response::builder()
        .status(status)
        .header("X-Influxdb-Version", VERSION)
}

fn empty_response(status: StatusCode) -> Response<Body> {
    response_builder(status)
        .body(Body::empty())
        .expect("static response construction")
}

fn text_response(status: StatusCode, text: &str) -> Response<Body> {
    response_builder(status)
        .body(Body::from(format!("{text}\n")))
        .expect("static response construction")
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T, pretty: bool) -> Response<Body> {
    let body = if pretty {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    }
    .unwrap_or_else(|e| {
        error!(error = %e, "response serialization failed");
        b"{}".to_vec()
    });
    response_builder(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response construction")
}

fn error_response(status: StatusCode, message: &str, pretty: bool) -> Response<Body> {
    let body = json!({ "error": message });
    let body = if pretty {
        serde_json::to_vec_pretty(&body)
    } else {
        serde_json::to_vec(&body)
    }
    .expect("error body serializes");
    response_builder(status)
        .header(CONTENT_TYPE, "application/json")
        .header("X-Influxdb-Error", message)
        .body(Body::from(body))
        .expect("static response construction")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_param_trims_and_splits() {
        let params = vec![("dbs".to_string(), " ,db1,db2, ".to_string())];
        assert_eq!(list_param(&params, "dbs"), vec!["db1", "db2"]);
        assert!(list_param(&params, "missing").is_empty());
    }

    #[test]
    fn host_port_validation() {
        assert!(valid_host_port("proxy-1.internal:8086"));
        assert!(valid_host_port("127.0.0.1:80"));
        assert!(!valid_host_port("no-port"));
        assert!(!valid_host_port(":8080"));
        assert!(!valid_host_port("host:"));
        assert!(!valid_host_port("host:notaport"));
        assert!(!valid_host_port("bad host:80"));
    }

    #[test]
    fn positive_param_parsing() {
        let params = vec![
            ("batch".to_string(), "500".to_string()),
            ("limit".to_string(), "0".to_string()),
        ];
        assert_eq!(positive_or(&params, "batch", 1), Ok(500));
        assert_eq!(positive_or(&params, "worker", 7), Ok(7));
        assert!(positive_or(&params, "limit", 1).is_err());
    }

    #[test]
    fn basic_auth_decoding() {
        let req = Request::builder()
            .header(AUTHORIZATION, format!("Basic {}", BASE64.encode("user:pa:ss")))
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            basic_auth(&req),
            Some(("user".to_string(), "pa:ss".to_string()))
        );

        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(basic_auth(&req), None);
    }

    #[test]
    fn error_responses_carry_the_influxdb_headers() {
        let resp = error_response(StatusCode::BAD_REQUEST, "database not found", false);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers().get("X-Influxdb-Version").unwrap(),
            VERSION
        );
        assert_eq!(
            resp.headers().get("X-Influxdb-Error").unwrap(),
            "database not found"
        );
    }
}
