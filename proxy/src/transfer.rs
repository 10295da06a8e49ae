//! Administrative data movement: rebalance, recovery, resync, cleanup.
//!
//! Operations run as background tasks; the HTTP layer answers `202 accepted`
//! as soon as one is queued. A circle being rebalanced or cleaned is put in
//! write-only mode (it keeps ingesting, stops serving queries) and at most
//! one operation may own a circle at a time.
//!
//! Measurements are moved by querying the source for the raw series
//! (`SELECT * FROM m GROUP BY *` at nanosecond epoch), rebuilding line
//! protocol with the field types reported by `SHOW FIELD KEYS`, and writing
//! the batches to the destination.

use crate::ProxyCircle;
use backend::{HttpBackend, Method};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_WORKER: usize = 1;
pub const DEFAULT_BATCH: usize = 25_000;
pub const DEFAULT_LIMIT: usize = 1_000_000;

/// Per-backend counters for the stats endpoint.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Stats {
    pub databases: u64,
    pub measurements: u64,
    pub transferred: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Tunables the admin endpoints may override per operation.
#[derive(Debug, Clone)]
pub struct Params {
    pub worker: usize,
    pub batch: usize,
    pub limit: usize,
    pub ha_addrs: Vec<String>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            worker: DEFAULT_WORKER,
            batch: DEFAULT_BATCH,
            limit: DEFAULT_LIMIT,
            ha_addrs: Vec::new(),
        }
    }
}

/// Transfer bookkeeping for one circle.
#[derive(Debug)]
pub struct CircleState {
    pub circle_id: usize,
    pub name: String,
    transferring: AtomicBool,
    pub stats: Mutex<HashMap<String, Stats>>,
}

impl CircleState {
    pub fn is_transferring(&self) -> bool {
        self.transferring.load(Ordering::Acquire)
    }
}

/// The transfer collaborator: owns per-circle transfer state and runs the
/// four data-movement operations.
#[derive(Debug)]
pub struct Transfer {
    circles: Vec<Arc<ProxyCircle>>,
    pub circle_states: Vec<Arc<CircleState>>,
    resyncing: AtomicBool,
    pub params: Mutex<Params>,
}

impl Transfer {
    pub fn new(circles: Vec<Arc<ProxyCircle>>) -> Self {
        let circle_states = circles
            .iter()
            .map(|c| {
                Arc::new(CircleState {
                    circle_id: c.circle_id,
                    name: c.name.clone(),
                    transferring: AtomicBool::new(false),
                    stats: Mutex::new(HashMap::new()),
                })
            })
            .collect();
        Self {
            circles,
            circle_states,
            resyncing: AtomicBool::new(false),
            params: Mutex::new(Params::default()),
        }
    }

    pub fn is_resyncing(&self) -> bool {
        self.resyncing.load(Ordering::Acquire)
    }

    pub fn set_resyncing(&self, value: bool) {
        self.resyncing.store(value, Ordering::Release);
    }

    /// Operator override of a circle's transferring flag; write-only mode
    /// follows it.
    pub fn set_circle_transferring(&self, circle_id: usize, value: bool) {
        self.circle_states[circle_id]
            .transferring
            .store(value, Ordering::Release);
        self.circles[circle_id].set_write_only(value);
    }

    /// Move every misplaced measurement in the circle to its ring owner.
    /// `removed` carries clients for backends just taken out of the ring,
    /// whose data still needs a new home.
    pub async fn rebalance(
        self: Arc<Self>,
        circle_id: usize,
        removed: Vec<Arc<HttpBackend>>,
        dbs: Vec<String>,
    ) {
        self.set_circle_transferring(circle_id, true);
        let circle = Arc::clone(&self.circles[circle_id]);
        info!(circle_id, "rebalance started");

        let mut sources: Vec<Arc<HttpBackend>> = circle
            .backends
            .iter()
            .map(|b| Arc::clone(b.http()))
            .collect();
        sources.extend(removed);

        for src in &sources {
            for db in self.databases_on(src, &dbs).await {
                self.bump(circle_id, &src.url, |s| s.databases += 1);
                let measurements = match src.get_measurements(&db).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(url = %src.url, db, error = %e, "rebalance: listing measurements failed");
                        continue;
                    }
                };
                for meas in measurements {
                    self.bump(circle_id, &src.url, |s| s.measurements += 1);
                    let owner = circle.get_backend(&sharder::get_key(&db, &meas));
                    if owner.url() == src.url {
                        continue;
                    }
                    match copy_measurement(src, owner.http(), &db, &meas, "", self.batch(), self.limit())
                        .await
                    {
                        Ok(_) => {
                            self.bump(circle_id, &src.url, |s| s.transferred += 1);
                            if drop_measurement(src, &db, &meas).await {
                                self.bump(circle_id, &src.url, |s| s.dropped += 1);
                            }
                        }
                        Err(e) => {
                            self.bump(circle_id, &src.url, |s| s.failed += 1);
                            warn!(db, meas, error = %e, "rebalance: copy failed");
                        }
                    }
                }
            }
        }

        self.set_circle_transferring(circle_id, false);
        info!(circle_id, "rebalance finished");
    }

    /// Re-copy data into `to_circle` from the healthy `from_circle`,
    /// optionally restricted to the given destination backend urls.
    pub async fn recovery(
        self: Arc<Self>,
        from_circle_id: usize,
        to_circle_id: usize,
        backend_urls: Vec<String>,
        dbs: Vec<String>,
    ) {
        self.set_circle_transferring(to_circle_id, true);
        let from = Arc::clone(&self.circles[from_circle_id]);
        let to = Arc::clone(&self.circles[to_circle_id]);
        let url_filter: HashSet<String> = backend_urls.into_iter().collect();
        info!(from_circle_id, to_circle_id, "recovery started");

        let series = self.enumerate_series(&from, &dbs).await;
        futures::stream::iter(series)
            .for_each_concurrent(Some(self.worker()), |(db, meas)| {
                let this = &self;
                let from = &from;
                let to = &to;
                let url_filter = &url_filter;
                async move {
                    let src = from.get_backend(&sharder::get_key(&db, &meas));
                    let dst = to.get_backend(&sharder::get_key(&db, &meas));
                    if !url_filter.is_empty() && !url_filter.contains(dst.url()) {
                        return;
                    }
                    this.bump(to_circle_id, dst.url(), |s| s.measurements += 1);
                    match copy_measurement(
                        src.http(),
                        dst.http(),
                        &db,
                        &meas,
                        "",
                        this.batch(),
                        this.limit(),
                    )
                    .await
                    {
                        Ok(_) => this.bump(to_circle_id, dst.url(), |s| s.transferred += 1),
                        Err(e) => {
                            this.bump(to_circle_id, dst.url(), |s| s.failed += 1);
                            warn!(db, meas, error = %e, "recovery: copy failed");
                        }
                    }
                }
            })
            .await;

        self.set_circle_transferring(to_circle_id, false);
        info!(from_circle_id, to_circle_id, "recovery finished");
    }

    /// Bring every circle to the union of all circles' data. A positive
    /// `tick` restricts the copy to the trailing time window of that many
    /// seconds.
    pub async fn resync(self: Arc<Self>, dbs: Vec<String>, tick: i64) {
        self.set_resyncing(true);
        let condition = if tick > 0 {
            format!(" WHERE time > now() - {tick}s")
        } else {
            String::new()
        };
        let condition = &condition;
        info!(tick, "resync started");

        for from in &self.circles {
            let series = self.enumerate_series(from, &dbs).await;
            futures::stream::iter(series)
                .for_each_concurrent(Some(self.worker()), |(db, meas)| {
                    let this = &self;
                    async move {
                        let src = from.get_backend(&sharder::get_key(&db, &meas));
                        for to in &this.circles {
                            if to.circle_id == from.circle_id {
                                continue;
                            }
                            let dst = to.get_backend(&sharder::get_key(&db, &meas));
                            this.bump(to.circle_id, dst.url(), |s| s.measurements += 1);
                            match copy_measurement(
                                src.http(),
                                dst.http(),
                                &db,
                                &meas,
                                condition,
                                this.batch(),
                                this.limit(),
                            )
                            .await
                            {
                                Ok(_) => this.bump(to.circle_id, dst.url(), |s| s.transferred += 1),
                                Err(e) => {
                                    this.bump(to.circle_id, dst.url(), |s| s.failed += 1);
                                    warn!(from_circle = from.circle_id, db, meas, error = %e, "resync: copy failed");
                                }
                            }
                        }
                    }
                })
                .await;
        }

        self.set_resyncing(false);
        info!("resync finished");
    }

    /// Drop every measurement a backend holds that the ring assigns
    /// elsewhere. Run after a rebalance has copied the data out.
    pub async fn cleanup(self: Arc<Self>, circle_id: usize) {
        self.set_circle_transferring(circle_id, true);
        let circle = Arc::clone(&self.circles[circle_id]);
        info!(circle_id, "cleanup started");

        for b in &circle.backends {
            let src = b.http();
            for db in self.databases_on(src, &[]).await {
                let measurements = match src.get_measurements(&db).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(url = %src.url, db, error = %e, "cleanup: listing measurements failed");
                        continue;
                    }
                };
                for meas in measurements {
                    let owner = circle.get_backend(&sharder::get_key(&db, &meas));
                    if owner.url() == src.url {
                        continue;
                    }
                    self.bump(circle_id, &src.url, |s| s.measurements += 1);
                    if drop_measurement(src, &db, &meas).await {
                        self.bump(circle_id, &src.url, |s| s.dropped += 1);
                    } else {
                        self.bump(circle_id, &src.url, |s| s.failed += 1);
                    }
                }
            }
        }

        self.set_circle_transferring(circle_id, false);
        info!(circle_id, "cleanup finished");
    }

    fn batch(&self) -> usize {
        self.params.lock().batch.max(1)
    }

    fn limit(&self) -> usize {
        self.params.lock().limit.max(1)
    }

    fn worker(&self) -> usize {
        self.params.lock().worker.max(1)
    }

    fn bump(&self, circle_id: usize, url: &str, f: impl FnOnce(&mut Stats)) {
        let mut stats = self.circle_states[circle_id].stats.lock();
        f(stats.entry(url.to_string()).or_default());
    }

    async fn databases_on(&self, http: &HttpBackend, dbs: &[String]) -> Vec<String> {
        if !dbs.is_empty() {
            return dbs.to_vec();
        }
        match http.get_databases().await {
            Ok(dbs) => dbs,
            Err(e) => {
                warn!(url = %http.url, error = %e, "listing databases failed");
                Vec::new()
            }
        }
    }

    /// All `(db, measurement)` pairs present anywhere in a circle.
    async fn enumerate_series(
        &self,
        circle: &ProxyCircle,
        dbs: &[String],
    ) -> Vec<(String, String)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for b in &circle.backends {
            let src = b.http();
            for db in self.databases_on(src, dbs).await {
                match src.get_measurements(&db).await {
                    Ok(measurements) => {
                        for meas in measurements {
                            if seen.insert((db.clone(), meas.clone())) {
                                out.push((db.clone(), meas));
                            }
                        }
                    }
                    Err(e) => {
                        warn!(url = %src.url, db, error = %e, "listing measurements failed")
                    }
                }
            }
        }
        out
    }
}

/// Copy one measurement's full series set from `src` to `dst`, paging with
/// `LIMIT`/`OFFSET` (both apply per series under `GROUP BY *`). Returns the
/// number of lines written.
async fn copy_measurement(
    src: &HttpBackend,
    dst: &HttpBackend,
    db: &str,
    meas: &str,
    condition: &str,
    batch: usize,
    limit: usize,
) -> Result<u64, backend::Error> {
    let field_types = fetch_field_types(src, db, meas).await?;

    let mut written = 0u64;
    let mut lines: Vec<String> = Vec::new();
    let mut offset = 0usize;
    loop {
        let q = format!(
            "SELECT * FROM \"{}\"{condition} GROUP BY * LIMIT {limit} OFFSET {offset}",
            meas.replace('"', "\\\"")
        );
        let series = fetch_series(src, db, &q).await?;
        let longest = series.iter().map(|s| s.values.len()).max().unwrap_or(0);
        for s in &series {
            lines.extend(series_to_lines(s, &field_types));
            while lines.len() >= batch {
                let chunk: Vec<String> = lines.drain(..batch).collect();
                written += flush_lines(dst, db, &chunk).await?;
            }
        }
        if longest < limit {
            break;
        }
        offset += limit;
    }
    if !lines.is_empty() {
        written += flush_lines(dst, db, &lines).await?;
    }
    Ok(written)
}

async fn flush_lines(
    dst: &HttpBackend,
    db: &str,
    lines: &[String],
) -> Result<u64, backend::Error> {
    let mut payload = String::new();
    for line in lines {
        payload.push_str(line);
        payload.push('\n');
    }
    dst.write_uncompressed(db, payload.into_bytes().into()).await?;
    Ok(lines.len() as u64)
}

async fn drop_measurement(http: &HttpBackend, db: &str, meas: &str) -> bool {
    let params = vec![
        ("db".to_string(), db.to_string()),
        (
            "q".to_string(),
            format!("DROP MEASUREMENT \"{}\"", meas.replace('"', "\\\"")),
        ),
    ];
    let result = http.query(Method::POST, &params).await;
    let ok = result.err.is_none() && result.status.is_success();
    if !ok {
        warn!(url = %http.url, db, meas, "drop measurement failed");
    }
    ok
}

async fn fetch_field_types(
    src: &HttpBackend,
    db: &str,
    meas: &str,
) -> Result<HashMap<String, String>, backend::Error> {
    let series = fetch_series(
        src,
        db,
        &format!("SHOW FIELD KEYS FROM \"{}\"", meas.replace('"', "\\\"")),
    )
    .await?;
    let mut types = HashMap::new();
    for s in series {
        for row in &s.values {
            if let [serde_json::Value::String(key), serde_json::Value::String(ty)] = &row[..] {
                types.insert(key.clone(), ty.clone());
            }
        }
    }
    Ok(types)
}

async fn fetch_series(
    src: &HttpBackend,
    db: &str,
    q: &str,
) -> Result<Vec<Series>, backend::Error> {
    let params = vec![
        ("db".to_string(), db.to_string()),
        ("q".to_string(), q.to_string()),
        ("epoch".to_string(), "ns".to_string()),
    ];
    let result = src.query(Method::GET, &params).await;
    if let Some(err) = result.err {
        return Err(backend::Error::Query(err));
    }
    if !result.status.is_success() {
        return Err(backend::Error::Query(format!("status {}", result.status)));
    }
    let body: QueryBody = serde_json::from_slice(&result.body)
        .map_err(|e| backend::Error::Query(format!("invalid query response: {e}")))?;
    let mut series = Vec::new();
    for r in body.results {
        if let Some(err) = r.error {
            return Err(backend::Error::Query(err));
        }
        series.extend(r.series);
    }
    Ok(series)
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    #[serde(default)]
    results: Vec<QueryResultBody>,
}

#[derive(Debug, Deserialize)]
struct QueryResultBody {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    name: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Rebuild line protocol from one JSON series. Integer fields get their `i`
/// suffix back from the `SHOW FIELD KEYS` types so the destination keeps
/// the schema.
fn series_to_lines(series: &Series, field_types: &HashMap<String, String>) -> Vec<String> {
    let time_idx = series.columns.iter().position(|c| c == "time");
    let mut tag_part = String::new();
    for (k, v) in &series.tags {
        if v.is_empty() {
            continue;
        }
        tag_part.push(',');
        tag_part.push_str(&escape_tag(k));
        tag_part.push('=');
        tag_part.push_str(&escape_tag(v));
    }

    let mut lines = Vec::with_capacity(series.values.len());
    for row in &series.values {
        let mut fields = String::new();
        for (idx, value) in row.iter().enumerate() {
            if Some(idx) == time_idx || value.is_null() {
                continue;
            }
            let Some(column) = series.columns.get(idx) else {
                continue;
            };
            if !fields.is_empty() {
                fields.push(',');
            }
            fields.push_str(&escape_tag(column));
            fields.push('=');
            fields.push_str(&field_value(column, value, field_types));
        }
        if fields.is_empty() {
            continue;
        }
        let mut line = format!("{}{} {}", escape_measurement(&series.name), tag_part, fields);
        if let Some(serde_json::Value::Number(ts)) = time_idx.and_then(|i| row.get(i)) {
            line.push(' ');
            line.push_str(&ts.to_string());
        }
        lines.push(line);
    }
    lines
}

fn field_value(
    column: &str,
    value: &serde_json::Value,
    field_types: &HashMap<String, String>,
) -> String {
    match value {
        serde_json::Value::String(s) => {
            format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
        }
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => {
            if field_types.get(column).map(String::as_str) == Some("integer") {
                format!("{n}i")
            } else {
                n.to_string()
            }
        }
        other => other.to_string(),
    }
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
