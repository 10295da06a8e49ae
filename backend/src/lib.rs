//! The per-backend write engine.
//!
//! Each configured remote gets one [`Backend`]: a worker task that buffers
//! incoming [`LinePoint`]s by destination database, flushes them as batched
//! HTTP writes when a size or time trigger fires, spills failed batches to
//! the on-disk [backlog](backlog), and replays the backlog once the remote
//! comes back.
//!
//! Concurrency discipline: the worker task is the only mutator of the buffer
//! map. Submission tasks own a detached copy of the batch bytes and a
//! semaphore permit bounding outstanding remote I/O; closing the write
//! channel is the one shutdown edge.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod http;
mod pool;

pub use http::{HttpBackend, HttpBackendOptions, QueryResult};
pub use pool::Pool;
pub use reqwest::Method;

use backlog::FileBackend;
use bytes::Bytes;
use line_protocol::LinePoint;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{error, warn};

/// Capacity of the per-backend write channel; enough to decouple ingress
/// from the worker without hiding sustained overload.
const WRITE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    /// The backend's write channel has been closed (shutdown in progress).
    #[error("backend is closed")]
    Closed,

    #[error("backlog failure: {0}")]
    Backlog(#[from] backlog::Error),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("query failed: {0}")]
    Query(String),
}

/// Outcome of a single remote write, per the proxy's error taxonomy:
/// poison-pill rejections are dropped, transient failures spill or retry.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("bad request")]
    BadRequest,

    #[error("not found")]
    NotFound,

    #[error("transient write failure: {0}")]
    Transient(String),
}

impl WriteError {
    /// Whether retrying can never succeed (remote 400/404).
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::BadRequest | Self::NotFound)
    }
}

/// Everything a [`Backend`] needs to know about one configured remote.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub data_dir: PathBuf,
    pub flush_size: usize,
    pub flush_time: Duration,
    pub check_interval: Duration,
    pub rewrite_interval: Duration,
    pub conn_pool_size: usize,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Per-database accumulation buffer. Every line it holds ends in `\n` and
/// `counter` equals the number of lines.
#[derive(Debug, Default)]
struct CacheBuffer {
    buffer: Vec<u8>,
    counter: usize,
}

/// One remote datastore instance: HTTP client, spill log, and the worker
/// that batches writes between them.
#[derive(Debug)]
pub struct Backend {
    http: Arc<HttpBackend>,
    fb: Arc<FileBackend>,
    rewrite_running: Arc<Mutex<bool>>,
    tx: Mutex<Option<mpsc::Sender<LinePoint>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Create the backend and start its worker.
    pub async fn new(opts: BackendOptions) -> Result<Self, Error> {
        let http = HttpBackend::new(HttpBackendOptions {
            name: opts.name.clone(),
            url: opts.url.clone(),
            username: opts.username.clone(),
            password: opts.password.clone(),
            write_timeout: opts.write_timeout,
            idle_timeout: opts.idle_timeout,
            check_interval: opts.check_interval,
        });
        let fb = Arc::new(FileBackend::new(&opts.name, &opts.data_dir).await?);
        let rewrite_running = Arc::new(Mutex::new(false));

        let (tx, rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        let worker = Worker {
            http: Arc::clone(&http),
            fb: Arc::clone(&fb),
            rewrite_running: Arc::clone(&rewrite_running),
            flush_size: opts.flush_size.max(1),
            flush_time: opts.flush_time,
            rewrite_interval: opts.rewrite_interval,
            conn_pool_size: opts.conn_pool_size.max(1),
            sem: Arc::new(Semaphore::new(opts.conn_pool_size.max(1))),
            buffers: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run(rx));

        Ok(Self {
            http,
            fb,
            rewrite_running,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.http.name
    }

    pub fn url(&self) -> &str {
        &self.http.url
    }

    pub fn http(&self) -> &Arc<HttpBackend> {
        &self.http
    }

    pub fn is_active(&self) -> bool {
        self.http.is_active()
    }

    pub fn set_active(&self, active: bool) {
        self.http.set_active(active)
    }

    /// Whether undelivered spilled batches remain.
    pub fn backlog_has_data(&self) -> bool {
        self.fb.is_data()
    }

    /// Whether a rewrite loop is currently replaying the backlog.
    pub fn rewrite_running(&self) -> bool {
        *self.rewrite_running.lock()
    }

    /// Hand one point to the worker. Enqueueing is the durability handoff:
    /// once this returns, the point will be delivered or spilled.
    pub async fn write_point(&self, point: LinePoint) -> Result<(), Error> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(point).await.map_err(|_| Error::Closed),
            None => Err(Error::Closed),
        }
    }

    /// Close the write channel and wait for the worker to flush, drain
    /// in-flight submissions, and shut the subsystems down.
    pub async fn close(&self) {
        self.tx.lock().take();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Per-database replica-placement statistics for `/health`. `urls` are
    /// the circle's backend URLs, indexed as the ring indexes them.
    pub async fn get_health(&self, circle: &sharder::Circle, urls: &[String]) -> HealthReport {
        let mut stats = BTreeMap::new();
        match self.http.get_databases().await {
            Ok(dbs) => {
                for db in dbs {
                    let measurements = match self.http.get_measurements(&db).await {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(db, error = %e, "health: listing measurements failed");
                            continue;
                        }
                    };
                    let mut inplace = 0;
                    let mut incorrect = 0;
                    for meas in &measurements {
                        let owner = circle.get(&sharder::get_key(&db, meas));
                        if urls.get(owner).map(String::as_str) == Some(self.url()) {
                            inplace += 1;
                        } else {
                            incorrect += 1;
                        }
                    }
                    stats.insert(
                        db,
                        DbStats {
                            measurements: measurements.len(),
                            inplace,
                            incorrect,
                        },
                    );
                }
            }
            Err(e) => warn!(url = %self.url(), error = %e, "health: listing databases failed"),
        }
        HealthReport {
            name: self.name().to_string(),
            url: self.url().to_string(),
            active: self.is_active(),
            backlog: self.backlog_has_data(),
            rewrite: self.rewrite_running(),
            stats,
        }
    }
}

/// Health summary of one backend, shaped for the `/health` endpoint.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub name: String,
    pub url: String,
    pub active: bool,
    pub backlog: bool,
    pub rewrite: bool,
    pub stats: BTreeMap<String, DbStats>,
}

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
pub struct DbStats {
    pub measurements: usize,
    pub inplace: usize,
    pub incorrect: usize,
}

/// Fan a query out to every active backend of a replica set. The first
/// transport error aborts; remote HTTP statuses pass through in the results
/// so the caller can relay them.
pub async fn query_in_parallel(
    backends: &[Arc<Backend>],
    method: Method,
    params: &[(String, String)],
) -> Result<(Vec<QueryResult>, usize), Error> {
    let mut inactive = 0;
    let mut futures = Vec::new();
    for backend in backends {
        if !backend.is_active() {
            inactive += 1;
            continue;
        }
        let http = Arc::clone(backend.http());
        let method = method.clone();
        let params = params.to_vec();
        futures.push(async move { http.query(method, &params).await });
    }
    let mut results = Vec::new();
    for qr in futures::future::join_all(futures).await {
        if let Some(err) = qr.err {
            return Err(Error::Query(err));
        }
        results.push(qr);
    }
    Ok((results, inactive))
}

/// The single-writer event loop. Owns the buffer map; nothing else touches
/// it.
struct Worker {
    http: Arc<HttpBackend>,
    fb: Arc<FileBackend>,
    rewrite_running: Arc<Mutex<bool>>,
    flush_size: usize,
    flush_time: Duration,
    rewrite_interval: Duration,
    conn_pool_size: usize,
    sem: Arc<Semaphore>,
    buffers: HashMap<String, CacheBuffer>,
}

enum Event {
    Point(Option<LinePoint>),
    FlushTimer,
    RewriteTick,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<LinePoint>) {
        let mut flush_timer: Option<Pin<Box<Sleep>>> = None;
        let mut rewrite_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.rewrite_interval,
            self.rewrite_interval,
        );
        rewrite_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                point = rx.recv() => Event::Point(point),
                () = async { flush_timer.as_mut().expect("timer is armed").await },
                    if flush_timer.is_some() => Event::FlushTimer,
                _ = rewrite_tick.tick() => Event::RewriteTick,
            };
            match event {
                Event::Point(Some(point)) => self.write_buffer(point, &mut flush_timer).await,
                Event::Point(None) => break,
                Event::FlushTimer => {
                    flush_timer = None;
                    self.flush_all().await;
                }
                Event::RewriteTick => self.rewrite_idle(),
            }
        }

        // Channel closed: final flush, wait out in-flight submissions, then
        // shut the subsystems down in order.
        self.flush_all().await;
        let _all_permits = self
            .sem
            .acquire_many(self.conn_pool_size as u32)
            .await
            .expect("submission semaphore is never closed");
        self.http.close();
        if let Err(e) = self.fb.close().await {
            error!(error = %e, "closing backlog failed");
        }
    }

    async fn write_buffer(&mut self, point: LinePoint, flush_timer: &mut Option<Pin<Box<Sleep>>>) {
        let cb = self.buffers.entry(point.db.clone()).or_default();
        cb.buffer.extend_from_slice(&point.line);
        if point.line.last() != Some(&b'\n') {
            cb.buffer.push(b'\n');
        }
        cb.counter += 1;

        if cb.counter >= self.flush_size {
            self.flush_buffer(&point.db).await;
        } else if flush_timer.is_none() {
            *flush_timer = Some(Box::pin(tokio::time::sleep(self.flush_time)));
        }
    }

    async fn flush_all(&mut self) {
        let dbs: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, cb)| cb.counter > 0)
            .map(|(db, _)| db.clone())
            .collect();
        for db in dbs {
            self.flush_buffer(&db).await;
        }
    }

    /// Detach the database's accumulated batch and submit it. Acquiring the
    /// permit here makes a saturated pool push back on the worker instead of
    /// queueing without bound.
    async fn flush_buffer(&mut self, db: &str) {
        let Some(cb) = self.buffers.get_mut(db) else {
            return;
        };
        let payload = std::mem::take(&mut cb.buffer);
        cb.counter = 0;
        if payload.is_empty() {
            return;
        }
        let permit = Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .expect("submission semaphore is never closed");
        let http = Arc::clone(&self.http);
        let fb = Arc::clone(&self.fb);
        let db = db.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            submit(&http, &fb, &db, payload.into()).await;
        });
    }

    fn rewrite_idle(&self) {
        {
            let mut running = self.rewrite_running.lock();
            if *running || !self.fb.is_data() {
                return;
            }
            *running = true;
        }
        tokio::spawn(rewrite_loop(
            Arc::clone(&self.http),
            Arc::clone(&self.fb),
            Arc::clone(&self.rewrite_running),
            self.rewrite_interval,
        ));
    }
}

/// Deliver one detached batch: straight to the remote when it is healthy,
/// otherwise (or on transient failure) into the backlog. Poison-pill
/// rejections are dropped here; the data can never be delivered.
async fn submit(http: &HttpBackend, fb: &FileBackend, db: &str, payload: Bytes) {
    if http.is_active() {
        match http.write_uncompressed(db, payload.clone()).await {
            Ok(()) => return,
            Err(e) if e.is_poison() => {
                warn!(url = %http.url, db, error = %e, "remote rejected batch, dropping");
                return;
            }
            Err(e) => {
                warn!(url = %http.url, db, len = payload.len(), error = %e, "write failed, spilling");
            }
        }
    }
    if let Err(e) = fb.write(backlog::encode_record(db, &payload)).await {
        error!(db, len = payload.len(), error = %e, "backlog write failed");
    }
}

/// Drain the backlog while data remains, sleeping through inactive periods
/// and transient failures. Exactly one of these runs per backend.
async fn rewrite_loop(
    http: Arc<HttpBackend>,
    fb: Arc<FileBackend>,
    rewrite_running: Arc<Mutex<bool>>,
    interval: Duration,
) {
    while fb.is_data() {
        if !http.is_active() {
            tokio::time::sleep(interval).await;
            continue;
        }
        match rewrite(&http, &fb).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!(url = %http.url, error = %e, "rewrite failed, will retry");
                tokio::time::sleep(interval).await;
            }
        }
    }
    *rewrite_running.lock() = false;
}

/// Replay one backlog record. Success and poison-pill rejections commit the
/// consumer cursor; a transient failure rolls the read back so the same
/// record is retried.
async fn rewrite(http: &HttpBackend, fb: &FileBackend) -> Result<bool, Error> {
    let Some(record) = fb.read().await? else {
        return Ok(false);
    };
    let Some((db, payload)) = backlog::decode_record(&record) else {
        warn!("invalid backlog record, discarding");
        fb.update_meta().await?;
        return Ok(true);
    };
    match http
        .write_uncompressed(&db, Bytes::copy_from_slice(payload))
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_poison() => {
            warn!(url = %http.url, db, error = %e, "remote rejected replayed batch, dropping");
        }
        Err(e) => {
            if let Err(rollback) = fb.rollback_meta().await {
                error!(error = %rollback, "backlog rollback failed");
            }
            return Err(e.into());
        }
    }
    fb.update_meta().await?;
    Ok(true)
}
