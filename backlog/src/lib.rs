//! The per-backend backlog: a disk-backed ordered queue of flush batches
//! that could not be delivered to the remote.
//!
//! Layout under `data_dir/<backend name>/`:
//!
//! * `data` — length-prefixed records, append-only
//! * `meta` — the durable `{producer, consumer}` cursors plus a crc32
//!
//! A record is `escape(db) SP payload` (see [`encode_record`]). The consumer
//! cursor is only advanced after the record has been replayed successfully,
//! so every record is delivered at least once; [`FileBackend::rollback_meta`]
//! un-advances the in-memory read position when a replay write fails.
//!
//! All file I/O happens on one blocking task that exclusively owns the file
//! handles; async callers talk to it over a command channel.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use snafu::{ensure, ResultExt, Snafu};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

const DATA_FILE: &str = "data";
const META_FILE: &str = "meta";
const META_LEN: usize = 8 + 8 + 4;

/// Characters kept verbatim when escaping a database name into a record
/// prefix. Everything else percent-encodes, so the prefix can never contain
/// the space that separates it from the payload.
const DB_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unable to create backlog dir {}: {source}", path.display()))]
    UnableToCreateDir { source: io::Error, path: PathBuf },

    #[snafu(display("unable to open backlog file {}: {source}", path.display()))]
    UnableToOpenFile { source: io::Error, path: PathBuf },

    #[snafu(display("unable to write record length: {source}"))]
    UnableToWriteLength { source: io::Error },

    #[snafu(display("unable to write record data: {source}"))]
    UnableToWriteData { source: io::Error },

    #[snafu(display("unable to read record: {source}"))]
    UnableToReadData { source: io::Error },

    #[snafu(display("unable to write meta: {source}"))]
    UnableToWriteMeta { source: io::Error },

    #[snafu(display("unable to sync backlog: {source}"))]
    UnableToSync { source: io::Error },

    #[snafu(display("record at offset {offset} is truncated"))]
    TruncatedRecord { offset: u64 },

    #[snafu(display("backlog task is gone"))]
    TaskGone,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Escape a database name for use as a record prefix.
pub fn escape_db(db: &str) -> String {
    utf8_percent_encode(db, DB_ESCAPE).to_string()
}

/// Invert [`escape_db`].
pub fn unescape_db(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Build a backlog record: `escape(db) SP payload`.
pub fn encode_record(db: &str, payload: &[u8]) -> Vec<u8> {
    let db = escape_db(db);
    let mut record = Vec::with_capacity(db.len() + 1 + payload.len());
    record.extend_from_slice(db.as_bytes());
    record.push(b' ');
    record.extend_from_slice(payload);
    record
}

/// Split a backlog record back into `(db, payload)`. `None` if the record
/// has no space separator.
pub fn decode_record(record: &[u8]) -> Option<(String, &[u8])> {
    let at = record.iter().position(|&b| b == b' ')?;
    let db = std::str::from_utf8(&record[..at]).ok()?;
    Some((unescape_db(db), &record[at + 1..]))
}

#[derive(Debug)]
enum Request {
    Write(Vec<u8>, oneshot::Sender<Result<()>>),
    Read(oneshot::Sender<Result<Option<Vec<u8>>>>),
    UpdateMeta(oneshot::Sender<Result<()>>),
    RollbackMeta(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Async handle to a backend's backlog files.
#[derive(Debug)]
pub struct FileBackend {
    tx: mpsc::Sender<Request>,
    producer: Arc<AtomicU64>,
    consumer: Arc<AtomicU64>,
}

impl FileBackend {
    /// Open (or create) the backlog for `name` under `data_dir`, repairing
    /// any partially-written tail left by a crash.
    pub async fn new(name: &str, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = data_dir.into().join(name);
        let inner = tokio::task::spawn_blocking(move || Inner::open(&dir))
            .await
            .expect("backlog open task panicked")?;

        let producer = Arc::new(AtomicU64::new(inner.producer));
        let consumer = Arc::new(AtomicU64::new(inner.consumer));

        let (tx, rx) = mpsc::channel(10);
        let task_producer = Arc::clone(&producer);
        let task_consumer = Arc::clone(&consumer);
        tokio::task::spawn_blocking(move || task_main(rx, inner, task_producer, task_consumer));

        Ok(Self {
            tx,
            producer,
            consumer,
        })
    }

    /// Whether undelivered records remain.
    pub fn is_data(&self) -> bool {
        self.producer.load(Ordering::Acquire) > self.consumer.load(Ordering::Acquire)
    }

    /// Append one record.
    pub async fn write(&self, record: Vec<u8>) -> Result<()> {
        self.one_command(|tx| Request::Write(record, tx)).await?
    }

    /// Return the record at the read position and advance the in-memory
    /// pending cursor. The durable consumer cursor moves only on
    /// [`Self::update_meta`].
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        self.one_command(Request::Read).await?
    }

    /// Durably advance the consumer cursor to the pending position. Called
    /// after a successful replay write.
    pub async fn update_meta(&self) -> Result<()> {
        self.one_command(Request::UpdateMeta).await?
    }

    /// Reset the pending position to the durable consumer cursor, so the
    /// last-read record is delivered again.
    pub async fn rollback_meta(&self) -> Result<()> {
        self.one_command(Request::RollbackMeta).await?
    }

    /// Flush both cursors and close the files.
    pub async fn close(&self) -> Result<()> {
        self.one_command(Request::Close).await?
    }

    async fn one_command<F, R>(&self, req: F) -> Result<R>
    where
        F: FnOnce(oneshot::Sender<R>) -> Request,
    {
        let (tx, rx) = oneshot::channel();
        self.tx.send(req(tx)).await.map_err(|_| Error::TaskGone)?;
        rx.await.map_err(|_| Error::TaskGone)
    }
}

fn task_main(
    mut rx: mpsc::Receiver<Request>,
    mut inner: Inner,
    producer: Arc<AtomicU64>,
    consumer: Arc<AtomicU64>,
) {
    while let Some(req) = rx.blocking_recv() {
        let closing = matches!(&req, Request::Close(_));
        // The requester may have gone away; failed sends are fine.
        match req {
            Request::Write(record, tx) => {
                let _ = tx.send(inner.write(&record));
            }
            Request::Read(tx) => {
                let _ = tx.send(inner.read());
            }
            Request::UpdateMeta(tx) => {
                let _ = tx.send(inner.update_meta());
            }
            Request::RollbackMeta(tx) => {
                inner.pending = inner.consumer;
                let _ = tx.send(Ok(()));
            }
            Request::Close(tx) => {
                let _ = tx.send(inner.close());
            }
        }
        producer.store(inner.producer, Ordering::Release);
        consumer.store(inner.consumer, Ordering::Release);
        if closing {
            return;
        }
    }
    // Handle dropped without an explicit close; flush cursors best-effort.
    if let Err(e) = inner.close() {
        warn!(error = %e, "backlog close on drop failed");
    }
}

/// The blocking side: exclusive owner of the `data` and `meta` files.
#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    data: File,
    /// Append offset, equal to the valid length of `data`.
    producer: u64,
    /// Durable replay offset.
    consumer: u64,
    /// In-memory read position, `consumer ..= producer`.
    pending: u64,
}

impl Inner {
    fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).context(UnableToCreateDirSnafu { path: dir })?;
        let data_path = dir.join(DATA_FILE);
        let mut data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .context(UnableToOpenFileSnafu { path: &data_path })?;
        let len = data
            .metadata()
            .context(UnableToOpenFileSnafu { path: &data_path })?
            .len();

        let consumer = match read_meta(&dir.join(META_FILE)) {
            Some((_, consumer)) if consumer <= len => consumer,
            Some((_, consumer)) => {
                warn!(consumer, len, "backlog meta ahead of data file, resetting");
                0
            }
            None => 0,
        };

        // Walk the records from the consumer cursor; a crash can leave a
        // partial record at the tail, which is dropped here (it was never
        // acknowledged as spilled).
        let producer = scan_valid_end(&mut data, consumer, len)?;
        if producer < len {
            warn!(
                valid = producer,
                len, "truncating partially-written backlog tail"
            );
            data.set_len(producer)
                .context(UnableToOpenFileSnafu { path: &data_path })?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            data,
            producer,
            consumer,
            pending: consumer,
        })
    }

    fn write(&mut self, record: &[u8]) -> Result<()> {
        self.data
            .seek(SeekFrom::Start(self.producer))
            .context(UnableToWriteDataSnafu)?;
        self.data
            .write_u32::<BigEndian>(record.len() as u32)
            .context(UnableToWriteLengthSnafu)?;
        self.data
            .write_all(record)
            .context(UnableToWriteDataSnafu)?;
        self.producer += 4 + record.len() as u64;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pending >= self.producer {
            return Ok(None);
        }
        self.data
            .seek(SeekFrom::Start(self.pending))
            .context(UnableToReadDataSnafu)?;
        let len = self
            .data
            .read_u32::<BigEndian>()
            .context(UnableToReadDataSnafu)?;
        ensure!(
            self.pending + 4 + u64::from(len) <= self.producer,
            TruncatedRecordSnafu {
                offset: self.pending
            }
        );
        let mut record = vec![0; len as usize];
        self.data
            .read_exact(&mut record)
            .context(UnableToReadDataSnafu)?;
        self.pending += 4 + u64::from(len);
        Ok(Some(record))
    }

    fn update_meta(&mut self) -> Result<()> {
        self.consumer = self.pending;
        if self.consumer >= self.producer {
            // Fully drained: reclaim the file.
            self.data.set_len(0).context(UnableToWriteDataSnafu)?;
            self.producer = 0;
            self.consumer = 0;
            self.pending = 0;
        }
        self.persist_meta()
    }

    fn persist_meta(&self) -> Result<()> {
        let mut buf = Vec::with_capacity(META_LEN);
        buf.write_u64::<BigEndian>(self.producer)
            .context(UnableToWriteMetaSnafu)?;
        buf.write_u64::<BigEndian>(self.consumer)
            .context(UnableToWriteMetaSnafu)?;
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.write_u32::<BigEndian>(hasher.finalize())
            .context(UnableToWriteMetaSnafu)?;

        self.data.sync_data().context(UnableToSyncSnafu)?;

        let tmp = self.dir.join("meta.tmp");
        let mut f = File::create(&tmp).context(UnableToWriteMetaSnafu)?;
        f.write_all(&buf).context(UnableToWriteMetaSnafu)?;
        f.sync_all().context(UnableToSyncSnafu)?;
        std::fs::rename(&tmp, self.dir.join(META_FILE)).context(UnableToWriteMetaSnafu)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.persist_meta()
    }
}

/// Read `{producer, consumer}` from the meta file; `None` when missing or
/// corrupt (the caller degrades to replay-from-start, never silent loss).
fn read_meta(path: &Path) -> Option<(u64, u64)> {
    let mut buf = Vec::new();
    File::open(path).ok()?.read_to_end(&mut buf).ok()?;
    if buf.len() != META_LEN {
        warn!(path = %path.display(), len = buf.len(), "backlog meta has wrong size");
        return None;
    }
    let mut hasher = Hasher::new();
    hasher.update(&buf[..16]);
    let want = hasher.finalize();
    let mut cursor = &buf[..];
    let producer = cursor.read_u64::<BigEndian>().ok()?;
    let consumer = cursor.read_u64::<BigEndian>().ok()?;
    let got = cursor.read_u32::<BigEndian>().ok()?;
    if got != want {
        warn!(path = %path.display(), "backlog meta checksum mismatch");
        return None;
    }
    Some((producer, consumer))
}

/// Walk length-prefixed records from `start` and return the offset of the
/// last complete record's end.
fn scan_valid_end(data: &mut File, start: u64, len: u64) -> Result<u64> {
    let mut at = start;
    data.seek(SeekFrom::Start(at))
        .context(UnableToReadDataSnafu)?;
    loop {
        if at + 4 > len {
            return Ok(at);
        }
        let record_len = match data.read_u32::<BigEndian>() {
            Ok(n) => u64::from(n),
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(at),
            Err(e) => return Err(Error::UnableToReadData { source: e }),
        };
        if at + 4 + record_len > len {
            return Ok(at);
        }
        at += 4 + record_len;
        data.seek(SeekFrom::Start(at))
            .context(UnableToReadDataSnafu)?;
    }
}
