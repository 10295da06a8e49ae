//! End-to-end behavior of the write aggregator against a mock remote:
//! flush triggers, spill-to-backlog, replay, and poison-pill handling.

use backend::{Backend, BackendOptions};
use line_protocol::LinePoint;
use std::path::Path;
use std::time::Duration;

fn options(server_url: &str, dir: &Path, flush_size: usize, flush_time: Duration) -> BackendOptions {
    BackendOptions {
        name: "b0".to_string(),
        url: server_url.to_string(),
        username: String::new(),
        password: String::new(),
        data_dir: dir.to_path_buf(),
        flush_size,
        flush_time,
        check_interval: Duration::from_millis(100),
        rewrite_interval: Duration::from_millis(300),
        conn_pool_size: 4,
        write_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(5),
    }
}

fn point(db: &str, line: &str) -> LinePoint {
    LinePoint {
        db: db.to_string(),
        measurement: line.split([',', ' ']).next().unwrap().to_string(),
        line: line.as_bytes().to_vec(),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn flush_by_size_sends_one_batch() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/ping")
        .with_status(204)
        .expect_at_least(0)
        .create_async()
        .await;
    let write = server
        .mock("POST", "/write")
        .match_query(mockito::Matcher::UrlEncoded("db".into(), "m1".into()))
        .match_body("cpu v=1 1\ncpu v=2 2\ncpu v=3 3\n")
        .with_status(204)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    // Long flush_time: only the size trigger can explain the POST.
    let backend = Backend::new(options(&server.url(), dir.path(), 3, Duration::from_secs(60)))
        .await
        .unwrap();

    for line in ["cpu v=1 1", "cpu v=2 2", "cpu v=3 3"] {
        backend.write_point(point("m1", line)).await.unwrap();
    }
    settle().await;

    write.assert_async().await;
    assert!(!backend.backlog_has_data());
    backend.close().await;
}

#[tokio::test]
async fn flush_by_time_sends_the_partial_batch() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/ping")
        .with_status(204)
        .expect_at_least(0)
        .create_async()
        .await;
    let write = server
        .mock("POST", "/write")
        .match_body("cpu v=1 1\n")
        .with_status(204)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::new(options(
        &server.url(),
        dir.path(),
        1000,
        Duration::from_millis(200),
    ))
    .await
    .unwrap();

    backend.write_point(point("m1", "cpu v=1 1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;

    write.assert_async().await;
    backend.close().await;
}

#[tokio::test]
async fn inactive_backend_spills_then_replays_in_order() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::new(options(
        &server.url(),
        dir.path(),
        1,
        Duration::from_secs(60),
    ))
    .await
    .unwrap();
    backend.set_active(false);

    backend.write_point(point("m1", "cpu v=1 1")).await.unwrap();
    backend.write_point(point("m1", "cpu v=2 2")).await.unwrap();
    settle().await;
    assert!(backend.backlog_has_data());

    // Remote comes back: the health probe reactivates the backend and the
    // rewrite loop drains both spilled batches.
    server
        .mock("GET", "/ping")
        .with_status(204)
        .expect_at_least(1)
        .create_async()
        .await;
    let first = server
        .mock("POST", "/write")
        .match_body("cpu v=1 1\n")
        .with_status(204)
        .create_async()
        .await;
    let second = server
        .mock("POST", "/write")
        .match_body("cpu v=2 2\n")
        .with_status(204)
        .create_async()
        .await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    first.assert_async().await;
    second.assert_async().await;
    assert!(!backend.backlog_has_data());
    assert!(!backend.rewrite_running());
    backend.close().await;
}

#[tokio::test]
async fn transient_write_failure_spills_to_backlog() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/ping")
        .with_status(204)
        .expect_at_least(0)
        .create_async()
        .await;
    server
        .mock("POST", "/write")
        .with_status(503)
        .expect_at_least(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::new(options(
        &server.url(),
        dir.path(),
        1,
        Duration::from_secs(60),
    ))
    .await
    .unwrap();

    backend.write_point(point("m1", "cpu v=1 1")).await.unwrap();
    settle().await;
    assert!(backend.backlog_has_data());
    backend.close().await;
}

#[tokio::test]
async fn poison_pill_on_replay_is_discarded_once() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::new(options(
        &server.url(),
        dir.path(),
        1,
        Duration::from_secs(60),
    ))
    .await
    .unwrap();
    backend.set_active(false);

    backend.write_point(point("m1", "cpu v=bogus")).await.unwrap();
    settle().await;
    assert!(backend.backlog_has_data());

    server
        .mock("GET", "/ping")
        .with_status(204)
        .expect_at_least(1)
        .create_async()
        .await;
    let write = server
        .mock("POST", "/write")
        .match_body("cpu v=bogus\n")
        .with_status(400)
        .expect(1)
        .create_async()
        .await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // The record was rejected, committed past, and never retried.
    write.assert_async().await;
    assert!(!backend.backlog_has_data());
    backend.close().await;
}

#[tokio::test]
async fn close_flushes_buffered_points() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/ping")
        .with_status(204)
        .expect_at_least(0)
        .create_async()
        .await;
    let write = server
        .mock("POST", "/write")
        .match_body("cpu v=9 9\n")
        .with_status(204)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::new(options(
        &server.url(),
        dir.path(),
        1000,
        Duration::from_secs(60),
    ))
    .await
    .unwrap();

    backend.write_point(point("m1", "cpu v=9 9")).await.unwrap();
    backend.close().await;

    write.assert_async().await;

    // Writes after close are refused.
    let err = backend.write_point(point("m1", "cpu v=1 1")).await;
    assert!(err.is_err());
}
