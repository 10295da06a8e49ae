//! Ingress surfaces for the proxy: HTTP (optionally TLS), UDP, and MQTT,
//! plus prometheus exposition.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod http;
pub mod metrics;
pub mod mqtt;
pub mod udp;

pub use http::HttpService;
pub use mqtt::{MqttError, MqttService};
pub use udp::UdpService;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use proxy::ProxyConfig;
use std::convert::Infallible;
use std::future::Future;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid listen address {addr}: {source}")]
    InvalidAddr {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http server error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("tls setup error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("no certificates found in {0}")]
    EmptyCert(String),

    #[error("no private key found in {0}")]
    EmptyKey(String),
}

/// Serve the HTTP surface until `shutdown` resolves.
pub async fn serve(
    cfg: &ProxyConfig,
    service: Arc<HttpService>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServeError> {
    let addr = normalize_addr(&cfg.listen_addr)?;
    if cfg.https_enabled {
        serve_https(cfg, addr, service, shutdown).await
    } else {
        serve_http(addr, service, shutdown).await
    }
}

/// Go-style listen addresses omit the host (`:7076`); hyper wants one.
fn normalize_addr(listen_addr: &str) -> Result<SocketAddr, ServeError> {
    let candidate = if listen_addr.starts_with(':') {
        format!("0.0.0.0{listen_addr}")
    } else {
        listen_addr.to_string()
    };
    candidate.parse().map_err(|source| ServeError::InvalidAddr {
        addr: listen_addr.to_string(),
        source,
    })
}

async fn serve_http(
    addr: SocketAddr,
    service: Arc<HttpService>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServeError> {
    let make_svc = make_service_fn(move |_conn: &AddrStream| {
        let service = Arc::clone(&service);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let service = Arc::clone(&service);
                async move { Ok::<_, Infallible>(service.route(req).await) }
            }))
        }
    });
    info!(%addr, "http service listening");
    hyper::Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn serve_https(
    cfg: &ProxyConfig,
    addr: SocketAddr,
    service: Arc<HttpService>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServeError> {
    let tls_config = tls_config(&cfg.https_cert, &cfg.https_key)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "https service listening");

    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            () = &mut shutdown => return Ok(()),
        };
        let acceptor = acceptor.clone();
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(%peer, error = %e, "tls handshake failed");
                    return;
                }
            };
            let result = hyper::server::conn::Http::new()
                .serve_connection(
                    tls_stream,
                    service_fn(move |req| {
                        let service = Arc::clone(&service);
                        async move { Ok::<_, Infallible>(service.route(req).await) }
                    }),
                )
                .await;
            if let Err(e) = result {
                debug!(%peer, error = %e, "https connection error");
            }
        });
    }
}

fn tls_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig, ServeError> {
    let mut cert_reader = BufReader::new(std::fs::File::open(cert_path)?);
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut cert_reader)?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if certs.is_empty() {
        return Err(ServeError::EmptyCert(cert_path.to_string()));
    }

    let mut key_reader = BufReader::new(std::fs::File::open(key_path)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)?;
    if keys.is_empty() {
        let mut key_reader = BufReader::new(std::fs::File::open(key_path)?);
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader)?;
    }
    let key = keys
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| ServeError::EmptyKey(key_path.to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}
