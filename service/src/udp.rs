//! UDP ingress: every datagram is a line-protocol payload for the
//! configured database.

use backend::Pool;
use line_protocol::Precision;
use proxy::{Proxy, ProxyConfig};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::metrics;

/// Datagrams larger than this are truncated by the socket; matches the
/// buffer the stock collectors use.
const DATAGRAM_WIDTH: usize = 2048;
const POOL_CAPACITY: usize = 2048;

#[derive(Debug)]
pub struct UdpService {
    proxy: Arc<Proxy>,
    bind: String,
    db: String,
    precision: Precision,
    pool_size: usize,
    write_tracing: bool,
}

impl UdpService {
    pub fn new(cfg: &ProxyConfig, proxy: Arc<Proxy>) -> Self {
        Self {
            proxy,
            bind: cfg.udp_bind.clone(),
            db: cfg.udp_database.clone(),
            precision: cfg.udp_precision.parse().unwrap_or_default(),
            pool_size: cfg.udp_pool_size,
            write_tracing: cfg.write_tracing,
        }
    }

    /// Bind the socket and pump datagrams until the process exits. Receive
    /// buffers are recycled through a [`Pool`]; processing is bounded so a
    /// slow backend cannot pile up unbounded tasks.
    pub async fn run(self) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind(&self.bind).await?);
        info!(db = %self.db, bind = %self.bind, "udp service listening");

        let this = Arc::new(self);
        let buffers = Arc::new(Pool::new(POOL_CAPACITY, DATAGRAM_WIDTH));
        let workers = Arc::new(Semaphore::new(this.pool_size.max(1)));

        loop {
            let mut buf = buffers.get();
            let n = match socket.recv_from(&mut buf).await {
                Ok((n, _peer)) => n,
                Err(e) => {
                    warn!(error = %e, "udp receive failed");
                    buffers.put(buf);
                    continue;
                }
            };
            let permit = Arc::clone(&workers)
                .acquire_owned()
                .await
                .expect("udp worker semaphore is never closed");
            let this = Arc::clone(&this);
            let buffers = Arc::clone(&buffers);
            tokio::spawn(async move {
                let _permit = permit;
                this.process(&buf[..n]).await;
                buffers.put(buf);
            });
        }
    }

    async fn process(&self, payload: &[u8]) {
        metrics::UDP_PACKETS_TOTAL.inc();
        if self.write_tracing {
            info!(db = %self.db, bytes = payload.len(), "udp write");
        }
        if let Err(e) = self.proxy.write(payload, &self.db, self.precision).await {
            error!(db = %self.db, error = %e, "udp write failed");
        }
    }
}
