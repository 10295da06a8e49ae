//! Entrypoint of the influxdb_proxy binary.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use clap::Parser;
use proxy::transfer::Transfer;
use proxy::{Proxy, ProxyConfig, VERSION};
use service::{HttpService, MqttService, UdpService};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(
    name = "influxdb_proxy",
    version = VERSION,
    about = "Sharded write/query proxy for the InfluxDB 1.x line protocol and InfluxQL dialect"
)]
struct Args {
    /// Proxy config file (YAML, or JSON with a .json extension)
    #[clap(short, long, default_value = "proxy.yaml", env = "INFLUXDB_PROXY_CONFIG")]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = match ProxyConfig::from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("illegal config file {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };
    print_summary(&cfg);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime construction");
    if let Err(e) = runtime.block_on(run(cfg)) {
        error!(error = %e, "proxy exited with error");
        std::process::exit(1);
    }
}

fn print_summary(cfg: &ProxyConfig) {
    info!(version = VERSION, "influxdb proxy starting");
    info!(circles = cfg.circles.len(), hash_key = ?cfg.hash_key, "topology loaded");
    for (id, circle) in cfg.circles.iter().enumerate() {
        info!(circle = id, backends = circle.backends.len(), name = %circle.name, "circle loaded");
    }
    if !cfg.db_list.is_empty() {
        info!(dbs = ?cfg.db_list, "database allowlist enabled");
    }
}

async fn run(cfg: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    let proxy = Arc::new(Proxy::new(&cfg).await?);
    let transfer = Arc::new(Transfer::new(proxy.circles.clone()));

    if cfg.udp_enable {
        let udp = UdpService::new(&cfg, Arc::clone(&proxy));
        tokio::spawn(async move {
            if let Err(e) = udp.run().await {
                error!(error = %e, "udp service failed");
            }
        });
    }

    if cfg.mqtt_enable {
        match &cfg.mqtt {
            Some(mqtt_cfg) => match MqttService::new(mqtt_cfg, Arc::clone(&proxy)) {
                Ok(mqtt) => {
                    tokio::spawn(async move {
                        if let Err(e) = mqtt.run().await {
                            error!(error = %e, "mqtt service failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "mqtt service not started"),
            },
            None => warn!("mqtt_enable set but no mqtt section configured"),
        }
    }

    let http = Arc::new(HttpService::new(&cfg, Arc::clone(&proxy), transfer));
    service::serve(&cfg, http, shutdown_signal()).await?;

    info!("shutting down, draining backends");
    proxy.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "unable to listen for the shutdown signal");
        // Without a signal handler there is nothing to wait for; returning
        // here would tear the server down immediately.
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
