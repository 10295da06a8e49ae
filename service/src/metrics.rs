//! Prometheus exposition for the proxy, served on `GET /metrics`.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .expect("metric definition is static and valid");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
}

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter =
        IntCounter::with_opts(Opts::new(name, help)).expect("metric definition is static and valid");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
}

fn register_gauge(name: &str, help: &str) -> IntGauge {
    let gauge =
        IntGauge::with_opts(Opts::new(name, help)).expect("metric definition is static and valid");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
}

pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "influxdb_proxy_http_requests_total",
        "HTTP requests served, by handler and status code",
        &["handler", "status"],
    )
});

pub static POINTS_ROUTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "influxdb_proxy_points_routed_total",
        "line-protocol points accepted and routed to backends",
    )
});

pub static UDP_PACKETS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "influxdb_proxy_udp_packets_total",
        "datagrams accepted on the UDP ingress",
    )
});

pub static MQTT_MESSAGES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "influxdb_proxy_mqtt_messages_total",
        "messages accepted on the MQTT ingress",
    )
});

pub static BACKENDS_INACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_gauge(
        "influxdb_proxy_backends_inactive",
        "backends currently failing their health probe",
    )
});

/// Render the default registry in the text exposition format.
pub fn render() -> Vec<u8> {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::default_registry().gather(), &mut buf) {
        tracing::warn!(error = %e, "metrics encoding failed");
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_text_format() {
        POINTS_ROUTED_TOTAL.inc_by(3);
        HTTP_REQUESTS_TOTAL.with_label_values(&["write", "204"]).inc();
        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("influxdb_proxy_points_routed_total"));
        assert!(text.contains("influxdb_proxy_http_requests_total"));
    }
}
