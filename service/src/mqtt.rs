//! MQTT ingress: subscribes to every topic on the configured broker and
//! turns each JSON payload into one point — the topic is the measurement,
//! the JSON object's entries are the fields, the tag set is empty, and the
//! timestamp is taken at arrival.

use line_protocol::Precision;
use proxy::{MqttConfig, Proxy};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("invalid mqtt server url: {0}")]
    InvalidServer(#[from] url::ParseError),

    #[error("mqtt server url has no host")]
    MissingHost,

    #[error("db cannot find in db list")]
    ForbiddenDb,

    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[derive(Debug)]
pub struct MqttService {
    proxy: Arc<Proxy>,
    cfg: MqttConfig,
    precision: Precision,
}

impl MqttService {
    pub fn new(cfg: &MqttConfig, proxy: Arc<Proxy>) -> Result<Self, MqttError> {
        if !proxy.is_db_allowed(&cfg.db) {
            return Err(MqttError::ForbiddenDb);
        }
        let precision = cfg.precision.parse().unwrap_or_default();
        Ok(Self {
            proxy,
            cfg: cfg.clone(),
            precision,
        })
    }

    pub async fn run(self) -> Result<(), MqttError> {
        let server = url::Url::parse(&self.cfg.server)?;
        let host = server.host_str().ok_or(MqttError::MissingHost)?.to_string();
        let port = server.port().unwrap_or(1883);

        let client_id = if self.cfg.client_id.is_empty() {
            format!("influxdb-proxy-{}", uuid::Uuid::new_v4())
        } else {
            self.cfg.client_id.clone()
        };
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if !self.cfg.user.is_empty() {
            options.set_credentials(self.cfg.user.clone(), self.cfg.password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        client.subscribe("#", qos(self.cfg.qos)).await?;
        info!(server = %self.cfg.server, db = %self.cfg.db, "mqtt service subscribed");

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    // rumqttc reconnects on the next poll; don't spin.
                    warn!(error = %e, "mqtt connection error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle(&self, topic: &str, payload: &[u8]) {
        let fields: serde_json::Map<String, serde_json::Value> =
            match serde_json::from_slice(payload) {
                Ok(fields) => fields,
                Err(e) => {
                    debug!(topic, error = %e, "payload parsing error");
                    return;
                }
            };

        let Some(line) = build_line(topic, &fields, self.precision) else {
            debug!(topic, "payload carries no usable fields");
            return;
        };
        metrics::MQTT_MESSAGES_TOTAL.inc();
        if let Err(e) = self
            .proxy
            .write(line.as_bytes(), &self.cfg.db, self.precision)
            .await
        {
            error!(topic, error = %e, "mqtt write failed");
        }
    }
}

fn qos(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Format one line-protocol record from a flat JSON object. Nested values
/// are skipped; a payload with no scalar entries yields nothing.
fn build_line(
    topic: &str,
    fields: &serde_json::Map<String, serde_json::Value>,
    precision: Precision,
) -> Option<String> {
    let mut rendered = String::new();
    for (key, value) in fields {
        let value = match value {
            serde_json::Value::String(s) => {
                format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            }
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => continue,
        };
        if !rendered.is_empty() {
            rendered.push(',');
        }
        rendered.push_str(&escape_key(key));
        rendered.push('=');
        rendered.push_str(&value);
    }
    if rendered.is_empty() {
        return None;
    }

    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64;
    let timestamp = now_ns / precision_divisor(precision);
    Some(format!(
        "{} {} {}",
        escape_measurement(topic),
        rendered,
        timestamp
    ))
}

fn precision_divisor(precision: Precision) -> i64 {
    match precision {
        Precision::Nanoseconds => 1,
        Precision::Microseconds => 1_000,
        Precision::Milliseconds => 1_000_000,
        Precision::Seconds => 1_000_000_000,
        Precision::Minutes => 60 * 1_000_000_000,
        Precision::Hours => 3_600 * 1_000_000_000,
    }
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(key: &str) -> String {
    key.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(json: &str) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn json_payload_becomes_a_point() {
        let line = build_line(
            "sensors/room a",
            &fields(r#"{"temp": 21.5, "ok": true, "note": "dry"}"#),
            Precision::Nanoseconds,
        )
        .unwrap();
        let (head, ts) = line.rsplit_once(' ').unwrap();
        assert_eq!(head, "sensors/room\\ a note=\"dry\",ok=true,temp=21.5");
        assert!(ts.parse::<i64>().unwrap() > 0);
    }

    #[test]
    fn nested_values_are_skipped() {
        assert!(build_line(
            "t",
            &fields(r#"{"nested": {"a": 1}, "list": [1]}"#),
            Precision::Nanoseconds
        )
        .is_none());
    }

    #[test]
    fn timestamp_respects_precision() {
        let line = build_line("t", &fields(r#"{"v": 1}"#), Precision::Seconds).unwrap();
        let ts: i64 = line.rsplit_once(' ').unwrap().1.parse().unwrap();
        // Seconds since the epoch, not nanoseconds.
        assert!(ts < 10_000_000_000);
    }
}
