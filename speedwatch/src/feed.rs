//! Vehicle position feed: live MQTT subscription and NDJSON capture files.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Port the broker serves TLS on. Any other port is plain TCP.
pub const TLS_PORT: u16 = 8883;
/// Consecutive connection failures before the subscriber gives up.
pub const MAX_FAILURES: u32 = 10;
const MAX_BACKOFF_SECS: u64 = 30;

/// One raw message from the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Live subscription
// ---------------------------------------------------------------------------

/// MQTT subscriber for a set of topics. Subscriptions are re-sent on every
/// (re)connect.
pub struct FeedSubscriber {
    client: AsyncClient,
    eventloop: rumqttc::EventLoop,
    topics: Vec<String>,
    failures: u32,
}

impl FeedSubscriber {
    pub fn connect(host: &str, port: u16, topics: Vec<String>) -> Self {
        let client_id = format!("speedwatch-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if port == TLS_PORT {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        info!(host, port, topics = topics.len(), "connecting to feed");
        FeedSubscriber {
            client,
            eventloop,
            topics,
            failures: 0,
        }
    }

    /// Wait for the next published message. Connection errors are retried
    /// with backoff; after `MAX_FAILURES` in a row the error is returned.
    pub async fn next_message(&mut self) -> Result<FeedMessage> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.failures = 0;
                    for topic in &self.topics {
                        self.client
                            .try_subscribe(topic.as_str(), QoS::AtMostOnce)
                            .with_context(|| format!("subscribing to {topic}"))?;
                        info!(topic = %topic, "subscribed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(FeedMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    self.failures += 1;
                    if self.failures >= MAX_FAILURES {
                        bail!("feed connection failed {} times: {e}", self.failures);
                    }
                    let backoff = backoff_secs(self.failures);
                    warn!(error = %e, attempt = self.failures, backoff, "feed connection error");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect failed");
        }
    }
}

/// Exponential backoff in seconds, capped.
pub fn backoff_secs(attempt: u32) -> u64 {
    2u64.saturating_pow(attempt.saturating_sub(1)).min(MAX_BACKOFF_SECS)
}

// ---------------------------------------------------------------------------
// Capture files
// ---------------------------------------------------------------------------

/// One line of a capture file. JSON payloads are embedded as-is; anything
/// else is kept as a string.
#[derive(Debug, Serialize, Deserialize)]
pub struct CaptureLine {
    pub topic: String,
    pub payload: Value,
}

impl CaptureLine {
    pub fn from_message(msg: &FeedMessage) -> Self {
        let payload = serde_json::from_slice(&msg.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&msg.payload).into_owned()));
        CaptureLine {
            topic: msg.topic.clone(),
            payload,
        }
    }

    pub fn into_message(self) -> Result<FeedMessage> {
        let payload = match self.payload {
            Value::String(raw) => raw.into_bytes(),
            other => serde_json::to_vec(&other)?,
        };
        Ok(FeedMessage {
            topic: self.topic,
            payload,
        })
    }
}

/// Serialize a message as a single capture line (no trailing newline).
pub fn to_capture_line(msg: &FeedMessage) -> Result<String> {
    Ok(serde_json::to_string(&CaptureLine::from_message(msg))?)
}

/// Parse one capture line. Blank lines yield `None`.
pub fn parse_capture_line(line: &str) -> Result<Option<FeedMessage>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let capture: CaptureLine = serde_json::from_str(line).context("invalid capture line")?;
    capture.into_message().map(Some)
}
