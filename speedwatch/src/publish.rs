//! Publishing finished trips to a webhook.
//!
//! HTTP POST of the title, trip summary and rendered SVG as JSON. The
//! receiving end decides where the post goes (social feed, chat, etc.).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use speedwatch_core::Trip;

use crate::render::Rendering;

/// Posts a rendered trip somewhere public.
#[async_trait]
pub trait TripPublisher: Send + Sync {
    async fn publish(&self, trip: &Trip, rendering: &Rendering) -> Result<()>;
}

/// Time allowed for one webhook request, connection included.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Publishes trips to a webhook URL via HTTP POST.
#[derive(Clone)]
pub struct WebhookPublisher {
    url: String,
    client: reqwest::Client,
}

impl WebhookPublisher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(WebhookPublisher {
            url: url.to_string(),
            client,
        })
    }
}

/// JSON body sent for one trip.
pub fn trip_payload(trip: &Trip, title: &str, image_svg: &str) -> Value {
    let (first_seen, last_seen) = trip.time_span().unwrap_or((0, 0));
    json!({
        "title": title,
        "route_number": trip.key.route_number,
        "route_name": trip.key.route_name,
        "operating_day": trip.key.operating_day,
        "start_time": trip.key.start_time,
        "samples": trip.samples.len(),
        "first_seen": first_seen,
        "last_seen": last_seen,
        "max_speed_kmh": trip.max_speed_kmh(),
        "speed_limit_kmh": trip.area.speed_limit,
        "image_svg": image_svg,
    })
}

#[async_trait]
impl TripPublisher for WebhookPublisher {
    async fn publish(&self, trip: &Trip, rendering: &Rendering) -> Result<()> {
        let image = tokio::fs::read_to_string(&rendering.path)
            .await
            .with_context(|| format!("reading {}", rendering.path.display()))?;
        let payload = trip_payload(trip, &rendering.title, &image);

        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("webhook POST failed")?
            .error_for_status()
            .context("webhook rejected the trip")?;

        info!(vehicle = %trip.key, url = %self.url, "published trip");
        Ok(())
    }
}
