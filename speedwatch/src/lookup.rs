//! Route number → feed subscription topic, via the Digitransit routing API.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

pub const DIGITRANSIT_URL: &str = "https://api.digitransit.fi/routing/v2/hsl/gtfs/v1";
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves a human-facing route number to the topic carrying its vehicles.
#[async_trait]
pub trait RouteLookup: Send + Sync {
    async fn topic_for_route(&self, route: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
pub struct RoutesResponse {
    pub data: Option<RoutesData>,
}

#[derive(Debug, Deserialize)]
pub struct RoutesData {
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RouteEntry {
    #[serde(rename = "gtfsId")]
    pub gtfs_id: String,
}

/// Subscription topic for every vehicle serving a route id.
pub fn route_topic(route_id: &str) -> String {
    format!("/hfp/v2/journey/ongoing/vp/+/+/+/{route_id}/#")
}

/// GraphQL query listing bus routes by name.
pub fn routes_query(route: &str) -> String {
    let name = route.replace('\\', "").replace('"', "");
    format!(r#"{{ routes(name: "{name}", transportModes: BUS) {{ gtfsId }} }}"#)
}

/// Pick the route whose GTFS id ends with the route number and build its topic.
pub fn topic_from_response(route: &str, response: &RoutesResponse) -> Result<String> {
    let routes = response
        .data
        .as_ref()
        .map(|d| d.routes.as_slice())
        .unwrap_or_default();

    let entry = routes
        .iter()
        .find(|r| r.gtfs_id.ends_with(route))
        .ok_or_else(|| anyhow!("no route matching {route}"))?;

    let route_id = entry.gtfs_id.strip_prefix("HSL:").unwrap_or(&entry.gtfs_id);
    Ok(route_topic(route_id))
}

/// GraphQL client for the Digitransit routing API.
pub struct DigitransitLookup {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl DigitransitLookup {
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building route lookup client")?;
        Ok(DigitransitLookup {
            url: url.to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl RouteLookup for DigitransitLookup {
    async fn topic_for_route(&self, route: &str) -> Result<String> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({ "query": routes_query(route) }));
        if let Some(key) = &self.api_key {
            request = request.header("digitransit-subscription-key", key);
        }

        let response: RoutesResponse = request
            .send()
            .await
            .with_context(|| format!("querying {}", self.url))?
            .error_for_status()?
            .json()
            .await
            .context("decoding route lookup response")?;

        topic_from_response(route, &response)
    }
}

/// Resolve every configured route. Any failure aborts the whole lookup: a
/// route without a topic cannot be subscribed to.
pub async fn resolve_all(lookup: &dyn RouteLookup, routes: &[String]) -> Result<Vec<String>> {
    if routes.is_empty() {
        bail!("no routes configured");
    }
    let mut topics = Vec::with_capacity(routes.len());
    for route in routes {
        let topic = lookup
            .topic_for_route(route)
            .await
            .with_context(|| format!("resolving route {route}"))?;
        info!(route = %route, topic = %topic, "resolved route");
        topics.push(topic);
    }
    Ok(topics)
}
