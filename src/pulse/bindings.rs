//! Queue binding reconciliation.
//!
//! AMQP 0-9-1 has no way to enumerate the bindings of a queue, so existing
//! bindings are listed through the RabbitMQ management HTTP API. Everything
//! bound to the queue that the current configuration no longer asks for is
//! unbound after the configured keys are (re)bound.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::config::PulseConfig;

/// An `(exchange, routing_key)` binding on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("management API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("management API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid management URL: {0}")]
    InvalidUrl(String),
}

/// Source of the bindings currently attached to a queue.
#[async_trait]
pub trait BindingCatalog: Send + Sync {
    async fn list_bindings(&self, queue: &str) -> Result<Vec<Binding>, BindingError>;
}

#[derive(Debug, Deserialize)]
struct ManagementBinding {
    source: String,
    routing_key: String,
    #[serde(default)]
    destination_type: Option<String>,
}

/// [`BindingCatalog`] backed by the RabbitMQ management API
/// (`GET /api/queues/{vhost}/{queue}/bindings`).
#[derive(Debug, Clone)]
pub struct ManagementApi {
    client: reqwest::Client,
    base_url: Url,
    vhost: String,
    username: String,
    password: Option<String>,
}

impl ManagementApi {
    pub fn new(
        base_url: Url,
        vhost: impl Into<String>,
        username: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            vhost: vhost.into(),
            username: username.into(),
            password,
        }
    }

    /// Builds a client from the broker configuration. The management URL is
    /// taken from `PULSE_MANAGEMENT_URL`, or derived from the broker host.
    pub fn from_config(config: &PulseConfig) -> Result<Self, BindingError> {
        let amqp_url =
            Url::parse(&config.url).map_err(|err| BindingError::InvalidUrl(err.to_string()))?;
        let base_url = match config.management_url.as_deref() {
            Some(explicit) => {
                Url::parse(explicit).map_err(|err| BindingError::InvalidUrl(err.to_string()))?
            }
            None => derive_management_url(&amqp_url)?,
        };
        let password = amqp_url.password().map(percent_decode);
        Ok(Self::new(
            base_url,
            vhost_of(&amqp_url),
            percent_decode(amqp_url.username()),
            password,
        ))
    }

    fn bindings_url(&self, queue: &str) -> Result<Url, BindingError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BindingError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "queues", self.vhost.as_str(), queue, "bindings"]);
        Ok(url)
    }
}

#[async_trait]
impl BindingCatalog for ManagementApi {
    async fn list_bindings(&self, queue: &str) -> Result<Vec<Binding>, BindingError> {
        let url = self.bindings_url(queue)?;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, self.password.as_deref())
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BindingError::Status { status, body });
        }

        let bindings: Vec<ManagementBinding> = response.json().await?;
        Ok(bindings
            .into_iter()
            // The default exchange binding has an empty source and cannot be removed.
            .filter(|b| !b.source.is_empty())
            .filter(|b| b.destination_type.as_deref().is_none_or(|t| t == "queue"))
            .map(|b| Binding::new(b.source, b.routing_key))
            .collect())
    }
}

/// Management endpoint for a broker URL: `https://host` for `amqps`,
/// `http://host:15672` for plain `amqp`.
pub fn derive_management_url(amqp_url: &Url) -> Result<Url, BindingError> {
    let host = amqp_url
        .host_str()
        .ok_or_else(|| BindingError::InvalidUrl(amqp_url.to_string()))?;
    let raw = match amqp_url.scheme() {
        "amqps" => format!("https://{host}/"),
        _ => format!("http://{host}:15672/"),
    };
    Url::parse(&raw).map_err(|err| BindingError::InvalidUrl(err.to_string()))
}

/// Virtual host named by the URL path; `/` when the path is empty.
pub fn vhost_of(amqp_url: &Url) -> String {
    let path = amqp_url.path().trim_start_matches('/');
    if path.is_empty() {
        "/".to_string()
    } else {
        percent_decode(path)
    }
}

fn percent_decode(raw: &str) -> String {
    let escaped = raw.replace('+', "%2B");
    url::form_urlencoded::parse(format!("v={escaped}").as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| raw.to_string())
}

/// Bindings every source sharing `queue` asks for.
pub fn desired_bindings(config: &PulseConfig, queue: &str) -> HashSet<Binding> {
    config
        .sources
        .iter()
        .filter(|source| config.queue_name(source) == queue)
        .flat_map(|source| {
            source
                .routing_keys
                .iter()
                .map(move |key| Binding::new(source.exchange.clone(), key.clone()))
        })
        .collect()
}

/// Existing bindings absent from `desired`, in listing order.
pub fn stale_bindings(existing: &[Binding], desired: &HashSet<Binding>) -> Vec<Binding> {
    let mut seen = HashSet::new();
    existing
        .iter()
        .filter(|binding| !desired.contains(*binding))
        .filter(|binding| seen.insert((*binding).clone()))
        .cloned()
        .collect()
}
