//! HTTP message relay notifier

use super::{Notifier, NotifyError};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{Map, Value};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the keyed digest of the request body
pub const SIGNATURE_HEADER: &str = "x-relay-signature";

/// Wire shape of a relayed event
#[derive(Debug, Serialize)]
struct RelayEvent<'a> {
    event: &'a str,
    data: &'a Map<String, Value>,
}

/// Posts events to a message relay over HTTP
#[derive(Debug, Clone)]
pub struct RelayNotifier {
    client: reqwest::Client,
    url: String,
    key: String,
}

impl RelayNotifier {
    pub fn new(
        url: impl Into<String>,
        key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            key: key.into(),
        })
    }
}

/// Hex HMAC-SHA256 of the body keyed with the relay key
pub fn sign(key: &str, body: &[u8]) -> Result<String, NotifyError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| NotifyError::Unavailable(format!("invalid relay key: {}", e)))?;
    mac.update(body);
    Ok(format!("{:x}", mac.finalize().into_bytes()))
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn publish(&self, event: &str, payload: Map<String, Value>) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(&RelayEvent { event, data: &payload })?;
        let signature = sign(&self.key, &body)?;

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }

        debug!(event, url = %self.url, "Event relayed");
        Ok(())
    }
}
