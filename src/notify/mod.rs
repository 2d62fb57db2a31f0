//! Change notifications
//!
//! A [`Notifier`] delivers "these tables changed" events to other
//! subsystems once a unit of work is durable. Delivery is best effort:
//! callers log failures and never retry.

pub mod relay;

pub use relay::RelayNotifier;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

/// Event published once per changed table
pub const TABLE_CHANGE_EVENT: &str = "table_change";

/// Event published once per commit when notifications are batched
pub const TABLE_CHANGES_EVENT: &str = "table_changes";

/// Notification delivery failures
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Relay request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Relay rejected event with status {0}")]
    Rejected(u16),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Notifier unavailable: {0}")]
    Unavailable(String),
}

/// External event sink
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, event: &str, payload: Map<String, Value>) -> Result<(), NotifyError>;
}

/// Payload of a per-table change event
pub fn table_change_payload(table: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("table".to_string(), Value::String(table.to_string()));
    payload
}

/// Payload of a batched change event, tables in the given order
pub fn table_changes_payload<'a>(
    tables: impl IntoIterator<Item = &'a String>,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(
        "tables".to_string(),
        Value::Array(tables.into_iter().cloned().map(Value::String).collect()),
    );
    payload
}

/// Notifier used when no relay is configured
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, event: &str, payload: Map<String, Value>) -> Result<(), NotifyError> {
        let payload = Value::Object(payload);
        info!(event, %payload, "Change event");
        Ok(())
    }
}

#[cfg(test)]
pub use recording::RecordingNotifier;

#[cfg(test)]
mod recording {
    use super::{Notifier, NotifyError};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Notifier that keeps every published event in memory
    #[derive(Default)]
    pub struct RecordingNotifier {
        events: Mutex<Vec<(String, Map<String, Value>)>>,
        failing: bool,
        delay: Option<Duration>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Records events but reports every delivery as failed
        pub fn failing() -> Self {
            Self {
                failing: true,
                ..Self::default()
            }
        }

        /// Records events after sleeping for `delay`
        pub fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn events(&self) -> Vec<(String, Map<String, Value>)> {
            self.events.lock().unwrap().clone()
        }

        /// Table names carried by `table_change` events, in publish order
        pub fn tables(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|(_, payload)| {
                    payload.get("table").and_then(|t| t.as_str().map(String::from))
                })
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn publish(
            &self,
            event: &str,
            payload: Map<String, Value>,
        ) -> Result<(), NotifyError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.events.lock().unwrap().push((event.to_string(), payload));
            if self.failing {
                return Err(NotifyError::Unavailable("recording notifier set to fail".to_string()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_payload_shapes() {
        assert_eq!(
            Value::Object(table_change_payload("comp_rulesets_nodes")),
            serde_json::json!({"table": "comp_rulesets_nodes"})
        );

        let tables = vec!["comp_status".to_string(), "nodes".to_string()];
        assert_eq!(
            Value::Object(table_changes_payload(&tables)),
            serde_json::json!({"tables": ["comp_status", "nodes"]})
        );
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_events() {
        let notifier = LogNotifier;
        assert!(notifier
            .publish(TABLE_CHANGE_EVENT, table_change_payload("nodes"))
            .await
            .is_ok());
    }
}
