//! Event log - Records what workers report to the core

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::info;

use crate::core::{CoreComponent, Error, Result, WorkerId};

pub const NAME: &str = "event_log";

/// Counts events per topic and logs each one.
#[derive(Default)]
pub struct EventLog {
    counts: RwLock<BTreeMap<String, u64>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, topic: &str) -> u64 {
        self.counts.read().get(topic).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts.read().clone()
    }
}

#[async_trait]
impl CoreComponent for EventLog {
    async fn on_event(&self, origin: WorkerId, topic: &str, data: Value) -> Result<()> {
        *self.counts.write().entry(topic.to_string()).or_insert(0) += 1;
        info!(worker = %origin, topic, %data, "worker event");
        Ok(())
    }

    async fn call(&self, _origin: WorkerId, method: &str, data: Value) -> Result<Value> {
        match method {
            "count" => {
                let topic = data.get("topic").and_then(Value::as_str).unwrap_or_default();
                Ok(json!(self.count(topic)))
            }
            "counts" => Ok(serde_json::to_value(self.snapshot())?),
            other => Err(Error::Lifecycle(format!("event_log: method {other} not supported"))),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let total: u64 = self.counts.read().values().sum();
        info!("📒 Event log closed after {} events", total);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_per_topic() {
        let log = EventLog::new();
        let w = WorkerId::new();
        log.on_event(w, "tick", json!(1)).await.unwrap();
        log.on_event(w, "tick", json!(2)).await.unwrap();
        log.on_event(w, "fill", Value::Null).await.unwrap();

        assert_eq!(log.count("tick"), 2);
        let n = log.call(w, "count", json!({ "topic": "fill" })).await.unwrap();
        assert_eq!(n, json!(1));
    }
}
