//! Named exchange credentials loaded from `keys.json`

use std::any::Any;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::core::{CoreComponent, CoreContext, Error, Result, WorkerId};

pub const NAME: &str = "api_keys";

/// Credential store. Workers fetch entries with the `get` call.
pub struct ApiKeys {
    path: PathBuf,
    keys: BTreeMap<String, Value>,
}

impl ApiKeys {
    /// Read `<root>/keys.json` (or the `path` setting), writing an example
    /// file first when none exists.
    pub fn open(ctx: &CoreContext) -> Result<Self> {
        let path = ctx
            .config
            .get("path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| ctx.root_dir.join("keys.json"));

        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let example = json!({ "JSON_KEY_EXAMPLE": ["API_KEY_EXAMPLE", "API_SECRET_EXAMPLE"] });
            std::fs::write(&path, serde_json::to_string_pretty(&example)?)?;
            info!("🔑 Wrote example key file {}", path.display());
        }

        let content = std::fs::read_to_string(&path)?;
        let keys: BTreeMap<String, Value> = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to decode {}: {e}", path.display())))?;
        debug!("Loaded {} key entries", keys.len());

        Ok(Self { path, keys })
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.keys.get(name)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl CoreComponent for ApiKeys {
    async fn call(&self, origin: WorkerId, method: &str, data: Value) -> Result<Value> {
        match method {
            "get" => {
                let name = data
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Config("get: missing key".into()))?;
                debug!("Worker {} reads key {}", origin, name);
                self.get_value(name)
                    .cloned()
                    .ok_or_else(|| Error::Config(format!("no key named {name}")))
            }
            other => Err(Error::Lifecycle(format!("api_keys: method {other} not supported"))),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(root: PathBuf) -> CoreContext {
        CoreContext {
            name: NAME.into(),
            config: Default::default(),
            root_dir: root,
        }
    }

    #[tokio::test]
    async fn test_creates_example_file() {
        let root = std::env::temp_dir().join(format!("aleph-keys-{}", uuid::Uuid::new_v4()));
        let keys = ApiKeys::open(&ctx(root.clone())).unwrap();
        assert!(root.join("keys.json").exists());

        let value = keys
            .call(WorkerId::new(), "get", json!({ "key": "JSON_KEY_EXAMPLE" }))
            .await
            .unwrap();
        assert_eq!(value[0], "API_KEY_EXAMPLE");

        assert!(keys.call(WorkerId::new(), "get", json!({ "key": "nope" })).await.is_err());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_corrupt_file_is_config_error() {
        let root = std::env::temp_dir().join(format!("aleph-keys-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("keys.json"), "{not json").unwrap();
        assert!(matches!(ApiKeys::open(&ctx(root.clone())), Err(Error::Config(_))));
        let _ = std::fs::remove_dir_all(root);
    }
}
