//! Per-worker JSON store on disk

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::core::{BindContext, ConfigMap, Result, StrategyComponent};

pub const NAME: &str = "persistence";

/// Folder name template; `${STRATEGY_NAME}` and `${WORKER_ID}` are substituted.
const DEFAULT_NAME: &str = "${STRATEGY_NAME}_${WORKER_ID}";

/// Persistent worker data, kept in `data.json`.
///
/// `open` loads the file, `close` writes it back.
pub struct Persistence {
    dir: PathBuf,
    data: Mutex<ConfigMap>,
}

impl Persistence {
    pub fn new(ctx: &BindContext) -> Self {
        let name = ctx
            .config
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_NAME)
            .replace("${STRATEGY_NAME}", &ctx.strategy)
            .replace("${WORKER_ID}", &ctx.worker.to_string());

        let dir = ctx
            .config
            .get("root")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| ctx.root_dir.join("components").join(NAME))
            .join(name);

        Self {
            dir,
            data: Mutex::new(ConfigMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self) -> PathBuf {
        self.dir.join("data.json")
    }

    /// Read `data.json`, creating an empty one when missing.
    pub async fn load(&self) -> Result<ConfigMap> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = self.file();
        if !tokio::fs::try_exists(&file).await? {
            tokio::fs::write(&file, "{}").await?;
        }
        let content = tokio::fs::read_to_string(&file).await?;
        let data: ConfigMap = serde_json::from_str(&content)?;
        *self.data.lock() = data.clone();
        Ok(data)
    }

    pub async fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&*self.data.lock())?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.file(), content).await?;
        debug!("Saved {}", self.file().display());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.lock().insert(key.into(), value.into());
    }
}

#[async_trait]
impl StrategyComponent for Persistence {
    async fn open(&self) -> Result<()> {
        self.load().await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        self.save().await
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkerId;

    #[tokio::test]
    async fn test_survives_reopen() {
        let root = std::env::temp_dir().join(format!("aleph-persist-{}", uuid::Uuid::new_v4()));
        let ctx = BindContext {
            worker: WorkerId::new(),
            strategy: "debug".into(),
            config: ConfigMap::new(),
            root_dir: root.clone(),
        };

        let p = Persistence::new(&ctx);
        assert!(p.dir().ends_with(format!("debug_{}", ctx.worker)));
        p.open().await.unwrap();
        p.set("ticks", 7);
        p.close().await.unwrap();

        let again = Persistence::new(&ctx);
        again.open().await.unwrap();
        assert_eq!(again.get("ticks"), Some(Value::from(7)));
        let _ = std::fs::remove_dir_all(root);
    }
}
