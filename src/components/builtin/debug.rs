//! Debug strategy component - logs its hooks and counts calls

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::core::{Result, StrategyComponent, WorkerId};

pub const NAME: &str = "debug";

pub struct DebugComponent {
    worker: WorkerId,
    calls: AtomicU64,
}

impl DebugComponent {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            calls: AtomicU64::new(0),
        }
    }

    pub fn debug_call(&self) -> u64 {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Debug component for worker {} call #{}", self.worker, n);
        n
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StrategyComponent for DebugComponent {
    async fn open(&self) -> Result<()> {
        info!("Debug component for worker {} opened", self.worker);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!(
            "Debug component for worker {} closed after {} calls",
            self.worker,
            self.calls()
        );
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
