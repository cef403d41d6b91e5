//! Core traits - Capability contracts for strategies and components

use crate::core::{ConfigMap, Error, Result, WorkerId};
use crate::slots::WorkerContext;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// What a running strategy reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Fired every `tick_interval()`
    Tick,
    /// Delivered by the control process
    Message { topic: String, data: Value },
}

/// Trading strategy trait
///
/// A strategy is selected by name from the strategy registry and driven by
/// its hosting slot: `initialize` once, `on_event` for every tick or
/// delivered message, `shutdown` once when stopped.
#[async_trait]
pub trait Strategy: Send {
    /// Called after the worker's strategy components are opened
    async fn initialize(&mut self, ctx: &WorkerContext) -> Result<()>;

    async fn on_event(&mut self, ctx: &WorkerContext, event: WorkerEvent) -> Result<()>;

    /// Called before the worker's strategy components are closed
    async fn shutdown(&mut self, ctx: &WorkerContext) -> Result<()>;

    /// Tick period, `None` for purely event-driven strategies
    fn tick_interval(&self) -> Option<Duration> {
        None
    }
}

/// Per-worker capability living next to the worker.
#[async_trait]
pub trait StrategyComponent: Any + Send + Sync {
    /// Called after construction, before the strategy initializes
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Called after the strategy shut down
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Singleton capability living in the control process.
#[async_trait]
pub trait CoreComponent: Any + Send + Sync {
    /// Fire-and-forget notification from a worker
    async fn on_event(&self, _origin: WorkerId, _topic: &str, _data: Value) -> Result<()> {
        Ok(())
    }

    /// Request from a worker expecting an answer
    async fn call(&self, _origin: WorkerId, method: &str, _data: Value) -> Result<Value> {
        Err(Error::Lifecycle(format!("method {method} not supported")))
    }

    /// Called at engine shutdown, in reverse registration order
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Handed to a strategy-component factory inside the hosting process.
#[derive(Debug, Clone)]
pub struct BindContext {
    pub worker: WorkerId,
    pub strategy: String,
    /// `[components.<name>]` from the engine config
    pub config: ConfigMap,
    pub root_dir: PathBuf,
}

/// Handed to a core-component factory at engine start.
#[derive(Debug, Clone)]
pub struct CoreContext {
    pub name: String,
    pub config: ConfigMap,
    pub root_dir: PathBuf,
}

pub type StrategyComponentFactory =
    Arc<dyn Fn(&BindContext) -> Result<Arc<dyn StrategyComponent>> + Send + Sync>;

pub type CoreComponentFactory =
    Arc<dyn Fn(&CoreContext) -> Result<Arc<dyn CoreComponent>> + Send + Sync>;

pub type StrategyFactory = Arc<dyn Fn(&ConfigMap) -> Result<Box<dyn Strategy>> + Send + Sync>;
