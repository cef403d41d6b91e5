//! Debug strategy - ticks, pokes its debug component, reports to the core

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::components::builtin::{DebugComponent, Persistence, debug as debug_component, event_log, persistence};
use crate::core::{ConfigMap, Error, Result, Strategy, WorkerEvent};
use crate::slots::WorkerContext;

pub const NAME: &str = "debug";

pub struct DebugStrategy {
    tick: Duration,
    /// Stop on our own after this many ticks
    max_ticks: Option<u64>,
    /// Send a `tick` event to the `event_log` core component
    report: bool,
    ticks: u64,
}

impl DebugStrategy {
    pub fn from_config(config: &ConfigMap) -> Result<Self> {
        let tick_ms = match config.get("tick_ms") {
            None => 1_000,
            Some(v) => v
                .as_u64()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| Error::Config(format!("tick_ms must be a positive integer, got {v}")))?,
        };
        Ok(Self {
            tick: Duration::from_millis(tick_ms),
            max_ticks: config.get("max_ticks").and_then(Value::as_u64),
            report: config.get("report").and_then(Value::as_bool).unwrap_or(true),
            ticks: 0,
        })
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[async_trait]
impl Strategy for DebugStrategy {
    async fn initialize(&mut self, ctx: &WorkerContext) -> Result<()> {
        if let Some(store) = ctx.component::<Persistence>(persistence::NAME) {
            self.ticks = store.get("ticks").and_then(|v| v.as_u64()).unwrap_or(0);
        }
        info!("DebugStrategy {} running from tick {}", ctx.id(), self.ticks);
        Ok(())
    }

    async fn on_event(&mut self, ctx: &WorkerContext, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Tick => {
                self.ticks += 1;
                if let Some(debug) = ctx.component::<DebugComponent>(debug_component::NAME) {
                    debug.debug_call();
                }
                if let Some(store) = ctx.component::<Persistence>(persistence::NAME) {
                    store.set("ticks", self.ticks);
                }
                if self.report
                    && let Err(e) = ctx.notify_core(event_log::NAME, "tick", json!({ "ticks": self.ticks }))
                {
                    warn!("DebugStrategy {} could not report tick: {}", ctx.id(), e);
                }
                if self.max_ticks.is_some_and(|max| self.ticks >= max) {
                    info!("DebugStrategy {} reached {} ticks", ctx.id(), self.ticks);
                    ctx.request_stop();
                }
            }
            WorkerEvent::Message { topic, data } => {
                info!("DebugStrategy {} received {}: {}", ctx.id(), topic, data);
                if topic == "stop" {
                    ctx.request_stop();
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self, ctx: &WorkerContext) -> Result<()> {
        info!("DebugStrategy {} stopping after {} ticks", ctx.id(), self.ticks);
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.tick)
    }
}
