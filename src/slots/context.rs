//! Worker context - what a running strategy can reach

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;

use crate::components::BoundComponents;
use crate::core::{ComponentHandle, Error, Result, SlotId, StrategyComponent, WorkerId};
use crate::ipc::{Channel, Payload, Target};

/// Handed to every strategy callback.
#[derive(Clone)]
pub struct WorkerContext {
    id: WorkerId,
    strategy: String,
    slot: SlotId,
    components: Arc<BoundComponents>,
    control: Channel,
    call_timeout: Duration,
    stop: Arc<StopSignal>,
}

#[derive(Default)]
pub(crate) struct StopSignal {
    requested: AtomicBool,
    wake: Notify,
}

impl StopSignal {
    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        self.wake.notified().await
    }
}

impl WorkerContext {
    pub(crate) fn new(
        id: WorkerId,
        strategy: String,
        slot: SlotId,
        components: Arc<BoundComponents>,
        control: Channel,
        call_timeout: Duration,
    ) -> Self {
        Self {
            id,
            strategy,
            slot,
            components,
            control,
            call_timeout,
            stop: Arc::new(StopSignal::default()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// This worker's own instance of a bound strategy component.
    pub fn component<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.components.get::<T>(name)
    }

    pub fn component_dyn(&self, name: &str) -> Option<Arc<dyn StrategyComponent>> {
        self.components.get_dyn(name)
    }

    /// Fire-and-forget event to a core component in the control process.
    pub fn notify_core(&self, component: &str, topic: &str, data: Value) -> Result<()> {
        self.control.notify(
            Target::Core,
            Payload::CoreEvent {
                origin: self.id,
                component: component.to_string(),
                topic: topic.to_string(),
                data,
            },
        )
    }

    /// Call a core component and wait for its answer.
    pub async fn call_core(&self, component: &str, method: &str, data: Value) -> Result<Value> {
        let payload = Payload::CoreCall {
            origin: self.id,
            component: component.to_string(),
            method: method.to_string(),
            data,
        };
        match self.control.request(Target::Core, payload, self.call_timeout).await? {
            Payload::Ack { data } => Ok(data),
            other => Err(Error::Transport(format!("unexpected {} answer to core call", other.name()))),
        }
    }

    /// Ask the hosting slot to stop this worker at the next safe point.
    pub fn request_stop(&self) {
        self.stop.requested.store(true, Ordering::Release);
        self.stop.wake.notify_one();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    pub fn handles(&self) -> Vec<ComponentHandle> {
        self.components.handles()
    }

    pub(crate) async fn close_components(&self) {
        self.components.close_all().await
    }

    pub(crate) fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }
}
