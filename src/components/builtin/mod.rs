//! Built-in components shipped with the orchestrator

pub mod api_keys;
pub mod debug;
pub mod event_log;
pub mod persistence;

pub use api_keys::ApiKeys;
pub use debug::DebugComponent;
pub use event_log::EventLog;
pub use persistence::Persistence;

use std::sync::Arc;

use super::{ComponentDescriptor, ComponentRegistry};
use crate::core::{BindContext, CoreContext, Result};

/// Register `api_keys`, `event_log`, `persistence` and `debug`.
pub fn register_all(registry: &mut ComponentRegistry) -> Result<()> {
    registry.register(ComponentDescriptor::core(api_keys::NAME, |ctx: &CoreContext| {
        Ok(Arc::new(ApiKeys::open(ctx)?))
    }))?;
    registry.register(ComponentDescriptor::core(event_log::NAME, |_: &CoreContext| {
        Ok(Arc::new(EventLog::new()))
    }))?;
    // Writes to the local filesystem of the control machine
    registry.register(
        ComponentDescriptor::strategy(persistence::NAME, |ctx: &BindContext| {
            Ok(Arc::new(Persistence::new(ctx)))
        })
        .local_only(),
    )?;
    registry.register(ComponentDescriptor::strategy(debug::NAME, |ctx: &BindContext| {
        Ok(Arc::new(DebugComponent::new(ctx.worker)))
    }))?;
    Ok(())
}
