//! Catalog - Everything a slot host can build: strategies and components

use crate::components::{ComponentDescriptor, ComponentRegistry, builtin};
use crate::core::Result;
use crate::strategies::StrategyRegistry;

/// Strategy and component registries, filled before the engine starts.
///
/// The same catalog must be compiled into the control binary, slot
/// processes and remote nodes, since factories cannot cross a process
/// boundary; only names do.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub components: ComponentRegistry,
    pub strategies: StrategyRegistry,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in strategies and components.
    pub fn builtin() -> Result<Self> {
        let mut components = ComponentRegistry::new();
        builtin::register_all(&mut components)?;
        Ok(Self {
            components,
            strategies: StrategyRegistry::builtin(),
        })
    }

    pub fn register_component(&mut self, descriptor: ComponentDescriptor) -> Result<()> {
        self.components.register(descriptor)
    }
}
