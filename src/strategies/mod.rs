//! Strategy registry - Strategy implementations selected by name

pub mod debug;

pub use debug::DebugStrategy;

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{ConfigMap, Error, Result, Strategy, StrategyFactory};

/// Maps a strategy name to the factory that builds it.
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `debug` strategy.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.factories.insert(
            debug::NAME.to_string(),
            Arc::new(|config: &ConfigMap| Ok(Box::new(DebugStrategy::from_config(config)?) as Box<dyn Strategy>)),
        );
        reg
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ConfigMap) -> Result<Box<dyn Strategy>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::DuplicateName {
                kind: "strategy",
                name,
            });
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build(&self, name: &str, config: &ConfigMap) -> Result<Box<dyn Strategy>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))?;
        factory(config)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_strategy() {
        let reg = StrategyRegistry::builtin();
        assert!(reg.contains("debug"));
        assert!(matches!(
            reg.build("grid", &ConfigMap::new()),
            Err(Error::UnknownStrategy(n)) if n == "grid"
        ));
    }

    #[test]
    fn test_duplicate_strategy() {
        let mut reg = StrategyRegistry::builtin();
        let err = reg
            .register("debug", |c: &ConfigMap| Ok(Box::new(DebugStrategy::from_config(c)?) as Box<dyn Strategy>))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName { kind: "strategy", .. }));
    }
}
