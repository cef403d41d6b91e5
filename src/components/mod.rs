//! Component registry - Named capability factories and per-worker binding
//!
//! Two kinds live here: core components (one instance, control process) and
//! strategy components (a fresh instance per worker, inside the slot that
//! hosts it). Descriptors are registered before the engine starts and the
//! registry is read-only afterwards.

pub mod builtin;

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{
    BindContext, ComponentHandle, ComponentKind, ConfigMap, CoreComponent, CoreComponentFactory,
    CoreContext, Error, Placement, Result, SlotRequirements, StrategyComponent,
    StrategyComponentFactory, WorkerId, WorkerSpec,
};

#[derive(Clone)]
pub enum ComponentFactory {
    Core(CoreComponentFactory),
    Strategy(StrategyComponentFactory),
}

/// A named factory plus where its instances may live.
#[derive(Clone)]
pub struct ComponentDescriptor {
    pub name: String,
    pub placement: Placement,
    pub factory: ComponentFactory,
}

impl std::fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("placement", &self.placement)
            .finish()
    }
}

impl ComponentDescriptor {
    pub fn core<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&CoreContext) -> Result<Arc<dyn CoreComponent>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            placement: Placement::Any,
            factory: ComponentFactory::Core(Arc::new(factory)),
        }
    }

    pub fn strategy<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&BindContext) -> Result<Arc<dyn StrategyComponent>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            placement: Placement::Any,
            factory: ComponentFactory::Strategy(Arc::new(factory)),
        }
    }

    /// Instances wrap a resource that only exists on this machine
    pub fn local_only(mut self) -> Self {
        self.placement = Placement::LocalOnly;
        self
    }

    pub fn kind(&self) -> ComponentKind {
        match self.factory {
            ComponentFactory::Core(_) => ComponentKind::Core,
            ComponentFactory::Strategy(_) => ComponentKind::Strategy,
        }
    }
}

/// Component registry
#[derive(Debug, Default, Clone)]
pub struct ComponentRegistry {
    /// Registration order is instantiation order
    core: Vec<ComponentDescriptor>,
    strategy: HashMap<String, ComponentDescriptor>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. A name may be used once per kind.
    pub fn register(&mut self, descriptor: ComponentDescriptor) -> Result<()> {
        match descriptor.kind() {
            ComponentKind::Core => {
                if self.core.iter().any(|d| d.name == descriptor.name) {
                    return Err(Error::DuplicateName {
                        kind: "core component",
                        name: descriptor.name,
                    });
                }
                debug!("Registered core component {}", descriptor.name);
                self.core.push(descriptor);
            }
            ComponentKind::Strategy => {
                if self.strategy.contains_key(&descriptor.name) {
                    return Err(Error::DuplicateName {
                        kind: "strategy component",
                        name: descriptor.name,
                    });
                }
                debug!("Registered strategy component {}", descriptor.name);
                self.strategy.insert(descriptor.name.clone(), descriptor);
            }
        }
        Ok(())
    }

    pub fn get(&self, kind: ComponentKind, name: &str) -> Option<&ComponentDescriptor> {
        match kind {
            ComponentKind::Core => self.core.iter().find(|d| d.name == name),
            ComponentKind::Strategy => self.strategy.get(name),
        }
    }

    pub fn core_names(&self) -> Vec<String> {
        self.core.iter().map(|d| d.name.clone()).collect()
    }

    pub fn strategy_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.strategy.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check a spec's component list and derive its placement requirements.
    pub fn validate(&self, spec: &WorkerSpec) -> Result<SlotRequirements> {
        let mut seen = HashSet::new();
        let mut placement = spec.placement;
        for name in &spec.components {
            if !seen.insert(name.as_str()) {
                return Err(Error::Config(format!("component {name} requested twice")));
            }
            let descriptor = self
                .strategy
                .get(name)
                .ok_or_else(|| Error::UnknownComponent(name.clone()))?;
            placement = placement.merge(descriptor.placement);
        }
        Ok(SlotRequirements { placement })
    }

    /// Build one core component.
    pub fn instantiate_core(&self, name: &str, ctx: &CoreContext) -> Result<Arc<dyn CoreComponent>> {
        let descriptor = self
            .get(ComponentKind::Core, name)
            .ok_or_else(|| Error::UnknownComponent(name.to_string()))?;
        let ComponentFactory::Core(factory) = &descriptor.factory else {
            return Err(Error::UnknownComponent(name.to_string()));
        };
        factory(ctx).map_err(|e| Error::Component(format!("core component {name}: {e}")))
    }

    /// Build every core component in registration order. The first failure
    /// aborts and shuts down whatever was already built.
    pub async fn instantiate_all_core(
        &self,
        settings: &BTreeMap<String, ConfigMap>,
        root_dir: &Path,
    ) -> Result<CoreSet> {
        let mut set = CoreSet::default();
        for descriptor in &self.core {
            let ctx = CoreContext {
                name: descriptor.name.clone(),
                config: settings.get(&descriptor.name).cloned().unwrap_or_default(),
                root_dir: root_dir.to_path_buf(),
            };
            match self.instantiate_core(&descriptor.name, &ctx) {
                Ok(instance) => {
                    info!("🧩 Core component {} ready", descriptor.name);
                    set.instances.push((descriptor.name.clone(), instance));
                }
                Err(e) => {
                    set.shutdown_all().await;
                    return Err(e);
                }
            }
        }
        Ok(set)
    }

    /// Freshly instantiate and open every strategy component a worker asks
    /// for. Nothing is shared with other workers. On failure the components
    /// opened so far are closed again.
    pub async fn bind_strategy_components(
        &self,
        worker: WorkerId,
        spec: &WorkerSpec,
        settings: &BTreeMap<String, ConfigMap>,
        root_dir: &Path,
    ) -> Result<BoundComponents> {
        self.validate(spec)?;

        let mut bound = BoundComponents::default();
        for name in &spec.components {
            let Some(ComponentDescriptor {
                factory: ComponentFactory::Strategy(factory),
                ..
            }) = self.strategy.get(name)
            else {
                bound.close_all().await;
                return Err(Error::UnknownComponent(name.clone()));
            };

            let ctx = BindContext {
                worker,
                strategy: spec.strategy.clone(),
                config: settings.get(name).cloned().unwrap_or_default(),
                root_dir: root_dir.to_path_buf(),
            };

            let instance = match factory(&ctx) {
                Ok(instance) => instance,
                Err(e) => {
                    bound.close_all().await;
                    return Err(Error::Component(format!("{name}: {e}")));
                }
            };
            if let Err(e) = instance.open().await {
                bound.close_all().await;
                return Err(Error::Component(format!("{name} open: {e}")));
            }

            bound.entries.push(BoundComponent {
                name: name.clone(),
                instance,
                handle: Uuid::new_v4(),
            });
        }
        Ok(bound)
    }
}

struct BoundComponent {
    name: String,
    instance: Arc<dyn StrategyComponent>,
    handle: Uuid,
}

/// A worker's own strategy-component instances, keyed by name.
#[derive(Default)]
pub struct BoundComponents {
    entries: Vec<BoundComponent>,
}

impl BoundComponents {
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.instance.clone().as_any().downcast::<T>().ok())
    }

    pub fn get_dyn(&self, name: &str) -> Option<Arc<dyn StrategyComponent>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.instance.clone())
    }

    pub fn handles(&self) -> Vec<ComponentHandle> {
        self.entries
            .iter()
            .map(|e| ComponentHandle {
                name: e.name.clone(),
                instance: e.handle,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close in reverse bind order. Failures are logged, never fatal.
    pub async fn close_all(&self) {
        for entry in self.entries.iter().rev() {
            if let Err(e) = entry.instance.close().await {
                warn!("Component {} failed to close: {}", entry.name, e);
            }
        }
    }
}

/// Live core components, in registration order.
#[derive(Default, Clone)]
pub struct CoreSet {
    instances: Vec<(String, Arc<dyn CoreComponent>)>,
}

impl CoreSet {
    pub fn get(&self, name: &str) -> Option<Arc<dyn CoreComponent>> {
        self.instances
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
    }

    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name)?.as_any().downcast::<T>().ok()
    }

    pub fn names(&self) -> Vec<String> {
        self.instances.iter().map(|(n, _)| n.clone()).collect()
    }

    pub async fn on_event(&self, name: &str, origin: WorkerId, topic: &str, data: Value) -> Result<()> {
        let component = self
            .get(name)
            .ok_or_else(|| Error::UnknownComponent(name.to_string()))?;
        component.on_event(origin, topic, data).await
    }

    pub async fn call(&self, name: &str, origin: WorkerId, method: &str, data: Value) -> Result<Value> {
        let component = self
            .get(name)
            .ok_or_else(|| Error::UnknownComponent(name.to_string()))?;
        component.call(origin, method, data).await
    }

    /// Reverse registration order.
    pub async fn shutdown_all(&mut self) {
        while let Some((name, component)) = self.instances.pop() {
            match component.shutdown().await {
                Ok(()) => debug!("Core component {} shut down", name),
                Err(e) => warn!("Core component {} failed to shut down: {}", name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl StrategyComponent for Counter {
        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct Logger;

    #[async_trait]
    impl CoreComponent for Logger {
        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct Broken;

    #[async_trait]
    impl StrategyComponent for Broken {
        async fn open(&self) -> Result<()> {
            Err(Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no exchange")))
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::new();
        reg.register(ComponentDescriptor::strategy("x", |_: &BindContext| {
            Ok(Arc::new(Counter {
                hits: AtomicUsize::new(0),
            }))
        }))
        .unwrap();
        reg
    }

    #[test]
    fn test_duplicate_core_name_rejected() {
        let mut reg = ComponentRegistry::new();
        reg.register(ComponentDescriptor::core("logger", |_: &CoreContext| Ok(Arc::new(Logger))))
            .unwrap();
        let err = reg
            .register(ComponentDescriptor::core("logger", |_: &CoreContext| Ok(Arc::new(Logger))))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));
        assert_eq!(reg.core_names(), vec!["logger".to_string()]);
    }

    #[test]
    fn test_same_name_different_kind_allowed() {
        let mut reg = registry();
        reg.register(ComponentDescriptor::core("x", |_: &CoreContext| Ok(Arc::new(Logger))))
            .unwrap();
        assert!(reg.get(ComponentKind::Core, "x").is_some());
        assert!(reg.get(ComponentKind::Strategy, "x").is_some());
    }

    #[test]
    fn test_validate_unknown_component() {
        let reg = registry();
        let spec = WorkerSpec::new("debug").with_component("missing");
        assert!(matches!(reg.validate(&spec), Err(Error::UnknownComponent(n)) if n == "missing"));
    }

    #[test]
    fn test_validate_local_only_propagates() {
        let mut reg = registry();
        reg.register(
            ComponentDescriptor::strategy("gpu", |_: &BindContext| {
                Ok(Arc::new(Counter {
                    hits: AtomicUsize::new(0),
                }))
            })
            .local_only(),
        )
        .unwrap();
        let spec = WorkerSpec::new("debug").with_component("x").with_component("gpu");
        assert_eq!(reg.validate(&spec).unwrap(), SlotRequirements::local_only());
    }

    #[tokio::test]
    async fn test_strategy_instances_never_shared() {
        let reg = registry();
        let spec = WorkerSpec::new("debug").with_component("x");
        let settings = BTreeMap::new();
        let root = std::env::temp_dir();

        let a = reg
            .bind_strategy_components(WorkerId::new(), &spec, &settings, &root)
            .await
            .unwrap();
        let b = reg
            .bind_strategy_components(WorkerId::new(), &spec, &settings, &root)
            .await
            .unwrap();

        let ca = a.get::<Counter>("x").unwrap();
        let cb = b.get::<Counter>("x").unwrap();
        assert!(!Arc::ptr_eq(&ca, &cb));
        ca.hits.fetch_add(3, Ordering::SeqCst);
        assert_eq!(cb.hits.load(Ordering::SeqCst), 0);
        assert_ne!(a.handles()[0].instance, b.handles()[0].instance);
    }

    #[tokio::test]
    async fn test_failed_open_rolls_back() {
        let closed = Arc::new(Mutex::new(Vec::new()));

        struct Tracked(Arc<Mutex<Vec<&'static str>>>);

        #[async_trait]
        impl StrategyComponent for Tracked {
            async fn close(&self) -> Result<()> {
                self.0.lock().push("tracked");
                Ok(())
            }
            fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }

        let mut reg = ComponentRegistry::new();
        let c = closed.clone();
        reg.register(ComponentDescriptor::strategy("tracked", move |_: &BindContext| {
            Ok(Arc::new(Tracked(c.clone())))
        }))
        .unwrap();
        reg.register(ComponentDescriptor::strategy("broken", |_: &BindContext| Ok(Arc::new(Broken))))
            .unwrap();

        let spec = WorkerSpec::new("debug")
            .with_component("tracked")
            .with_component("broken");
        let err = reg
            .bind_strategy_components(WorkerId::new(), &spec, &BTreeMap::new(), &std::env::temp_dir())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Component(_)));
        assert_eq!(*closed.lock(), vec!["tracked"]);
    }
}
