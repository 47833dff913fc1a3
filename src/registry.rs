//! Driver classes and their command registries
//!
//! A [`DriverClass`] is the static description of one kind of device: the
//! commands it understands, how to simulate it, how to open its transport and
//! how to check that a freshly opened connection is alive. Classes are built
//! once with a [`DriverClassBuilder`] and then shared (`Arc<DriverClass>`) by
//! every driver instance.
//!
//! Registration synthesizes each command immediately, so a malformed
//! descriptor is reported by the `register` call that introduced it.
//!
//! ## Inheritance
//!
//! [`DriverClass::subclass`] starts a builder whose registry is layered on top
//! of the parent's. Lookup checks the child first, then walks up the chain, so
//! a child registration shadows a parent command of the same name without
//! touching the parent.
//!
//! # Example
//!
//! ```
//! use generic_scpi_driver::{Arg, CommandDescriptor, DriverClass};
//! use generic_scpi_driver::transport::simulator_fn;
//! use generic_scpi_driver::validators::float_range;
//!
//! let class = DriverClass::builder("BenchSupply")
//!     .register_query("get_identity", "*IDN?")?
//!     .register(
//!         CommandDescriptor::new("set_voltage", "VOLT")
//!             .arg(Arg::new("channel"))
//!             .arg(Arg::new("voltage").with_validator(float_range(0.0, 10.0)))
//!             .no_response(),
//!     )?
//!     .register_simulator(|| simulator_fn(|_| Ok("Simulator device".to_string())))
//!     .build();
//!
//! assert!(class.lookup("set_voltage").is_some());
//! # Ok::<(), generic_scpi_driver::DriverError>(())
//! ```

use crate::descriptor::CommandDescriptor;
use crate::driver::Driver;
use crate::error::DriverResult;
use crate::synth::{Method, MethodSignature};
use crate::transport::{
    default_factory, Simulator, SimulatorFactory, Transport, TransportConfig, TransportFactory,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Connection check run once after the transport opens.
pub type HealthCheck = Arc<dyn Fn(&Driver) -> anyhow::Result<()> + Send + Sync>;

/// Synthesized methods of one class, layered over its ancestors' registries.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    parent: Option<Arc<CommandRegistry>>,
    entries: BTreeMap<String, Arc<Method>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry whose lookups fall back to `parent`.
    pub fn with_parent(parent: Arc<CommandRegistry>) -> Self {
        Self {
            parent: Some(parent),
            entries: BTreeMap::new(),
        }
    }

    /// Synthesize `descriptor` and install it, replacing any method of the same
    /// name registered on this layer.
    pub fn register(&mut self, descriptor: CommandDescriptor) -> DriverResult<Arc<Method>> {
        let method = Arc::new(Method::synthesize(descriptor)?);
        let name = method.name().to_string();
        if self.entries.insert(name.clone(), Arc::clone(&method)).is_some() {
            debug!(method = %name, "Replaced registered method");
        } else if self.parent_lookup(&name).is_some() {
            debug!(method = %name, "Shadowed inherited method");
        }
        Ok(method)
    }

    /// Find a method by name; this layer wins over its ancestors.
    pub fn lookup(&self, name: &str) -> Option<Arc<Method>> {
        self.entries
            .get(name)
            .cloned()
            .or_else(|| self.parent_lookup(name))
    }

    fn parent_lookup(&self, name: &str) -> Option<Arc<Method>> {
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// All visible methods, merged across the chain, sorted by name.
    pub fn methods(&self) -> Vec<Arc<Method>> {
        let mut merged: BTreeMap<String, Arc<Method>> = self
            .parent
            .as_ref()
            .map(|p| {
                p.methods()
                    .into_iter()
                    .map(|m| (m.name().to_string(), m))
                    .collect()
            })
            .unwrap_or_default();
        for (name, method) in &self.entries {
            merged.insert(name.clone(), Arc::clone(method));
        }
        merged.into_values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.methods().iter().map(|m| m.name().to_string()).collect()
    }

    pub fn signatures(&self) -> Vec<MethodSignature> {
        self.methods().iter().map(|m| m.signature().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.methods().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.parent.as_ref().map_or(true, |p| p.is_empty())
    }
}

/// Static description of one kind of device.
pub struct DriverClass {
    name: String,
    registry: Arc<CommandRegistry>,
    simulator: Option<SimulatorFactory>,
    transport_factory: TransportFactory,
    health_check: Option<HealthCheck>,
    defaults: TransportConfig,
}

impl DriverClass {
    /// Start building a class with an empty registry.
    pub fn builder(name: impl Into<String>) -> DriverClassBuilder {
        DriverClassBuilder {
            name: name.into(),
            registry: CommandRegistry::new(),
            simulator: None,
            transport_factory: default_factory(),
            health_check: None,
            defaults: TransportConfig::default(),
        }
    }

    /// Start building a class that inherits everything from `self`.
    ///
    /// The child sees every parent command unless it registers one with the
    /// same name. Simulator, transport factory, health check and transport
    /// defaults are inherited and may be replaced on the builder.
    pub fn subclass(self: &Arc<Self>, name: impl Into<String>) -> DriverClassBuilder {
        DriverClassBuilder {
            name: name.into(),
            registry: CommandRegistry::with_parent(Arc::clone(&self.registry)),
            simulator: self.simulator.clone(),
            transport_factory: Arc::clone(&self.transport_factory),
            health_check: self.health_check.clone(),
            defaults: self.defaults.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn lookup(&self, method: &str) -> Option<Arc<Method>> {
        self.registry.lookup(method)
    }

    pub fn signatures(&self) -> Vec<MethodSignature> {
        self.registry.signatures()
    }

    pub fn has_simulator(&self) -> bool {
        self.simulator.is_some()
    }

    /// Transport parameters used when a driver is created without its own.
    pub fn defaults(&self) -> &TransportConfig {
        &self.defaults
    }

    pub(crate) fn simulator(&self) -> Option<&SimulatorFactory> {
        self.simulator.as_ref()
    }

    pub(crate) fn transport_factory(&self) -> &TransportFactory {
        &self.transport_factory
    }

    pub(crate) fn health_check(&self) -> Option<&HealthCheck> {
        self.health_check.as_ref()
    }
}

impl fmt::Debug for DriverClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverClass")
            .field("name", &self.name)
            .field("methods", &self.registry.names())
            .field("simulator", &self.simulator.is_some())
            .field("health_check", &self.health_check.is_some())
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Builder for [`DriverClass`].
pub struct DriverClassBuilder {
    name: String,
    registry: CommandRegistry,
    simulator: Option<SimulatorFactory>,
    transport_factory: TransportFactory,
    health_check: Option<HealthCheck>,
    defaults: TransportConfig,
}

impl DriverClassBuilder {
    /// Register a command. The last registration for a name wins.
    ///
    /// # Errors
    /// `DriverError::Configuration` if the descriptor is malformed.
    pub fn register(mut self, descriptor: CommandDescriptor) -> DriverResult<Self> {
        self.registry.register(descriptor)?;
        Ok(self)
    }

    /// Register an argument-less query whose raw reply is returned as a string.
    pub fn register_query(
        self,
        method_name: impl Into<String>,
        wire_prefix: impl Into<String>,
    ) -> DriverResult<Self> {
        self.register(CommandDescriptor::new(method_name, wire_prefix))
    }

    /// Register every descriptor in order.
    pub fn register_all(
        self,
        descriptors: impl IntoIterator<Item = CommandDescriptor>,
    ) -> DriverResult<Self> {
        descriptors.into_iter().try_fold(self, Self::register)
    }

    /// Simulator used when a driver is created in simulation mode.
    pub fn register_simulator<F, S>(mut self, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Simulator + 'static,
    {
        self.simulator = Some(Arc::new(move || Box::new(factory()) as Box<dyn Simulator>));
        self
    }

    /// Like [`register_simulator`](Self::register_simulator), for an already boxed factory.
    pub fn simulator_factory(mut self, factory: SimulatorFactory) -> Self {
        self.simulator = Some(factory);
        self
    }

    /// Hook run once the transport is open; an error aborts construction.
    pub fn health_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Driver) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.health_check = Some(Arc::new(check));
        self
    }

    /// Replace how real transports are opened (serial by default).
    pub fn transport_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str, &TransportConfig) -> anyhow::Result<Box<dyn Transport>> + Send + Sync + 'static,
    {
        self.transport_factory = Arc::new(factory);
        self
    }

    pub fn transport_defaults(mut self, defaults: TransportConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn build(self) -> Arc<DriverClass> {
        debug!(class = %self.name, methods = self.registry.len(), "Driver class built");
        Arc::new(DriverClass {
            name: self.name,
            registry: Arc::new(self.registry),
            simulator: self.simulator,
            transport_factory: self.transport_factory,
            health_check: self.health_check,
            defaults: self.defaults,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Arg;
    use crate::error::DriverError;
    use crate::transport::simulator_fn;

    fn base() -> Arc<DriverClass> {
        DriverClass::builder("Base")
            .register_query("get_identity", "*IDN")
            .unwrap()
            .register(CommandDescriptor::new("get_mode", "MODE?").arg(Arg::new("a")))
            .unwrap()
            .build()
    }

    #[test]
    fn test_last_registration_wins() {
        let class = DriverClass::builder("Dup")
            .register_query("get_identity", "*IDN")
            .unwrap()
            .register_query("get_identity", "ID?")
            .unwrap()
            .build();
        assert_eq!(class.registry().len(), 1);
        assert_eq!(
            class.lookup("get_identity").unwrap().descriptor().wire_prefix(),
            "ID?"
        );
    }

    #[test]
    fn test_identical_registration_is_idempotent() {
        let descriptor = CommandDescriptor::new("get_mode", "MODE?").arg(Arg::new("a"));
        let class = DriverClass::builder("Twice")
            .register(descriptor.clone())
            .unwrap()
            .register(descriptor)
            .unwrap()
            .build();
        assert_eq!(class.signatures().len(), 1);
        assert_eq!(class.signatures()[0].to_string(), "get_mode(a)");
    }

    #[test]
    fn test_subclass_inherits_and_shadows() {
        let parent = base();
        let child = parent
            .subclass("Child")
            .register_query("get_mode", "MODE2?")
            .unwrap()
            .register_query("get_status", "STAT?")
            .unwrap()
            .build();

        assert_eq!(child.registry().names(), vec!["get_identity", "get_mode", "get_status"]);
        assert_eq!(child.lookup("get_mode").unwrap().descriptor().wire_prefix(), "MODE2?");
        assert_eq!(parent.lookup("get_mode").unwrap().descriptor().wire_prefix(), "MODE?");
        assert!(parent.lookup("get_status").is_none());
    }

    #[test]
    fn test_malformed_descriptor_fails_registration() {
        let err = DriverClass::builder("Bad")
            .register(CommandDescriptor::new("not valid", "X"))
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::Configuration(_)));
    }

    #[test]
    fn test_simulator_inherited() {
        let parent = DriverClass::builder("Sim")
            .register_simulator(|| simulator_fn(|_| Ok(String::new())))
            .build();
        assert!(parent.has_simulator());
        assert!(parent.subclass("Child").build().has_simulator());
        assert!(!base().has_simulator());
    }

    #[test]
    fn test_empty_registry() {
        let registry = CommandRegistry::with_parent(Arc::new(CommandRegistry::new()));
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }
}
