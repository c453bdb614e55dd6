use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use super::{ComponentDefinition, CreateInfo, MiddlewareDefinition, ServiceDefinition};
use crate::dependency::DependencyMap;
use crate::kernel::Resource;
use crate::types::{Error, Result, Router};

/// Bundle of definitions and resources, optionally nesting child modules.
///
/// Children are flattened before their parent; a name defined twice anywhere
/// in the tree is a configuration error.
#[derive(Default)]
pub struct Module {
    name: String,
    services: Vec<(String, ServiceDefinition)>,
    components: Vec<(String, ComponentDefinition)>,
    middlewares: Vec<(String, MiddlewareDefinition)>,
    resources: Vec<(String, Resource)>,
    modules: Vec<Module>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(mut self, kind: impl Into<String>, definition: ServiceDefinition) -> Self {
        self.services.push((kind.into(), definition));
        self
    }

    /// Component available to every service by name.
    pub fn component(mut self, name: impl Into<String>, definition: ComponentDefinition) -> Self {
        self.components.push((name.into(), definition));
        self
    }

    /// Middleware available to every service and to boot definitions.
    pub fn middleware(mut self, name: impl Into<String>, definition: MiddlewareDefinition) -> Self {
        self.middlewares.push((name.into(), definition));
        self
    }

    pub fn resource(mut self, name: impl Into<String>, resource: Resource) -> Self {
        self.resources.push((name.into(), resource));
        self
    }

    pub fn module(mut self, child: Module) -> Self {
        self.modules.push(child);
        self
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("services", &self.services.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("components", &self.components.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("middlewares", &self.middlewares.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("resources", &self.resources.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("modules", &self.modules)
            .finish()
    }
}

/// Service instance requested at boot.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCreate {
    pub router: Router,
    pub options: Value,
}

impl From<Router> for ServiceCreate {
    fn from(router: Router) -> Self {
        Self {
            router,
            options: Value::Null,
        }
    }
}

impl From<&str> for ServiceCreate {
    fn from(router: &str) -> Self {
        Router::from(router).into()
    }
}

impl From<(Router, Value)> for ServiceCreate {
    fn from((router, options): (Router, Value)) -> Self {
        Self { router, options }
    }
}

/// Services created and global middlewares installed at start.
#[derive(Debug, Clone, Default)]
pub struct BootDefinition {
    pub services: Vec<ServiceCreate>,
    pub middlewares: Vec<CreateInfo>,
}

impl BootDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, create: impl Into<ServiceCreate>) -> Self {
        self.services.push(create.into());
        self
    }

    pub fn middleware(mut self, info: impl Into<CreateInfo>) -> Self {
        self.middlewares.push(info.into());
        self
    }
}

/// Flattened, validated definition tables shared by all workers.
#[derive(Default)]
pub struct Registry {
    services: Vec<(String, Arc<ServiceDefinition>)>,
    components: HashMap<String, Arc<ComponentDefinition>>,
    middlewares: HashMap<String, Arc<MiddlewareDefinition>>,
}

impl Registry {
    /// Flatten `modules` and validate service dependencies. Returns the
    /// registry and the resources the modules declared.
    pub fn build(modules: Vec<Module>) -> Result<(Self, Vec<(String, Resource)>)> {
        let mut registry = Self::default();
        let mut resources = Vec::new();
        for module in modules {
            registry.absorb(module, &mut resources)?;
        }
        registry.validate()?;
        Ok((registry, resources))
    }

    fn absorb(&mut self, module: Module, resources: &mut Vec<(String, Resource)>) -> Result<()> {
        let Module {
            name,
            services,
            components,
            middlewares,
            resources: own_resources,
            modules,
        } = module;

        for child in modules {
            self.absorb(child, resources)?;
        }

        for (kind, definition) in services {
            if self.services.iter().any(|(k, _)| *k == kind) {
                return Err(Error::config(format!(
                    "service '{}' defined twice (module '{}')",
                    kind, name
                )));
            }
            self.services.push((kind, Arc::new(definition)));
        }
        for (key, definition) in components {
            if self.components.insert(key.clone(), Arc::new(definition)).is_some() {
                return Err(Error::config(format!(
                    "component '{}' defined twice (module '{}')",
                    key, name
                )));
            }
        }
        for (key, definition) in middlewares {
            if self.middlewares.insert(key.clone(), Arc::new(definition)).is_some() {
                return Err(Error::config(format!(
                    "middleware '{}' defined twice (module '{}')",
                    key, name
                )));
            }
        }
        for (key, resource) in own_resources {
            if resources.iter().any(|(k, _)| *k == key) {
                return Err(Error::config(format!(
                    "resource '{}' defined twice (module '{}')",
                    key, name
                )));
            }
            resources.push((key, resource));
        }

        tracing::debug!(module = %name, "module registered");
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (kind, definition) in &self.services {
            for dependency in &definition.depends {
                if self.service(dependency).is_err() {
                    return Err(Error::config(format!(
                        "service '{}' depends on unregistered service '{}'",
                        kind, dependency
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn service(&self, kind: &str) -> Result<&Arc<ServiceDefinition>> {
        self.services
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, d)| d)
            .ok_or_else(|| Error::unknown_service(kind))
    }

    pub fn service_types(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|(k, _)| k.as_str())
    }

    /// Component `name` as seen by `service`: its own declaration first,
    /// then the shared table.
    pub fn component_for(
        &self,
        service: &ServiceDefinition,
        name: &str,
    ) -> Result<Arc<ComponentDefinition>> {
        service
            .declared_component(name)
            .or_else(|| self.components.get(name))
            .cloned()
            .ok_or_else(|| Error::unknown_component(name))
    }

    /// Middleware `name` as seen by `service`, or by the global pipeline
    /// when `service` is `None`.
    pub fn middleware_for(
        &self,
        service: Option<&ServiceDefinition>,
        name: &str,
    ) -> Result<Arc<MiddlewareDefinition>> {
        service
            .and_then(|s| s.declared_middleware(name))
            .or_else(|| self.middlewares.get(name))
            .cloned()
            .ok_or_else(|| Error::unknown_middleware(name))
    }

    /// Dependency map over `types`. With `restrict`, edges leaving the set
    /// are dropped.
    pub fn dependency_map<'a>(
        &self,
        types: impl IntoIterator<Item = &'a str>,
        restrict: bool,
    ) -> DependencyMap {
        let types: BTreeSet<&str> = types.into_iter().collect();
        types
            .iter()
            .map(|kind| {
                let depends = self
                    .service(kind)
                    .map(|d| {
                        d.depends
                            .iter()
                            .filter(|dep| !restrict || types.contains(dep.as_str()))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                (kind.to_string(), depends)
            })
            .collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.services.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("middlewares", &self.middlewares.keys().collect::<Vec<_>>())
            .finish()
    }
}
