//! Service lifecycle on the owning worker.
//!
//! ```text
//!   create ──▶ setup ──▶ components ──▶ middlewares ──▶ on_start ──▶ LIVE
//!                                                                    │
//!                                                 stop: on_stop ◀────┘
//!                                                        │
//!                       keep_alive && !force ◀───────────┼──────────▶ on_destroy
//!                              │                                          ▲
//!                            CACHED ──── ttl elapsed ─────────────────────┘
//!                              │
//!                   create ◀───┘ (reclaimed: on_start(reclaimed = true))
//! ```

use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::context::{Kernel, MiddlewareContext, ServiceContext};
use super::service::{Component, Service, ServiceInfo, ServiceRef, ServiceState};
use super::worker::Worker;
use crate::definition::{HookFn, Hooks, ServiceDefinition, ServiceRuntime};
use crate::dependency::build_dependency;
use crate::ipc::{Call, WireError};
use crate::middleware::Pipeline;
use crate::types::{Error, Result, Router};

struct CachedService {
    service: Rc<Service>,
    eviction: JoinHandle<()>,
}

/// Live and keep-alive-cached instances of one worker.
#[derive(Default)]
pub(crate) struct ServiceTable {
    live: HashMap<Router, Rc<Service>>,
    cached: HashMap<Router, CachedService>,
}

impl ServiceTable {
    pub(crate) fn live(&self, router: &Router) -> Option<Rc<Service>> {
        self.live.get(router).cloned()
    }

    pub(crate) fn state(&self, router: &Router) -> ServiceState {
        if self.live.contains_key(router) {
            ServiceState::Live
        } else if self.cached.contains_key(router) {
            ServiceState::Cached
        } else {
            ServiceState::Absent
        }
    }

    /// Live instances of `kind`.
    pub(crate) fn of_type(&self, kind: &str) -> Vec<Rc<Service>> {
        self.live
            .values()
            .filter(|s| s.kind() == kind)
            .cloned()
            .collect()
    }

    pub(crate) fn live_types(&self) -> Vec<String> {
        self.live
            .values()
            .map(|s| s.kind().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub(crate) fn infos(&self) -> Vec<ServiceInfo> {
        let mut infos: Vec<_> = self.live.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.router.cmp(&b.router));
        infos
    }

    fn reclaim(&mut self, router: &Router) -> Option<Rc<Service>> {
        let cached = self.cached.remove(router)?;
        cached.eviction.abort();
        Some(cached.service)
    }
}

impl fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTable")
            .field("live", &self.live.keys().collect::<Vec<_>>())
            .field("cached", &self.cached.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Worker {
    pub(crate) fn context(self: &Rc<Self>, service: &Rc<Service>, component: Option<Rc<Component>>) -> ServiceContext {
        ServiceContext::new(service.clone(), component, Kernel::new(self.clone()))
    }

    /// Create `router` on this worker, or return the instance already live.
    ///
    /// Concurrent creations of the same router share one construction: the
    /// first caller builds, later callers wait for its outcome.
    pub(crate) async fn create_service(self: &Rc<Self>, router: Router, options: Value) -> Result<ServiceRef> {
        let definition = self.registry.service(&router.kind)?.clone();

        if let Some(service) = self.services.borrow().live(&router) {
            return Ok(service.to_ref());
        }

        let waiter = {
            let mut creating = self.creating.borrow_mut();
            match creating.get_mut(&router) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    creating.insert(router.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(outcome) => outcome.map_err(WireError::into_error),
                Err(_) => Err(Error::closed(format!("creation of {} abandoned", router))),
            };
        }

        let result = self.bring_up(&router, definition, options).await;

        let waiters = self.creating.borrow_mut().remove(&router).unwrap_or_default();
        let shared = result.as_ref().map(Clone::clone).map_err(WireError::from);
        for waiter in waiters {
            let _ = waiter.send(shared.clone());
        }
        result
    }

    async fn bring_up(
        self: &Rc<Self>,
        router: &Router,
        definition: std::sync::Arc<ServiceDefinition>,
        options: Value,
    ) -> Result<ServiceRef> {
        let reclaimed = if definition.keep_alive.is_some() {
            self.services.borrow_mut().reclaim(router)
        } else {
            None
        };

        let (service, was_cached) = match reclaimed {
            Some(service) => {
                tracing::debug!("service_reclaimed: router={}", router);
                (service, true)
            }
            None => (self.construct(router.clone(), definition, options).await?, false),
        };

        if let Err(e) = self.start_instance(&service, was_cached).await {
            self.detach(&service);
            self.destroy(&service).await;
            return Err(e);
        }

        self.services
            .borrow_mut()
            .live
            .insert(router.clone(), service.clone());
        tracing::info!(
            "service_started: router={} instance={} worker={} reclaimed={}",
            router,
            service.instance(),
            self.index(),
            was_cached
        );
        Ok(service.to_ref())
    }

    /// Build a fresh instance: setup, components, middlewares.
    async fn construct(
        self: &Rc<Self>,
        router: Router,
        definition: std::sync::Arc<ServiceDefinition>,
        options: Value,
    ) -> Result<Rc<Service>> {
        let service = Rc::new(Service::new(
            router,
            definition.clone(),
            self.index(),
            self.resources().clone(),
            self.errors.clone(),
        ));

        let runtime = match &definition.setup {
            Some(setup) => setup(self.context(&service, None), options).await?,
            None => None,
        };
        let runtime = runtime.unwrap_or_else(|| ServiceRuntime::declared_by(&definition));
        service.merge_props(runtime.props);

        for info in runtime.components {
            let component_definition = self.registry.component_for(&definition, &info.name)?;
            let component = Rc::new(Component::new(
                info.name.as_str(),
                component_definition.clone(),
                Rc::downgrade(&service),
            ));
            if let Some(setup) = &component_definition.setup {
                if let Some(props) = setup(self.context(&service, Some(component.clone())), info.options).await? {
                    component.merge_props(props);
                }
            }
            service.push_component(component);
        }

        let mut handlers = Vec::with_capacity(runtime.middlewares.len());
        for info in runtime.middlewares {
            let middleware = self.registry.middleware_for(Some(&definition), &info.name)?;
            let cx = MiddlewareContext::new(
                info.name.as_str(),
                info.options,
                Some(service.clone()),
                Kernel::new(self.clone()),
            );
            handlers.push((middleware.setup)(cx).await?);
        }
        service.set_pipeline(Pipeline::compose(handlers));

        Ok(service)
    }

    async fn start_instance(self: &Rc<Self>, service: &Rc<Service>, reclaimed: bool) -> Result<()> {
        for component in service.components() {
            if let Some(hook) = component.definition().hooks.on_start.clone() {
                hook(self.context(service, Some(component)), reclaimed).await?;
            }
        }
        if let Some(hook) = service.definition().hooks.on_start.clone() {
            hook(self.context(service, None), reclaimed).await?;
        }
        self.attach(service);
        Ok(())
    }

    /// Run `on_stop` or `on_destroy` over components, then the service.
    /// Failures are reported and do not interrupt the sequence.
    async fn run_hooks(self: &Rc<Self>, service: &Rc<Service>, name: &str, pick: fn(&Hooks) -> Option<&HookFn>) {
        for component in service.components() {
            if let Some(hook) = pick(&component.definition().hooks).cloned() {
                let origin = format!("{}:{}", name, component.name());
                if let Err(e) = hook(self.context(service, Some(component))).await {
                    service.report(origin, &e);
                }
            }
        }
        if let Some(hook) = pick(&service.definition().hooks).cloned() {
            if let Err(e) = hook(self.context(service, None)).await {
                service.report(name.to_string(), &e);
            }
        }
    }

    /// Stop a live instance. Absent routers are ignored.
    pub(crate) async fn stop_service(self: &Rc<Self>, router: &Router, force_destroy: bool) {
        let Some(service) = self.services.borrow_mut().live.remove(router) else {
            return;
        };

        self.run_hooks(&service, "on_stop", |h| h.on_stop.as_ref()).await;
        self.detach(&service);

        match service.definition().keep_alive {
            Some(ttl) if !force_destroy => {
                let eviction = self.schedule_eviction(router.clone(), ttl);
                self.services
                    .borrow_mut()
                    .cached
                    .insert(router.clone(), CachedService { service, eviction });
                tracing::info!("service_cached: router={} ttl={:?}", router, ttl);
            }
            _ => self.destroy(&service).await,
        }
    }

    fn schedule_eviction(self: &Rc<Self>, router: Router, ttl: Duration) -> JoinHandle<()> {
        let worker = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(ttl).await;
            let Some(worker) = worker.upgrade() else {
                return;
            };
            let evicted = worker.services.borrow_mut().cached.remove(&router);
            if let Some(cached) = evicted {
                tracing::debug!("service_evicted: router={}", router);
                worker.destroy(&cached.service).await;
            }
        })
    }

    async fn destroy(self: &Rc<Self>, service: &Rc<Service>) {
        self.run_hooks(service, "on_destroy", |h| h.on_destroy.as_ref()).await;
        service.release();
        tracing::info!(
            "service_destroyed: router={} instance={}",
            service.router(),
            service.instance()
        );
    }

    /// Stop every live instance of `types`, last type first.
    pub(crate) async fn stop_many(self: &Rc<Self>, types: &[String], force_destroy: bool) {
        for kind in types.iter().rev() {
            let mut services = self.services.borrow().of_type(kind);
            services.sort_by(|a, b| a.router().cmp(b.router()));
            for service in services {
                self.stop_service(service.router(), force_destroy).await;
            }
        }
    }

    /// Destroy every live and cached instance.
    pub(crate) async fn stop_all(self: &Rc<Self>) {
        let mut live: Vec<Router> = self.services.borrow().live.keys().cloned().collect();
        live.sort();
        for router in live {
            self.stop_service(&router, true).await;
        }

        let cached: Vec<CachedService> = self
            .services
            .borrow_mut()
            .cached
            .drain()
            .map(|(_, cached)| cached)
            .collect();
        for entry in cached {
            entry.eviction.abort();
            self.destroy(&entry.service).await;
        }
    }

    /// Create the boot services in dependency order. Runs on worker 0.
    pub(crate) async fn boot_services(self: &Rc<Self>) -> Result<()> {
        let creates: Vec<_> = self
            .boot
            .iter()
            .flat_map(|boot| boot.services.iter().cloned())
            .collect();
        if creates.is_empty() {
            return Ok(());
        }

        let dependencies = self
            .registry
            .dependency_map(creates.iter().map(|c| c.router.kind.as_str()), false);
        let groups = build_dependency(&dependencies)?;
        tracing::debug!("boot_order: groups={:?}", groups);

        for group in &groups {
            for kind in group {
                for create in creates.iter().filter(|c| &c.router.kind == kind) {
                    self.route_create(create.router.clone(), create.options.clone())
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Dependency-ordered stop of everything on every worker. Runs on worker 0.
    pub(crate) async fn coordinated_stop(self: &Rc<Self>) -> Result<()> {
        let listings = join_all((0..self.count()).map(|peer| self.call_worker(peer, Call::ListTypes))).await;
        let mut types = BTreeSet::new();
        for listing in listings {
            match listing {
                Ok(crate::ipc::Reply::Types(kinds)) => types.extend(kinds),
                Ok(other) => return Err(super::worker::unexpected(other)),
                Err(e) => tracing::warn!("list_types_failed: error={}", e),
            }
        }

        let dependencies = self
            .registry
            .dependency_map(types.iter().map(String::as_str), true);
        let groups = build_dependency(&dependencies)?;
        tracing::info!("coordinated_stop: groups={:?}", groups);

        // A type is stopped on every worker before the type it depends on.
        for kind in groups.iter().rev().flat_map(|group| group.iter().rev()) {
            let stops = (0..self.count()).map(|peer| {
                self.call_worker(
                    peer,
                    Call::StopManyServices {
                        types: vec![kind.clone()],
                        force_destroy: true,
                    },
                )
            });
            for outcome in join_all(stops).await {
                if let Err(e) = outcome {
                    tracing::warn!("stop_type_failed: kind={} error={}", kind, e);
                }
            }
        }

        for outcome in join_all((0..self.count()).map(|peer| self.call_worker(peer, Call::StopAll))).await {
            if let Err(e) = outcome {
                tracing::warn!("stop_all_failed: error={}", e);
            }
        }
        Ok(())
    }
}
