//! Capability handles passed to author code running on a worker.

use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use super::service::{Component, Service, ServiceRef, ServiceState};
use super::worker::Worker;
use crate::envelope::{Body, Request, Response};
use crate::types::{shard, Error, Result, Router};

/// Routing capability of the current worker.
///
/// Every operation addresses services by router; the call is carried out on
/// the owning worker, which may be this one.
#[derive(Clone)]
pub struct Kernel {
    worker: Rc<Worker>,
}

impl Kernel {
    pub(crate) fn new(worker: Rc<Worker>) -> Self {
        Self { worker }
    }

    pub fn worker_index(&self) -> usize {
        self.worker.index()
    }

    pub fn worker_count(&self) -> usize {
        self.worker.count()
    }

    /// Worker that owns `router`.
    pub fn owner_of(&self, router: &Router) -> usize {
        shard(router, self.worker.count())
    }

    /// Send a request and await its response. Failures become `502`.
    pub async fn fetch(&self, request: Request) -> Response {
        self.worker.route_fetch(request).await
    }

    pub fn notify(&self, request: Request) {
        self.worker.route_notify(request);
    }

    pub async fn create_service(&self, router: Router, options: Value) -> Result<ServiceRef> {
        self.worker.route_create(router, options).await
    }

    pub async fn stop_service(&self, router: Router, force_destroy: bool) -> Result<()> {
        self.worker.route_stop(router, force_destroy).await
    }

    pub async fn service_state(&self, router: Router) -> Result<ServiceState> {
        self.worker.route_state(router).await
    }

    /// Emit `name` on every worker to services that opted into it globally.
    pub fn broad_event(&self, source: Option<Router>, name: impl Into<String>, args: Vec<Value>) {
        self.worker.route_broad_event(source, name.into(), args);
    }

    /// Notify every live instance of `kind` on every worker.
    pub fn notify_all(
        &self,
        source: Option<Router>,
        kind: impl Into<String>,
        path: impl Into<String>,
        body: Value,
    ) {
        self.worker
            .route_notify_all(source, kind.into(), path.into(), body);
    }

    pub fn resource<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.worker.resources().get(name)
    }

    /// Live instance of `router`, if this worker owns it.
    pub fn local_service(&self, router: &Router) -> Option<Rc<Service>> {
        self.worker.live_service(router)
    }

    pub fn target(&self, router: Router) -> Target {
        Target {
            kernel: self.clone(),
            router,
            source: None,
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("worker", &self.worker.index())
            .field("workers", &self.worker.count())
            .finish()
    }
}

/// A service addressed by router, with request shortcuts.
#[derive(Debug, Clone)]
pub struct Target {
    kernel: Kernel,
    router: Router,
    source: Option<Router>,
}

impl Target {
    pub fn router(&self) -> &Router {
        &self.router
    }

    fn request(&self, request: Request) -> Request {
        match &self.source {
            Some(source) => request.source(source.clone()),
            None => request,
        }
    }

    pub async fn fetch(&self, path: impl Into<String>, body: Value) -> Response {
        let request = self.request(Request::fetch(self.router.clone(), path).body(body));
        self.kernel.fetch(request).await
    }

    pub fn notify(&self, path: impl Into<String>, body: Value) {
        let request = self.request(Request::notify(self.router.clone(), path).body(body));
        self.kernel.notify(request);
    }

    /// Fetch and unwrap the JSON body; a non-2xx status is an error.
    /// Streamed bodies are collected into an array.
    pub async fn call(&self, path: impl Into<String>, body: Value) -> Result<Value> {
        let path = path.into();
        let response = self.fetch(path.clone(), body).await;
        if !response.is_success() {
            let message = response
                .status_message
                .unwrap_or_else(|| format!("status {}", response.status));
            return Err(match response.status {
                404 => Error::not_found(message),
                _ => Error::Remote(message),
            });
        }
        match response.body {
            Body::Empty => Ok(Value::Null),
            Body::Json(value) => Ok(value),
            Body::Stream(stream) => stream.collect_values().await.map(Value::Array),
        }
    }

    pub async fn create(&self, options: Value) -> Result<ServiceRef> {
        self.kernel.create_service(self.router.clone(), options).await
    }

    pub async fn stop(&self, force_destroy: bool) -> Result<()> {
        self.kernel.stop_service(self.router.clone(), force_destroy).await
    }

    pub async fn state(&self) -> Result<ServiceState> {
        self.kernel.service_state(self.router.clone()).await
    }
}

/// Context handed to hooks, handlers, methods, listeners and timers.
///
/// Bound to a service and, for component callbacks, to one of its
/// components. Requests sent through it carry the service as their source.
#[derive(Clone)]
pub struct ServiceContext {
    service: Rc<Service>,
    component: Option<Rc<Component>>,
    kernel: Kernel,
}

impl ServiceContext {
    pub(crate) fn new(service: Rc<Service>, component: Option<Rc<Component>>, kernel: Kernel) -> Self {
        Self {
            service,
            component,
            kernel,
        }
    }

    pub fn service(&self) -> &Rc<Service> {
        &self.service
    }

    pub fn component(&self) -> Option<&Rc<Component>> {
        self.component.as_ref()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn router(&self) -> &Router {
        self.service.router()
    }

    /// Same service, bound to `component` (or to the service itself).
    pub fn rebind(&self, component: Option<Rc<Component>>) -> Self {
        Self {
            service: self.service.clone(),
            component,
            kernel: self.kernel.clone(),
        }
    }

    /// Prop of the bound component, or of the service when unbound.
    pub fn prop(&self, key: &str) -> Option<Value> {
        match &self.component {
            Some(component) => component.prop(key),
            None => self.service.prop(key),
        }
    }

    pub fn set_prop(&self, key: impl Into<String>, value: Value) {
        match &self.component {
            Some(component) => component.set_prop(key, value),
            None => self.service.set_prop(key, value),
        }
    }

    pub fn resource<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.service.resource(name)
    }

    /// Invoke a method.
    ///
    /// `component.method` addresses a component of this service; a bare name
    /// resolves on the service first, then on the bound component.
    pub async fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let (method, cx) = match name.split_once('.') {
            Some((component_name, method_name)) => {
                let component = self
                    .service
                    .component(component_name)
                    .ok_or_else(|| Error::unknown_component(component_name))?;
                let method = component
                    .definition()
                    .methods
                    .get(method_name)
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("method {}", name)))?;
                (method, self.rebind(Some(component)))
            }
            None => {
                if let Some(method) = self.service.definition().methods.get(name).cloned() {
                    (method, self.rebind(None))
                } else {
                    let method = self
                        .component
                        .as_ref()
                        .and_then(|c| c.definition().methods.get(name).cloned())
                        .ok_or_else(|| Error::not_found(format!("method {}", name)))?;
                    (method, self.clone())
                }
            }
        };
        method(cx, args).await
    }

    /// Emit a local event on the bound service.
    pub async fn emit(&self, topic: &str, args: Vec<Value>) -> usize {
        self.service.emit(topic, args).await
    }

    pub fn target(&self, router: Router) -> Target {
        Target {
            kernel: self.kernel.clone(),
            router,
            source: Some(self.service.router().clone()),
        }
    }

    pub async fn fetch(&self, request: Request) -> Response {
        self.kernel.fetch(self.sourced(request)).await
    }

    pub fn notify(&self, request: Request) {
        self.kernel.notify(self.sourced(request));
    }

    pub fn broad_event(&self, name: impl Into<String>, args: Vec<Value>) {
        self.kernel
            .broad_event(Some(self.service.router().clone()), name, args);
    }

    pub fn notify_all(&self, kind: impl Into<String>, path: impl Into<String>, body: Value) {
        self.kernel
            .notify_all(Some(self.service.router().clone()), kind, path, body);
    }

    fn sourced(&self, request: Request) -> Request {
        if request.source.is_some() {
            request
        } else {
            request.source(self.service.router().clone())
        }
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("service", self.service.router())
            .field("component", &self.component.as_ref().map(|c| c.name().to_string()))
            .field("kernel", &self.kernel)
            .finish()
    }
}

/// Context handed to a middleware setup.
///
/// Handlers built by the setup usually capture this context, and the owning
/// service holds those handlers, so the service is held weakly.
#[derive(Clone)]
pub struct MiddlewareContext {
    name: String,
    options: Value,
    service: Option<Weak<Service>>,
    kernel: Kernel,
}

impl MiddlewareContext {
    pub(crate) fn new(
        name: impl Into<String>,
        options: Value,
        service: Option<Rc<Service>>,
        kernel: Kernel,
    ) -> Self {
        Self {
            name: name.into(),
            options,
            service: service.as_ref().map(Rc::downgrade),
            kernel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Value {
        &self.options
    }

    /// Owning service; `None` for boot-level middlewares and once the
    /// service has been destroyed.
    pub fn service(&self) -> Option<Rc<Service>> {
        self.service.as_ref().and_then(Weak::upgrade)
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }
}

impl fmt::Debug for MiddlewareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareContext")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("service", &self.service().map(|s| s.router().clone()))
            .finish()
    }
}
