//! Per-request event threaded through middleware and handlers.

use serde_json::{Map, Value};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use super::{Body, Request, Response};
use crate::kernel::{Component, Kernel, Service};
use crate::types::Router;

/// Mutable request context living on the worker that owns the target.
///
/// Handlers and middleware share it as `Rc<Event>`; the response and the
/// scratch `locals` bag use interior mutability since a worker is
/// single-threaded.
pub struct Event {
    request: Request,
    response: RefCell<Response>,
    locals: RefCell<Map<String, Value>>,
    service: Option<Rc<Service>>,
    component: Option<Rc<Component>>,
    kernel: Option<Kernel>,
}

impl Event {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: RefCell::new(Response::default()),
            locals: RefCell::new(Map::new()),
            service: None,
            component: None,
            kernel: None,
        }
    }

    pub fn with_service(mut self, service: Rc<Service>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_component(mut self, component: Rc<Component>) -> Self {
        self.component = Some(component);
        self
    }

    pub fn with_kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn target(&self) -> &Router {
        &self.request.target
    }

    pub fn path(&self) -> &str {
        &self.request.path
    }

    pub fn body(&self) -> &Value {
        &self.request.body
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.request.headers.get(key).map(String::as_str)
    }

    /// Target service, once routed.
    pub fn service(&self) -> Option<&Rc<Service>> {
        self.service.as_ref()
    }

    pub fn component(&self) -> Option<&Rc<Component>> {
        self.component.as_ref()
    }

    /// Capability handle of the worker handling this event.
    pub fn kernel(&self) -> Option<&Kernel> {
        self.kernel.as_ref()
    }

    pub fn response(&self) -> Ref<'_, Response> {
        self.response.borrow()
    }

    pub fn response_mut(&self) -> RefMut<'_, Response> {
        self.response.borrow_mut()
    }

    /// Set a `200` response carrying `body`.
    pub fn reply(&self, body: impl Into<Body>) {
        let mut response = self.response.borrow_mut();
        response.status = 200;
        response.status_message = None;
        response.body = body.into();
    }

    /// Store a handler's result. The status becomes `200` unless something
    /// upstream already set one.
    pub fn complete(&self, body: impl Into<Body>) {
        let mut response = self.response.borrow_mut();
        if response.status == 404 && response.status_message.is_none() {
            response.status = 200;
        }
        response.body = body.into();
    }

    pub fn set_status(&self, status: u16, message: Option<String>) {
        let mut response = self.response.borrow_mut();
        response.status = status;
        response.status_message = message;
    }

    /// Move the response out, leaving an unhandled default behind.
    pub fn take_response(&self) -> Response {
        std::mem::take(&mut *self.response.borrow_mut())
    }

    pub fn set_local(&self, key: impl Into<String>, value: Value) {
        self.locals.borrow_mut().insert(key.into(), value);
    }

    pub fn local(&self, key: &str) -> Option<Value> {
        self.locals.borrow().get(key).cloned()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("request", &self.request)
            .field("status", &self.response.borrow().status)
            .field("service", &self.service.as_ref().map(|s| s.router().clone()))
            .finish_non_exhaustive()
    }
}
