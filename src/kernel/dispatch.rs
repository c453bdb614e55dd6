//! Request dispatch on the owning worker.
//!
//! ```text
//!  Event ─▶ [boot middlewares] ─▶ service routing ─▶ [service middlewares] ─▶ handler lookup
//!                                      │                                          │
//!                                      └──── no service / no handler ◀────────────┘
//!                                                      │
//!                                                 404 terminal
//! ```

use serde_json::Value;
use std::rc::Rc;

use super::context::{Kernel, MiddlewareContext, ServiceContext};
use super::service::{Component, Service};
use super::worker::Worker;
use crate::definition::HandlerFn;
use crate::envelope::{Event, Request, Response};
use crate::middleware::{handler, terminal, MiddlewareHandler, Next, Pipeline};
use crate::types::{Error, Result, Router};

/// Find the handler addressed by `path` on `service`.
///
/// Accepted shapes: `handlers/<name>`, `remotes/<name>` and
/// `<component>/handlers/<name>`. A leading segment equal to the service
/// type is dropped when three segments are given.
pub fn resolve_handler(service: &Service, path: &str) -> Option<(HandlerFn, Option<Rc<Component>>)> {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() == 3 && segments[0] == service.kind() {
        segments.remove(0);
    }

    match segments.as_slice() {
        ["handlers", name] => service
            .definition()
            .handlers
            .get(*name)
            .cloned()
            .map(|h| (h, None)),
        ["remotes", name] => service
            .definition()
            .remotes
            .get(*name)
            .cloned()
            .map(|h| (h, None)),
        [component, "handlers", name] => {
            let component = service.component(component)?;
            let handler = component.definition().handlers.get(*name).cloned()?;
            Some((handler, Some(component)))
        }
        _ => None,
    }
}

/// Global step that hands the event to the target service's own pipeline,
/// ending in handler lookup. Unrouted or unmatched events continue down the
/// global chain.
fn service_routing() -> MiddlewareHandler {
    handler(|event: Rc<Event>, next: Next| async move {
        let Some(service) = event.service().cloned() else {
            return next.run().await;
        };

        let lookup = terminal(move |event: Rc<Event>| {
            let next = next.clone();
            async move {
                let found = event
                    .service()
                    .and_then(|service| resolve_handler(service, event.path()));
                let (callback, component) = match found {
                    Some(found) => found,
                    None => return next.run().await,
                };
                let (Some(service), Some(kernel)) = (event.service().cloned(), event.kernel().cloned()) else {
                    return Err(Error::internal("event is not bound to a worker"));
                };
                let cx = ServiceContext::new(service, component, kernel);
                let body = callback(cx, event.clone()).await?;
                event.complete(body);
                Ok(())
            }
        });

        service.pipeline().run(event, lookup).await
    })
}

impl Worker {
    /// Build this worker's global pipeline from the boot middlewares.
    pub(crate) async fn install_pipeline(self: &Rc<Self>) -> Result<()> {
        let mut handlers = Vec::new();
        for boot in self.boot.iter() {
            for info in &boot.middlewares {
                let middleware = self.registry.middleware_for(None, &info.name)?;
                let cx = MiddlewareContext::new(
                    info.name.as_str(),
                    info.options.clone(),
                    None,
                    Kernel::new(self.clone()),
                );
                handlers.push((middleware.setup)(cx).await?);
            }
        }
        handlers.push(service_routing());
        *self.pipeline.borrow_mut() = Pipeline::compose(handlers);
        Ok(())
    }

    /// Live instance for `router`, created on demand for auto-create types.
    async fn resolve_target(self: &Rc<Self>, router: &Router) -> Result<Option<Rc<Service>>> {
        let definition = self.registry.service(&router.kind)?.clone();
        if let Some(service) = self.live_service(router) {
            return Ok(Some(service));
        }
        if !definition.auto_create {
            return Ok(None);
        }
        self.create_service(router.clone(), Value::Null).await?;
        Ok(self.live_service(router))
    }

    /// Run `request` through the pipelines on this worker.
    pub(crate) async fn fetch_local(self: &Rc<Self>, request: Request) -> Result<Response> {
        let Some(service) = self.resolve_target(&request.target).await? else {
            return Ok(Response::not_found(format!("no such service: {}", request.target)));
        };

        let event = Rc::new(
            Event::new(request)
                .with_service(service)
                .with_kernel(Kernel::new(self.clone())),
        );
        let unhandled = terminal(|event: Rc<Event>| async move {
            let message = format!("no such handler: {}", event.path());
            event.set_status(404, Some(message));
            Ok(())
        });

        let pipeline = self.pipeline.borrow().clone();
        pipeline.run(event.clone(), unhandled).await?;
        Ok(event.take_response())
    }

    pub(crate) async fn notify_local(self: &Rc<Self>, request: Request) -> Result<()> {
        let target = request.target.clone();
        let response = self.fetch_local(request).await?;
        if !response.is_success() {
            tracing::debug!(
                "notify_unhandled: target={} status={} message={:?}",
                target,
                response.status,
                response.status_message
            );
        }
        Ok(())
    }

    /// Notify every live instance of `kind` on this worker.
    pub(crate) async fn notify_all_local(
        self: &Rc<Self>,
        source: Option<Router>,
        kind: &str,
        path: &str,
        body: Value,
    ) {
        let mut services = self.services.borrow().of_type(kind);
        services.sort_by(|a, b| a.router().cmp(b.router()));
        for service in services {
            let mut request = Request::notify(service.router().clone(), path).body(body.clone());
            if let Some(source) = &source {
                request = request.source(source.clone());
            }
            if let Err(e) = self.notify_local(request).await {
                service.report(format!("notify:{}", path), &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ComponentDefinition, ServiceDefinition};
    use crate::kernel::resources::Resources;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    fn echo() -> Rc<Service> {
        let definition = ServiceDefinition::new()
            .handler("hello", |_cx, _event| async { Ok("world") })
            .remote("ping", |_cx, _event| async { Ok("pong") })
            .component(
                "cache",
                ComponentDefinition::new()
                    .handler("get", |_cx, _event| async { Ok(serde_json::json!(1)) }),
            );
        let (errors, _) = broadcast::channel(4);
        let service = Rc::new(Service::new(
            Router::new("echo", "a"),
            Arc::new(definition.clone()),
            0,
            Arc::new(Resources::default()),
            errors,
        ));
        let cache = definition.declared_component("cache").unwrap().clone();
        service.push_component(Rc::new(Component::new("cache", cache, Rc::downgrade(&service))));
        service
    }

    #[test]
    fn test_resolve_handler_paths() {
        let service = echo();
        assert!(resolve_handler(&service, "handlers/hello").unwrap().1.is_none());
        assert!(resolve_handler(&service, "/handlers/hello").is_some());
        assert!(resolve_handler(&service, "remotes/ping").is_some());
        assert!(resolve_handler(&service, "echo/handlers/hello").is_some());

        let (_, component) = resolve_handler(&service, "cache/handlers/get").unwrap();
        assert_eq!(component.unwrap().name(), "cache");

        assert!(resolve_handler(&service, "handlers/missing").is_none());
        assert!(resolve_handler(&service, "other/handlers/hello").is_none());
        assert!(resolve_handler(&service, "hello").is_none());
    }
}
