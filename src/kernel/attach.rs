//! Wiring of declared events and timers onto a started instance.
//!
//! Listeners and timer tasks hold only weak references, so a detached or
//! destroyed instance is never kept alive by its own callbacks.

use serde_json::Value;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use super::context::{Kernel, ServiceContext};
use super::service::{listener, Component, Listener, Service, TimerState};
use super::worker::Worker;
use crate::definition::{EventFn, TimerDefinition, TimerSchedule};

/// Prefix marking an event that also subscribes to the global broadcast.
pub const GLOBAL_EVENT_MARKER: char = '~';

/// Split `~name` into `("name", true)`.
pub fn split_event_name(name: &str) -> (&str, bool) {
    match name.strip_prefix(GLOBAL_EVENT_MARKER) {
        Some(stripped) => (stripped, true),
        None => (name, false),
    }
}

/// Weak handles needed to rebuild a [`ServiceContext`] when a callback fires.
#[derive(Clone)]
struct Binding {
    worker: Weak<Worker>,
    service: Weak<Service>,
    component: Option<Weak<Component>>,
}

impl Binding {
    fn new(worker: &Rc<Worker>, service: &Rc<Service>, component: Option<&Rc<Component>>) -> Self {
        Self {
            worker: Rc::downgrade(worker),
            service: Rc::downgrade(service),
            component: component.map(Rc::downgrade),
        }
    }

    fn upgrade(&self) -> Option<ServiceContext> {
        let worker = self.worker.upgrade()?;
        let service = self.service.upgrade()?;
        let component = match &self.component {
            Some(component) => Some(component.upgrade()?),
            None => None,
        };
        Some(ServiceContext::new(service, component, Kernel::new(worker)))
    }
}

fn bind_listener(binding: Binding, f: EventFn) -> Listener {
    listener(move |args: Vec<Value>| {
        let cx = binding.upgrade();
        let f = f.clone();
        async move {
            match cx {
                Some(cx) => f(cx, args).await,
                None => Ok(()),
            }
        }
    })
}

impl Worker {
    /// Subscribe declared events and arm timers of `service` and its components.
    pub(crate) fn attach(self: &Rc<Self>, service: &Rc<Service>) {
        let mut globals = BTreeSet::new();

        for component in service.components() {
            let binding = Binding::new(self, service, Some(&component));
            for (name, f) in &component.definition().events {
                let (topic, global) = split_event_name(name);
                let token = service.subscribe(topic, bind_listener(binding.clone(), f.clone()));
                component.subscriptions.borrow_mut().push(token);
                if global {
                    globals.insert(topic.to_string());
                }
            }
            for (name, timer) in &component.definition().timers {
                if component.timers.state(name) == TimerState::Unset {
                    let handle = self.arm_timer(binding.clone(), name, timer);
                    component.timers.arm(name, handle);
                }
            }
        }

        let binding = Binding::new(self, service, None);
        for (name, f) in &service.definition().events {
            let (topic, global) = split_event_name(name);
            let token = service.subscribe(topic, bind_listener(binding.clone(), f.clone()));
            service.subscriptions.borrow_mut().push(token);
            if global {
                globals.insert(topic.to_string());
            }
        }
        for (name, timer) in &service.definition().timers {
            if service.timers.state(name) == TimerState::Unset {
                let handle = self.arm_timer(binding.clone(), name, timer);
                service.timers.arm(name, handle);
            }
        }

        let mut registry = self.global_events.borrow_mut();
        for topic in globals {
            let token = registry.subscribe(topic, service.router().clone());
            service.global_subscriptions.borrow_mut().push(token);
        }
    }

    /// Undo [`attach`](Self::attach): unsubscribe everything and cancel
    /// armed timers. Fired one-shot timers stay fired.
    pub(crate) fn detach(self: &Rc<Self>, service: &Rc<Service>) {
        for component in service.components() {
            for token in component.subscriptions.borrow_mut().drain(..) {
                service.unsubscribe(&token);
            }
            component.timers.disarm();
        }

        let tokens: Vec<_> = service.subscriptions.borrow_mut().drain(..).collect();
        for token in &tokens {
            service.unsubscribe(token);
        }
        service.timers.disarm();

        let mut registry = self.global_events.borrow_mut();
        for token in service.global_subscriptions.borrow_mut().drain(..) {
            registry.unsubscribe(&token);
        }
    }

    fn arm_timer(
        self: &Rc<Self>,
        binding: Binding,
        name: &str,
        timer: &TimerDefinition,
    ) -> tokio::task::JoinHandle<()> {
        let name = name.to_string();
        let timer = timer.clone();
        tokio::task::spawn_local(async move {
            match timer.schedule {
                TimerSchedule::Delay(after) => {
                    tokio::time::sleep(after).await;
                    let Some(cx) = binding.upgrade() else {
                        return;
                    };
                    match cx.component() {
                        Some(component) => component.timers.fire(&name),
                        None => cx.service().timers.fire(&name),
                    }
                    run_timer(cx, &name, &timer).await;
                }
                TimerSchedule::Interval(every) => {
                    let every = every.max(Duration::from_millis(1));
                    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        let Some(cx) = binding.upgrade() else {
                            return;
                        };
                        run_timer(cx, &name, &timer).await;
                    }
                }
            }
        })
    }

    /// Run the listeners of global event `name` on every subscribed live instance.
    pub(crate) async fn broad_event_local(
        self: &Rc<Self>,
        source: Option<crate::types::Router>,
        name: &str,
        args: Vec<Value>,
    ) {
        let routers = self.global_events.borrow().subscribers(name);
        tracing::debug!(
            "broad_event: index={} name={} source={:?} subscribers={}",
            self.index(),
            name,
            source.as_ref().map(ToString::to_string),
            routers.len()
        );
        for router in routers {
            if let Some(service) = self.live_service(&router) {
                service.emit(name, args.clone()).await;
            }
        }
    }
}

async fn run_timer(cx: ServiceContext, name: &str, timer: &TimerDefinition) {
    let service = cx.service().clone();
    let origin = match cx.component() {
        Some(component) => format!("timer:{}.{}", component.name(), name),
        None => format!("timer:{}", name),
    };
    if let Err(e) = (timer.run)(cx).await {
        service.report(origin, &e);
    }
}
