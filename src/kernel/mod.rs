//! Kernel - the runtime façade and its worker internals.
//!
//! [`Kite`] owns the worker threads. Each worker is a single-threaded actor:
//! it owns the services it hosts and talks to its peers only through the
//! mesh. Subsystems (lifecycle, attachment, dispatch) are `impl Worker`
//! blocks, not separate actors.
//!
//! ```text
//!                 ┌──────────── Kite ────────────┐
//!   fetch/notify  │ control[0]  control[1]  ...  │
//!   create/stop → │     │           │            │
//!                 └─────┼───────────┼────────────┘
//!                       ▼           ▼
//!                  ┌─────────┐ ┌─────────┐
//!                  │worker 0 │◀▶│worker 1 │ ◀▶ ... (full mesh)
//!                  └─────────┘ └─────────┘
//! ```

mod attach;
mod context;
mod dispatch;
mod lifecycle;
mod resources;
mod service;
mod worker;

pub use attach::{split_event_name, GLOBAL_EVENT_MARKER};
pub use context::{Kernel, MiddlewareContext, ServiceContext, Target};
pub use dispatch::resolve_handler;
pub use resources::{Resource, Resources, SharedResource};
pub use service::{
    listener, Component, Listener, RuntimeError, Service, ServiceInfo, ServiceRef, ServiceState,
    TimerState,
};

use serde_json::Value;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::definition::{BootDefinition, Module, Registry};
use crate::dependency::build_dependency;
use crate::envelope::{Request, Response};
use crate::ipc::{build_mesh, Call, Reply};
use crate::types::{shard, Config, Error, Result, Router};
use worker::{spawn_worker, unexpected, Control, WorkerSeed};

enum State {
    Idle,
    Running {
        controls: Vec<mpsc::UnboundedSender<Control>>,
        threads: Vec<thread::JoinHandle<()>>,
        cancel: CancellationToken,
    },
    Stopped,
}

/// The runtime.
///
/// Register modules, resources and boot definitions, then [`start`](Self::start).
/// Every routing operation is forwarded to the worker owning the target
/// router.
pub struct Kite {
    config: Config,
    modules: Vec<Module>,
    resources: Vec<(String, Resource)>,
    boots: Vec<BootDefinition>,
    errors: broadcast::Sender<RuntimeError>,
    state: State,
}

impl Kite {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let capacity = config.runtime.error_channel_capacity.max(1);
        let (errors, _) = broadcast::channel(capacity);
        Self {
            config,
            modules: Vec::new(),
            resources: Vec::new(),
            boots: Vec::new(),
            errors,
            state: State::Idle,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_idle(&self, what: &str) -> Result<()> {
        match self.state {
            State::Idle => Ok(()),
            _ => Err(Error::config(format!("cannot {} after start", what))),
        }
    }

    /// Register a definitions bundle.
    pub fn regist(&mut self, module: Module) -> Result<&mut Self> {
        self.ensure_idle("register a module")?;
        tracing::debug!("module_registered: name={}", module.name());
        self.modules.push(module);
        Ok(self)
    }

    /// Register a process-wide resource, materialized at start.
    pub fn resource(&mut self, name: impl Into<String>, resource: Resource) -> Result<&mut Self> {
        self.ensure_idle("register a resource")?;
        self.resources.push((name.into(), resource));
        Ok(self)
    }

    /// Add services to create and global middlewares to install at start.
    pub fn boot(&mut self, boot: BootDefinition) -> Result<&mut Self> {
        self.ensure_idle("add a boot definition")?;
        self.boots.push(boot);
        Ok(self)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Number of workers, zero unless running.
    pub fn worker_count(&self) -> usize {
        match &self.state {
            State::Running { controls, .. } => controls.len(),
            _ => 0,
        }
    }

    /// Stand up the worker mesh and create the boot services.
    ///
    /// `workers` overrides the configured worker count. Configuration errors
    /// abort startup before any worker runs.
    pub async fn start(&mut self, workers: Option<usize>) -> Result<()> {
        self.ensure_idle("start")?;
        let count = match workers {
            Some(0) => return Err(Error::config("worker count must be positive")),
            Some(n) => n,
            None => self.config.worker_count()?,
        };

        let (registry, mut declared) = Registry::build(std::mem::take(&mut self.modules))?;
        declared.append(&mut self.resources);
        let resources = Arc::new(Resources::materialize(declared)?);
        let boot = Arc::new(std::mem::take(&mut self.boots));
        validate_boot(&registry, &boot)?;
        let registry = Arc::new(registry);

        tracing::info!(
            "kite_starting: workers={} services={} resources={}",
            count,
            registry.service_types().count(),
            resources.len()
        );

        let sessions = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let mut controls = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        let mut readiness = Vec::with_capacity(count);

        for endpoint in build_mesh(count) {
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let seed = WorkerSeed {
                endpoint,
                registry: registry.clone(),
                resources: resources.clone(),
                boot: boot.clone(),
                sessions: sessions.clone(),
                errors: self.errors.clone(),
            };
            match spawn_worker(seed, control_rx, ready_tx, cancel.child_token()) {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    cancel.cancel();
                    return Err(e);
                }
            }
            controls.push(control_tx);
            readiness.push(ready_rx);
        }

        for (index, ready) in readiness.into_iter().enumerate() {
            let outcome = ready
                .await
                .unwrap_or_else(|_| Err(Error::closed(format!("worker {} exited during start", index))));
            if let Err(e) = outcome {
                cancel.cancel();
                return Err(e);
            }
        }

        self.state = State::Running {
            controls,
            threads,
            cancel,
        };

        if let Err(e) = self.request(0, Call::Boot).await {
            tracing::error!("boot_failed: error={}", e);
            if let Err(stop_error) = self.stop().await {
                tracing::warn!("stop_after_boot_failure: error={}", stop_error);
            }
            return Err(e);
        }

        tracing::info!("kite_started: workers={}", count);
        Ok(())
    }

    /// Coordinated, dependency-ordered shutdown, then join the workers.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let timeout = self.config.runtime.shutdown_timeout;

        tracing::info!("kite_stopping");
        let shutdown = match tokio::time::timeout(timeout, self.request(0, Call::Shutdown)).await {
            Ok(outcome) => outcome.map(|_| ()),
            Err(_) => Err(Error::internal(format!(
                "coordinated stop exceeded {:?}",
                timeout
            ))),
        };

        let State::Running {
            controls,
            threads,
            cancel,
        } = std::mem::replace(&mut self.state, State::Stopped)
        else {
            return shutdown;
        };
        cancel.cancel();
        drop(controls);

        let joined = tokio::task::spawn_blocking(move || {
            threads
                .into_iter()
                .filter_map(|handle| handle.join().err())
                .count()
        });
        match tokio::time::timeout(timeout, joined).await {
            Ok(Ok(0)) => tracing::info!("kite_stopped"),
            Ok(Ok(panicked)) => tracing::warn!("kite_stopped: panicked_workers={}", panicked),
            Ok(Err(e)) => tracing::warn!("worker_join_failed: error={}", e),
            Err(_) => tracing::warn!("worker_join_timed_out: timeout={:?}", timeout),
        }
        shutdown
    }

    fn controls(&self) -> Result<&[mpsc::UnboundedSender<Control>]> {
        match &self.state {
            State::Running { controls, .. } => Ok(controls),
            _ => Err(Error::closed("kite is not running")),
        }
    }

    fn owner(&self, router: &Router) -> Result<usize> {
        Ok(shard(router, self.controls()?.len()))
    }

    /// Run `call` on `worker` and await the outcome.
    async fn request(&self, worker: usize, call: Call) -> Result<Reply> {
        let control = self
            .controls()?
            .get(worker)
            .ok_or_else(|| Error::internal(format!("no worker {}", worker)))?;
        let (reply, rx) = oneshot::channel();
        control
            .send(Control {
                call,
                reply: Some(reply),
            })
            .map_err(|_| Error::closed(format!("worker {} is gone", worker)))?;
        rx.await
            .map_err(|_| Error::closed(format!("worker {} dropped the call", worker)))?
    }

    /// Run `call` on `worker` without waiting for it.
    fn post(&self, worker: usize, call: Call) -> Result<()> {
        let control = self
            .controls()?
            .get(worker)
            .ok_or_else(|| Error::internal(format!("no worker {}", worker)))?;
        control
            .send(Control { call, reply: None })
            .map_err(|_| Error::closed(format!("worker {} is gone", worker)))
    }

    /// Send a request and await its response. Failures become `502`.
    pub async fn fetch(&self, request: Request) -> Response {
        let target = request.target.clone();
        let outcome = match self.owner(&target) {
            Ok(owner) => self.request(owner, Call::Fetch(request)).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(Reply::Response(response)) => response,
            Ok(other) => Response::bad_gateway(unexpected(other).to_string()),
            Err(e) => {
                tracing::debug!("fetch_failed: target={} error={}", target, e);
                Response::bad_gateway(e.to_string())
            }
        }
    }

    /// Fire-and-forget request.
    pub fn notify(&self, request: Request) -> Result<()> {
        let owner = self.owner(&request.target)?;
        self.post(owner, Call::Notify(request))
    }

    pub async fn create_service(&self, router: Router, options: Value) -> Result<ServiceRef> {
        let owner = self.owner(&router)?;
        match self.request(owner, Call::CreateService { router, options }).await? {
            Reply::Created(service) => Ok(service),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stop_service(&self, router: Router, force_destroy: bool) -> Result<()> {
        let owner = self.owner(&router)?;
        self.request(
            owner,
            Call::StopService {
                router,
                force_destroy,
            },
        )
        .await
        .map(|_| ())
    }

    /// Fan `name` out to every service on every worker that subscribed to it
    /// globally.
    pub fn broad_event(
        &self,
        source: Option<Router>,
        name: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<()> {
        let name = name.into();
        for worker in 0..self.controls()?.len() {
            self.post(
                worker,
                Call::BroadEvent {
                    source: source.clone(),
                    name: name.clone(),
                    args: args.clone(),
                },
            )?;
        }
        Ok(())
    }

    /// Notify every live instance of `kind` on every worker.
    pub fn notify_all(
        &self,
        source: Option<Router>,
        kind: impl Into<String>,
        path: impl Into<String>,
        body: Value,
    ) -> Result<()> {
        let (kind, path) = (kind.into(), path.into());
        for worker in 0..self.controls()?.len() {
            self.post(
                worker,
                Call::NotifyAll {
                    source: source.clone(),
                    kind: kind.clone(),
                    path: path.clone(),
                    body: body.clone(),
                },
            )?;
        }
        Ok(())
    }

    pub async fn service_state(&self, router: Router) -> Result<ServiceState> {
        let owner = self.owner(&router)?;
        match self.request(owner, Call::Inspect(router)).await? {
            Reply::State(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    /// Live instances on every worker, ordered by worker then router.
    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let mut services = Vec::new();
        for worker in 0..self.controls()?.len() {
            match self.request(worker, Call::ListServices).await? {
                Reply::Services(mut listed) => services.append(&mut listed),
                other => return Err(unexpected(other)),
            }
        }
        Ok(services)
    }

    /// Runtime errors from timers, listeners, hooks and notifications.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<RuntimeError> {
        self.errors.subscribe()
    }
}

impl Default for Kite {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Kite {
    fn drop(&mut self) {
        if let State::Running { cancel, .. } = &self.state {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Kite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Idle => "idle",
            State::Running { .. } => "running",
            State::Stopped => "stopped",
        };
        f.debug_struct("Kite")
            .field("state", &state)
            .field("workers", &self.worker_count())
            .field("modules", &self.modules.len())
            .finish_non_exhaustive()
    }
}

/// Boot services and middlewares must be registered and boot order acyclic.
fn validate_boot(registry: &Registry, boots: &[BootDefinition]) -> Result<()> {
    let mut kinds = Vec::new();
    for boot in boots {
        for create in &boot.services {
            registry.service(&create.router.kind)?;
            kinds.push(create.router.kind.as_str());
        }
        for info in &boot.middlewares {
            registry.middleware_for(None, &info.name)?;
        }
    }
    build_dependency(&registry.dependency_map(kinds, false))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ServiceDefinition;

    #[tokio::test]
    async fn test_not_running_operations_fail() {
        let kite = Kite::new();
        assert!(!kite.is_running());
        assert_eq!(kite.worker_count(), 0);

        let response = kite
            .fetch(Request::fetch(Router::new("echo", "a"), "handlers/hello"))
            .await;
        assert_eq!(response.status, 502);
        assert!(matches!(
            kite.create_service(Router::new("echo", "a"), Value::Null).await,
            Err(Error::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let mut kite = Kite::new();
        assert!(matches!(kite.start(Some(0)).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_boot_service_aborts_start() {
        let mut kite = Kite::new();
        kite.regist(Module::new("m").service("echo", ServiceDefinition::new()))
            .unwrap()
            .boot(BootDefinition::new().service("missing/a"))
            .unwrap();
        assert!(matches!(
            kite.start(Some(1)).await,
            Err(Error::UnknownService(_))
        ));
        assert!(!kite.is_running());
    }

    #[tokio::test]
    async fn test_boot_cycle_aborts_start() {
        let mut kite = Kite::new();
        kite.regist(
            Module::new("m")
                .service("a", ServiceDefinition::new().depends("b"))
                .service("b", ServiceDefinition::new().depends("a")),
        )
        .unwrap()
        .boot(BootDefinition::new().service("a/1"))
        .unwrap();
        assert!(matches!(
            kite.start(Some(1)).await,
            Err(Error::CircularDependency(_))
        ));
    }

    #[tokio::test]
    async fn test_regist_after_start_rejected() {
        let mut kite = Kite::new();
        kite.start(Some(2)).await.unwrap();
        assert!(kite.is_running());
        assert_eq!(kite.worker_count(), 2);
        assert!(matches!(
            kite.regist(Module::new("late")),
            Err(Error::Config(_))
        ));
        kite.stop().await.unwrap();
        assert!(!kite.is_running());
    }
}
