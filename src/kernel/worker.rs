//! One worker: a thread running a single-threaded runtime.
//!
//! All service state of a worker lives behind `Rc`/`RefCell` and is touched
//! only from that worker's thread. Peers reach it through the mesh; the
//! owning [`Kite`](super::Kite) reaches it through a control channel.

use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::lifecycle::ServiceTable;
use super::resources::Resources;
use super::service::{RuntimeError, Service, ServiceRef, ServiceState};
use crate::commbus::Topics;
use crate::definition::{BootDefinition, Registry};
use crate::envelope::{Request, Response};
use crate::ipc::{Call, Endpoint, Outbox, Packet, Reply, SessionTable, WireError};
use crate::middleware::Pipeline;
use crate::types::{shard, Error, Result, Router};

/// Request from the owning [`Kite`](super::Kite) to one worker.
///
/// Without a reply slot the call is fire-and-forget and failures are
/// reported as runtime errors.
#[derive(Debug)]
pub(crate) struct Control {
    pub call: Call,
    pub reply: Option<oneshot::Sender<Result<Reply>>>,
}

/// Everything a worker thread needs to start.
pub(crate) struct WorkerSeed {
    pub endpoint: Endpoint,
    pub registry: Arc<Registry>,
    pub resources: Arc<Resources>,
    pub boot: Arc<Vec<BootDefinition>>,
    pub sessions: Arc<AtomicU64>,
    pub errors: broadcast::Sender<RuntimeError>,
}

/// Waiters parked on an in-flight creation.
pub(crate) type CreateWaiters =
    Vec<oneshot::Sender<std::result::Result<ServiceRef, WireError>>>;

pub(crate) struct Worker {
    index: usize,
    count: usize,
    outbox: Outbox,
    pub(crate) registry: Arc<Registry>,
    resources: Arc<Resources>,
    pub(crate) boot: Arc<Vec<BootDefinition>>,
    sessions: RefCell<SessionTable>,
    pub(crate) services: RefCell<ServiceTable>,
    pub(crate) creating: RefCell<HashMap<Router, CreateWaiters>>,
    pub(crate) global_events: RefCell<Topics<Router>>,
    pub(crate) pipeline: RefCell<Pipeline>,
    pub(crate) errors: broadcast::Sender<RuntimeError>,
}

/// Start a worker thread.
///
/// `ready` resolves once the worker installed its global pipeline and is
/// reading from its peers, or with the error that prevented it.
pub(crate) fn spawn_worker(
    seed: WorkerSeed,
    control: mpsc::UnboundedReceiver<Control>,
    ready: oneshot::Sender<Result<()>>,
    cancel: CancellationToken,
) -> Result<thread::JoinHandle<()>> {
    let name = format!("kite-worker-{}", seed.endpoint.index());
    let handle = thread::Builder::new().name(name).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready.send(Err(Error::Io(e)));
                return;
            }
        };
        let span = tracing::info_span!("worker", index = seed.endpoint.index());
        let local = LocalSet::new();
        local.block_on(&runtime, Worker::run(seed, control, ready, cancel).instrument(span));
    })?;
    Ok(handle)
}

impl Worker {
    async fn run(
        seed: WorkerSeed,
        mut control: mpsc::UnboundedReceiver<Control>,
        ready: oneshot::Sender<Result<()>>,
        cancel: CancellationToken,
    ) {
        let WorkerSeed {
            endpoint,
            registry,
            resources,
            boot,
            sessions,
            errors,
        } = seed;
        let (outbox, inboxes) = endpoint.into_parts();

        let worker = Rc::new(Worker {
            index: outbox.index(),
            count: outbox.count(),
            outbox,
            registry,
            resources,
            boot,
            sessions: RefCell::new(SessionTable::new(sessions)),
            services: RefCell::new(ServiceTable::default()),
            creating: RefCell::new(HashMap::new()),
            global_events: RefCell::new(Topics::new()),
            pipeline: RefCell::new(Pipeline::default()),
            errors,
        });

        if let Err(e) = worker.install_pipeline().await {
            tracing::error!("worker_init_failed: index={} error={}", worker.index, e);
            worker.pipeline.replace(Pipeline::default());
            let _ = ready.send(Err(e));
            return;
        }

        for (peer, rx) in inboxes {
            tokio::task::spawn_local(Self::read_peer(worker.clone(), peer, rx));
        }

        let _ = ready.send(Ok(()));
        tracing::info!("worker_started: index={} workers={}", worker.index, worker.count);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = control.recv() => match message {
                    Some(Control { call, reply }) => {
                        let worker = worker.clone();
                        tokio::task::spawn_local(async move {
                            let name = call.name();
                            let outcome = worker.execute(call).await;
                            match reply {
                                Some(reply) => {
                                    let _ = reply.send(outcome);
                                }
                                None => {
                                    if let Err(e) = outcome {
                                        worker.report(None, format!("notify:{}", name), &e);
                                    }
                                }
                            }
                        });
                    }
                    None => break,
                },
            }
        }

        // Global middlewares hold a `Kernel`, which holds the worker.
        worker.pipeline.replace(Pipeline::default());
        tracing::info!("worker_stopped: index={}", worker.index);
    }

    async fn read_peer(
        worker: Rc<Worker>,
        peer: usize,
        mut rx: mpsc::UnboundedReceiver<Packet>,
    ) {
        while let Some(packet) = rx.recv().await {
            worker.on_packet(peer, packet);
        }
        tracing::debug!("peer_closed: index={} peer={}", worker.index, peer);
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    pub(crate) fn live_service(&self, router: &Router) -> Option<Rc<Service>> {
        self.services.borrow().live(router)
    }

    /// Handle one packet from `from`.
    ///
    /// Calls run in their own task so a slow handler never blocks the
    /// channel; replies settle their session inline, which keeps stream
    /// chunks in order.
    fn on_packet(self: &Rc<Self>, from: usize, packet: Packet) {
        match packet {
            Packet::Call { session, call } => {
                let worker = self.clone();
                tokio::task::spawn_local(async move { worker.answer(from, session, call).await });
            }
            Packet::Notify { call } => {
                let worker = self.clone();
                tokio::task::spawn_local(async move {
                    let name = call.name();
                    if let Err(e) = worker.execute(call).await {
                        worker.report(None, format!("notify:{}", name), &e);
                    }
                });
            }
            Packet::Resp { session, reply } => {
                self.sessions.borrow_mut().resolve(session, reply);
            }
            Packet::Err { session, error } => {
                self.sessions.borrow_mut().reject(session, error);
            }
            Packet::StreamCreate { session, head } => {
                self.sessions.borrow_mut().stream_create(session, head);
            }
            Packet::StreamData { session, chunk } => {
                self.sessions.borrow_mut().stream_data(session, chunk);
            }
            Packet::StreamEnd { session } => {
                self.sessions.borrow_mut().stream_end(session);
            }
            Packet::StreamError { session, error } => {
                self.sessions.borrow_mut().stream_error(session, error);
            }
        }
    }

    /// Execute a call from `from` and send the outcome back under `session`.
    async fn answer(self: Rc<Self>, from: usize, session: u64, call: Call) {
        match self.execute(call).await {
            Ok(Reply::Response(mut response)) if response.body.is_stream() => {
                let body = response.take_body();
                self.deliver(from, Packet::StreamCreate { session, head: response });
                if let Some(mut stream) = body.into_stream() {
                    while let Some(chunk) = stream.next_chunk().await {
                        match chunk {
                            Ok(chunk) => self.deliver(from, Packet::StreamData { session, chunk }),
                            Err(e) => {
                                self.deliver(
                                    from,
                                    Packet::StreamError {
                                        session,
                                        error: WireError::from(&e),
                                    },
                                );
                                return;
                            }
                        }
                    }
                }
                self.deliver(from, Packet::StreamEnd { session });
            }
            Ok(reply) => self.deliver(from, Packet::Resp { session, reply }),
            Err(e) => self.deliver(
                from,
                Packet::Err {
                    session,
                    error: WireError::from(&e),
                },
            ),
        }
    }

    /// Send `packet` to `peer`; packets for this worker are handled in place.
    fn deliver(self: &Rc<Self>, peer: usize, packet: Packet) {
        if let Err(e) = self.send(peer, packet) {
            tracing::warn!("deliver_failed: index={} peer={} error={}", self.index, peer, e);
        }
    }

    fn send(self: &Rc<Self>, peer: usize, packet: Packet) -> Result<()> {
        if peer == self.index {
            self.on_packet(self.index, packet);
            Ok(())
        } else {
            self.outbox.send(peer, packet)
        }
    }

    /// Run `call` on `peer` and await its reply.
    pub(crate) async fn call_worker(self: &Rc<Self>, peer: usize, call: Call) -> Result<Reply> {
        let (session, rx) = self.sessions.borrow_mut().open();
        if let Err(e) = self.send(peer, Packet::Call { session, call }) {
            self.sessions.borrow_mut().cancel(session);
            return Err(e);
        }
        match rx.await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(error)) => Err(error.into_error()),
            Err(_) => Err(Error::closed(format!("worker {} dropped session {}", peer, session))),
        }
    }

    /// Run `call` on `peer` without waiting for an answer.
    pub(crate) fn notify_worker(self: &Rc<Self>, peer: usize, call: Call) {
        self.deliver(peer, Packet::Notify { call });
    }

    /// Execute a call addressed to this worker.
    pub(crate) async fn execute(self: &Rc<Self>, call: Call) -> Result<Reply> {
        tracing::trace!("execute: index={} call={}", self.index, call.name());
        match call {
            Call::Boot => {
                self.boot_services().await?;
                Ok(Reply::Done)
            }
            Call::Shutdown => {
                self.coordinated_stop().await?;
                Ok(Reply::Done)
            }
            Call::CreateService { router, options } => {
                self.create_service(router, options).await.map(Reply::Created)
            }
            Call::StopService {
                router,
                force_destroy,
            } => {
                self.stop_service(&router, force_destroy).await;
                Ok(Reply::Done)
            }
            Call::StopManyServices {
                types,
                force_destroy,
            } => {
                self.stop_many(&types, force_destroy).await;
                Ok(Reply::Done)
            }
            Call::StopAll => {
                self.stop_all().await;
                Ok(Reply::Done)
            }
            Call::Fetch(request) => self.fetch_local(request).await.map(Reply::Response),
            Call::Notify(request) => {
                self.notify_local(request).await?;
                Ok(Reply::Done)
            }
            Call::BroadEvent { source, name, args } => {
                self.broad_event_local(source, &name, args).await;
                Ok(Reply::Done)
            }
            Call::NotifyAll {
                source,
                kind,
                path,
                body,
            } => {
                self.notify_all_local(source, &kind, &path, body).await;
                Ok(Reply::Done)
            }
            Call::Inspect(router) => Ok(Reply::State(self.services.borrow().state(&router))),
            Call::ListTypes => Ok(Reply::Types(self.services.borrow().live_types())),
            Call::ListServices => Ok(Reply::Services(self.services.borrow().infos())),
        }
    }

    // ---- routing by owner ----

    fn owner(&self, router: &Router) -> usize {
        shard(router, self.count)
    }

    pub(crate) async fn route_fetch(self: &Rc<Self>, request: Request) -> Response {
        let owner = self.owner(&request.target);
        let target = request.target.clone();
        match self.call_worker(owner, Call::Fetch(request)).await {
            Ok(Reply::Response(response)) => response,
            Ok(other) => Response::bad_gateway(unexpected(other).to_string()),
            Err(e) => {
                tracing::debug!("fetch_failed: target={} error={}", target, e);
                Response::bad_gateway(e.to_string())
            }
        }
    }

    pub(crate) fn route_notify(self: &Rc<Self>, request: Request) {
        let owner = self.owner(&request.target);
        self.notify_worker(owner, Call::Notify(request));
    }

    pub(crate) async fn route_create(
        self: &Rc<Self>,
        router: Router,
        options: Value,
    ) -> Result<ServiceRef> {
        let owner = self.owner(&router);
        match self
            .call_worker(owner, Call::CreateService { router, options })
            .await?
        {
            Reply::Created(service) => Ok(service),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn route_stop(self: &Rc<Self>, router: Router, force_destroy: bool) -> Result<()> {
        let owner = self.owner(&router);
        self.call_worker(
            owner,
            Call::StopService {
                router,
                force_destroy,
            },
        )
        .await
        .map(|_| ())
    }

    pub(crate) async fn route_state(self: &Rc<Self>, router: Router) -> Result<ServiceState> {
        let owner = self.owner(&router);
        match self.call_worker(owner, Call::Inspect(router)).await? {
            Reply::State(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) fn route_broad_event(self: &Rc<Self>, source: Option<Router>, name: String, args: Vec<Value>) {
        for peer in 0..self.count {
            self.notify_worker(
                peer,
                Call::BroadEvent {
                    source: source.clone(),
                    name: name.clone(),
                    args: args.clone(),
                },
            );
        }
    }

    pub(crate) fn route_notify_all(
        self: &Rc<Self>,
        source: Option<Router>,
        kind: String,
        path: String,
        body: Value,
    ) {
        for peer in 0..self.count {
            self.notify_worker(
                peer,
                Call::NotifyAll {
                    source: source.clone(),
                    kind: kind.clone(),
                    path: path.clone(),
                    body: body.clone(),
                },
            );
        }
    }

    /// Log a failure and publish it as a runtime error event.
    pub(crate) fn report(&self, router: Option<Router>, origin: String, error: &Error) {
        tracing::error!(
            "runtime_error: index={} router={:?} origin={} error={}",
            self.index,
            router.as_ref().map(ToString::to_string),
            origin,
            error
        );
        let _ = self.errors.send(RuntimeError {
            worker: self.index,
            router,
            origin,
            code: error.code().to_string(),
            message: error.detail(),
            at: chrono::Utc::now(),
        });
    }
}

pub(crate) fn unexpected(reply: Reply) -> Error {
    Error::internal(format!("unexpected reply: {:?}", reply))
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("count", &self.count)
            .field("services", &self.services.borrow())
            .finish_non_exhaustive()
    }
}
