//! Tagged-union messages exchanged between workers.
//!
//! ```text
//!  caller worker                         owning worker
//!  ─────────────                         ─────────────
//!  Call{session, call}      ───────▶     execute(call)
//!                           ◀───────     Resp{session, reply} | Err{session, error}
//!
//!  streamed reply:          ◀───────     StreamCreate{session, head}
//!                           ◀───────     StreamData{session, chunk} *
//!                           ◀───────     StreamEnd{session} | StreamError{session, error}
//!
//!  Notify{call}             ───────▶     execute(call), no reply
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{Request, Response};
use crate::kernel::{ServiceInfo, ServiceRef, ServiceState};
use crate::types::{Error, Router};

/// Operation executed by the worker that receives it.
#[derive(Debug)]
pub enum Call {
    /// Dependency-ordered creation of the boot services (worker 0 only).
    Boot,
    /// Coordinated, dependency-ordered shutdown (worker 0 only).
    Shutdown,
    CreateService {
        router: Router,
        options: Value,
    },
    StopService {
        router: Router,
        force_destroy: bool,
    },
    /// Stop every live instance of the listed types, walking the list back to front.
    StopManyServices {
        types: Vec<String>,
        force_destroy: bool,
    },
    /// Destroy everything left, live or cached.
    StopAll,
    Fetch(Request),
    Notify(Request),
    BroadEvent {
        source: Option<Router>,
        name: String,
        args: Vec<Value>,
    },
    NotifyAll {
        source: Option<Router>,
        kind: String,
        path: String,
        body: Value,
    },
    Inspect(Router),
    ListTypes,
    ListServices,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Boot => "boot",
            Call::Shutdown => "shutdown",
            Call::CreateService { .. } => "create_service",
            Call::StopService { .. } => "stop_service",
            Call::StopManyServices { .. } => "stop_many_services",
            Call::StopAll => "stop_all",
            Call::Fetch(_) => "fetch",
            Call::Notify(_) => "notify",
            Call::BroadEvent { .. } => "broad_event",
            Call::NotifyAll { .. } => "notify_all",
            Call::Inspect(_) => "inspect",
            Call::ListTypes => "list_types",
            Call::ListServices => "list_services",
        }
    }
}

/// Successful result of a [`Call`].
#[derive(Debug)]
pub enum Reply {
    Done,
    Created(ServiceRef),
    Response(Response),
    State(ServiceState),
    Types(Vec<String>),
    Services(Vec<ServiceInfo>),
}

/// Error as it travels between workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl WireError {
    pub fn into_error(self) -> Error {
        Error::from_wire(&self.code, self.message)
    }
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.detail(),
        }
    }
}

impl From<Error> for WireError {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

/// One message on a worker-to-worker channel.
#[derive(Debug)]
pub enum Packet {
    Call { session: u64, call: Call },
    Notify { call: Call },
    Resp { session: u64, reply: Reply },
    Err { session: u64, error: WireError },
    /// Opens a streamed reply; `head` carries status and headers, its body is empty.
    StreamCreate { session: u64, head: Response },
    StreamData { session: u64, chunk: Value },
    StreamEnd { session: u64 },
    StreamError { session: u64, error: WireError },
}

impl Packet {
    /// Session this packet settles, if it is a reply.
    pub fn reply_session(&self) -> Option<u64> {
        match self {
            Packet::Call { .. } | Packet::Notify { .. } => None,
            Packet::Resp { session, .. }
            | Packet::Err { session, .. }
            | Packet::StreamCreate { session, .. }
            | Packet::StreamData { session, .. }
            | Packet::StreamEnd { session }
            | Packet::StreamError { session, .. } => Some(*session),
        }
    }
}
