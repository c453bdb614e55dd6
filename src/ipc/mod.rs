//! In-process worker mesh transport.
//!
//! Workers talk over a full mesh of unbounded channels carrying [`Packet`]s.
//! Requests that expect an answer carry a session id; the replying side
//! answers with a single packet or a stream of packets under that id.

pub mod mesh;
pub mod protocol;
pub mod session;

pub use mesh::{build_mesh, Endpoint, Outbox};
pub use protocol::{Call, Packet, Reply, WireError};
pub use session::{SessionResult, SessionTable};
