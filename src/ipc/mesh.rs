//! Full-mesh channel topology between workers.
//!
//! For every unordered pair `(i, j)` one duplex channel is created; worker `i`
//! keeps the end facing `j` under index `j` and vice versa. A worker has no
//! port to itself: sends to its own index are delivered in-thread.

use tokio::sync::mpsc;

use super::protocol::Packet;
use crate::types::{Error, Result};

/// One end of a duplex channel.
#[derive(Debug)]
pub struct Port {
    pub tx: mpsc::UnboundedSender<Packet>,
    pub rx: mpsc::UnboundedReceiver<Packet>,
}

/// Create both ends of a duplex channel.
fn duplex() -> (Port, Port) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (Port { tx: a_tx, rx: a_rx }, Port { tx: b_tx, rx: b_rx })
}

/// A worker's channel table, keyed by peer index.
#[derive(Debug)]
pub struct Endpoint {
    index: usize,
    ports: Vec<Option<Port>>,
}

impl Endpoint {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.ports.len()
    }

    /// Split into the sending table and the per-peer receivers.
    pub fn into_parts(self) -> (Outbox, Vec<(usize, mpsc::UnboundedReceiver<Packet>)>) {
        let mut senders = Vec::with_capacity(self.ports.len());
        let mut inboxes = Vec::new();
        for (peer, port) in self.ports.into_iter().enumerate() {
            match port {
                Some(Port { tx, rx }) => {
                    senders.push(Some(tx));
                    inboxes.push((peer, rx));
                }
                None => senders.push(None),
            }
        }
        (
            Outbox {
                index: self.index,
                senders,
            },
            inboxes,
        )
    }
}

/// Build the endpoints of an `count`-worker mesh.
pub fn build_mesh(count: usize) -> Vec<Endpoint> {
    let mut tables: Vec<Vec<Option<Port>>> =
        (0..count).map(|_| (0..count).map(|_| None).collect()).collect();

    for i in 0..count {
        for j in (i + 1)..count {
            let (first, second) = duplex();
            tables[i][j] = Some(first);
            tables[j][i] = Some(second);
        }
    }

    tables
        .into_iter()
        .enumerate()
        .map(|(index, ports)| Endpoint { index, ports })
        .collect()
}

/// Sending half of a worker's channel table.
#[derive(Debug)]
pub struct Outbox {
    index: usize,
    senders: Vec<Option<mpsc::UnboundedSender<Packet>>>,
}

impl Outbox {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.senders.len()
    }

    /// Send to a peer. The caller handles sends to its own index.
    pub fn send(&self, peer: usize, packet: Packet) -> Result<()> {
        let sender = self
            .senders
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::internal(format!("worker {} has no port to {}", self.index, peer)))?;

        sender
            .send(packet)
            .map_err(|_| Error::closed(format!("worker {} is gone", peer)))
    }
}
