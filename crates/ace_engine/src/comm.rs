//! src/comm.rs
//!
//! Group communicator.
//!
//! A run in distributed mode is a group of ranks. Rank 0 is the master; the
//! ranks sharing a node also form a local group, numbered from local rank 0.
//! Two message scopes exist:
//! - `Scope::Group`: rank to rank, used by the work distribution protocol.
//! - `Scope::Local`: node-local, used once at startup for device placement.
//!
//! Delivery is event driven. A component implements `MessageHandler` and is
//! registered with `drive`, which hands it whichever message arrives next.
//! Nothing ever blocks waiting on one particular peer.
//!
//! `LocalGroup` implements the communicator in-process over crossbeam
//! channels, one inbox per rank. It stands in for a real cluster transport
//! in tests and in the command line simulation.

use crossbeam_channel::{unbounded, Receiver, RecvError, RecvTimeoutError, Sender};
use log::trace;
use std::time::Duration;

use crate::error::{AceError, AceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Group,
    Local,
}

/// One received message. `from` is a group rank for `Scope::Group` and a
/// local rank for `Scope::Local`.
#[derive(Debug)]
pub struct Envelope {
    pub from: usize,
    pub scope: Scope,
    pub data: Vec<u8>,
}

/// Group communicator collaborator.
pub trait Communicator: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn local_rank(&self) -> usize;

    fn local_size(&self) -> usize;

    fn is_master(&self) -> bool {
        self.rank() == 0
    }

    fn send(&self, rank: usize, data: Vec<u8>) -> AceResult<()>;

    fn send_local(&self, local_rank: usize, data: Vec<u8>) -> AceResult<()>;

    /// Next message from any peer, blocking until one arrives.
    fn recv(&self) -> AceResult<Envelope>;

    /// Next message from any peer, or `None` after `timeout` of silence.
    fn recv_timeout(&self, timeout: Duration) -> AceResult<Option<Envelope>>;
}

/// Receiver of communicator events.
pub trait MessageHandler {
    fn group_data_received(&mut self, data: &[u8], from: usize) -> AceResult<()>;

    fn local_data_received(&mut self, data: &[u8], from: usize) -> AceResult<()>;

    /// When true, `drive` returns.
    fn is_done(&self) -> bool;
}

/// Delivers messages to `handler` until it reports done.
///
/// Any handler error stops delivery and is returned. With an `idle_timeout`,
/// silence longer than it while the handler is not done is an
/// `EngineFailure`; without one `drive` waits indefinitely.
pub fn drive(
    comm: &dyn Communicator,
    handler: &mut dyn MessageHandler,
    idle_timeout: Option<Duration>,
) -> AceResult<()> {
    while !handler.is_done() {
        let envelope = match idle_timeout {
            None => comm.recv()?,
            Some(timeout) => comm.recv_timeout(timeout)?.ok_or_else(|| {
                AceError::engine(format!(
                    "Rank {} received no message within {:?}",
                    comm.rank(),
                    timeout
                ))
            })?,
        };
        trace!(
            "rank {} got {} bytes ({:?}) from {}",
            comm.rank(),
            envelope.data.len(),
            envelope.scope,
            envelope.from
        );
        match envelope.scope {
            Scope::Group => handler.group_data_received(&envelope.data, envelope.from)?,
            Scope::Local => handler.local_data_received(&envelope.data, envelope.from)?,
        }
    }
    Ok(())
}

// ================================================================================================
// In-process group
// ================================================================================================

/// Builds in-process communicator groups.
pub struct LocalGroup;

impl LocalGroup {
    /// `size` ranks on a single node.
    pub fn spawn(size: usize) -> Vec<LocalComm> {
        Self::spawn_nodes(1, size)
    }

    /// `nodes * ranks_per_node` ranks; rank `r` lives on node
    /// `r / ranks_per_node` with local rank `r % ranks_per_node`.
    pub fn spawn_nodes(nodes: usize, ranks_per_node: usize) -> Vec<LocalComm> {
        let size = nodes * ranks_per_node;
        let (senders, receivers): (Vec<Sender<Envelope>>, Vec<Receiver<Envelope>>) =
            (0..size).map(|_| unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                ranks_per_node,
                peers: senders.clone(),
                inbox,
            })
            .collect()
    }
}

/// One rank of an in-process group.
pub struct LocalComm {
    rank: usize,
    ranks_per_node: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
}

impl LocalComm {
    fn deliver(&self, to: usize, envelope: Envelope) -> AceResult<()> {
        let peer = self.peers.get(to).ok_or_else(|| {
            AceError::communication(format!(
                "Rank {} does not exist (group size {})",
                to,
                self.peers.len()
            ))
        })?;
        peer.send(envelope)
            .map_err(|_| AceError::communication(format!("Rank {} has left the group", to)))
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn local_rank(&self) -> usize {
        self.rank % self.ranks_per_node
    }

    fn local_size(&self) -> usize {
        self.ranks_per_node
    }

    fn send(&self, rank: usize, data: Vec<u8>) -> AceResult<()> {
        self.deliver(
            rank,
            Envelope {
                from: self.rank,
                scope: Scope::Group,
                data,
            },
        )
    }

    fn send_local(&self, local_rank: usize, data: Vec<u8>) -> AceResult<()> {
        if local_rank >= self.ranks_per_node {
            return Err(AceError::communication(format!(
                "Local rank {} does not exist (local size {})",
                local_rank, self.ranks_per_node
            )));
        }
        let node_base = self.rank - self.local_rank();
        self.deliver(
            node_base + local_rank,
            Envelope {
                from: self.local_rank(),
                scope: Scope::Local,
                data,
            },
        )
    }

    fn recv(&self) -> AceResult<Envelope> {
        self.inbox.recv().map_err(|RecvError| {
            AceError::communication(format!("Inbox of rank {} disconnected", self.rank))
        })
    }

    fn recv_timeout(&self, timeout: Duration) -> AceResult<Option<Envelope>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(AceError::communication(format!(
                "Inbox of rank {} disconnected",
                self.rank
            ))),
        }
    }
}
