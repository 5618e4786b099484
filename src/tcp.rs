//! The protocol-level router.
//!
//! [`Tcp`] owns the established table (connections keyed by 4-tuple) and the
//! listen bindings. Arriving segments enter through
//! [`Tcp::segment_arrives`], which finds the owning connection, spawns a
//! SYN_RECV child when a connection request hits a listener, answers unknown
//! 4-tuples with a reset, and applies the lifecycle the state machine asks
//! for (accept-queue promotion, unhash on close). A background ticker drives
//! every connection's timers.

use crate::sock::TcpSock;
use crate::tcb::{self, AdvanceTimeResult, ProcessResult, Tcb};
use crate::wire::{ControlBlock, Segment};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<FxHasher>>;

/// How often the background ticker advances connection timers.
const TICK: Duration = Duration::from_millis(33);

/// A pair of endpoints that uniquely identifies a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// The local endpoint
    pub local: SocketAddrV4,
    /// The remote endpoint
    pub remote: SocketAddrV4,
}

impl ConnectionId {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self { local, remote }
    }

    /// The matching connection ID on the remote TCP.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

/// Why a connection or listener could not be opened.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    #[error("a connection with the same endpoints already exists")]
    Existing,
    #[error("another endpoint is already listening on this address")]
    AddressInUse,
}

pub struct Tcp {
    /// Connections (including in-progress handshakes) by 4-tuple. A
    /// connection is present here exactly while its state is not CLOSED.
    established: FxDashMap<ConnectionId, Arc<TcpSock>>,
    /// Listening endpoints by local address.
    listeners: FxDashMap<SocketAddrV4, Arc<TcpSock>>,
    /// Source of initial send sequence numbers.
    iss: Mutex<SmallRng>,
    /// Maximum transmission unit handed to new connections.
    mtu: u16,
}

impl Tcp {
    pub fn new(mtu: u16) -> Self {
        Self {
            established: Default::default(),
            listeners: Default::default(),
            iss: Mutex::new(SmallRng::from_entropy()),
            mtu,
        }
    }

    /// Converts the TCP into a shared handle.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn next_iss(&self) -> u32 {
        self.iss.lock().unwrap().gen()
    }

    /// Installs a listening endpoint on the given local address.
    pub fn listen(&self, local: SocketAddrV4) -> Result<Arc<TcpSock>, OpenError> {
        match self.listeners.entry(local) {
            Entry::Occupied(_) => Err(OpenError::AddressInUse),
            Entry::Vacant(entry) => {
                let sock = TcpSock::from_tcb(Tcb::listen(local, self.next_iss(), self.mtu));
                entry.insert(sock.clone());
                Ok(sock)
            }
        }
    }

    /// Removes a listening endpoint and releases anyone blocked on it.
    pub fn unbind(&self, local: SocketAddrV4) -> Option<Arc<TcpSock>> {
        let (_, sock) = self.listeners.remove(&local)?;
        sock.wake_all();
        Some(sock)
    }

    /// Active open: creates a connection in SYN_SENT and inserts it into the
    /// established table. The caller drains the SYN with
    /// [`Tcp::poll_segments`] and waits for the handshake with
    /// [`TcpSock::established`].
    pub fn connect(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Result<Arc<TcpSock>, OpenError> {
        let id = ConnectionId::new(local, remote);
        match self.established.entry(id) {
            Entry::Occupied(_) => Err(OpenError::Existing),
            Entry::Vacant(entry) => {
                let sock = TcpSock::from_tcb(Tcb::open(id, self.next_iss(), self.mtu));
                entry.insert(sock.clone());
                Ok(sock)
            }
        }
    }

    /// The single entry point for inbound segments. Returns the segments the
    /// stack wants to put on the wire in response.
    pub fn segment_arrives(&self, cb: ControlBlock) -> Vec<Segment> {
        let id = ConnectionId {
            local: SocketAddrV4::new(cb.daddr, cb.dport),
            remote: SocketAddrV4::new(cb.saddr, cb.sport),
        };

        if let Some(sock) = self.established.get(&id).map(|entry| entry.value().clone()) {
            return self.deliver(&sock, &cb);
        }

        if cb.flags.syn() && !cb.flags.ack() {
            if let Some(listener) = self
                .listeners
                .get(&id.local)
                .map(|entry| entry.value().clone())
            {
                return self.spawn_child(&listener, &cb);
            }
        }

        // No connection and nobody listening: a reset tears down whatever
        // state the peer holds. A reset itself is never answered.
        if cb.flags.rst() {
            return Vec::new();
        }
        tracing::debug!(?id, "segment for unknown connection, resetting");
        vec![Segment::new(tcb::reset_for(&cb), Vec::new())]
    }

    /// Allocates a SYN_RECV child for a connection request, links it to the
    /// listener, and inserts it into the established table.
    fn spawn_child(&self, listener: &Arc<TcpSock>, cb: &ControlBlock) -> Vec<Segment> {
        let child = TcpSock::spawn(listener, cb);
        let id = child.id();
        match self.established.entry(id) {
            Entry::Occupied(_) => {
                tracing::error!(?id, "established table insert failed, discarding connection request");
                listener.unlink_child(&child);
                Vec::new()
            }
            Entry::Vacant(entry) => {
                entry.insert(child.clone());
                tracing::debug!(?id, "connection request accepted");
                child.segments()
            }
        }
    }

    fn deliver(&self, sock: &Arc<TcpSock>, cb: &ControlBlock) -> Vec<Segment> {
        match sock.process(cb) {
            ProcessResult::Ok | ProcessResult::ChildEstablished => {}
            ProcessResult::Close => {
                self.established.remove(&sock.id());
            }
        }
        sock.segments()
    }

    /// Looks up a connection by 4-tuple.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<TcpSock>> {
        self.established.get(id).map(|entry| entry.value().clone())
    }

    /// Drains every connection's pending segments. The embedding calls this
    /// after user-path operations (connect, send, close) to pick up what
    /// they queued; the background ticker picks up stragglers.
    pub fn poll_segments(&self) -> Vec<Segment> {
        let mut out = Vec::new();
        for entry in self.established.iter() {
            out.extend(entry.value().segments());
        }
        out
    }

    /// Advances every connection's timers by `delta`, collecting segments
    /// that became due and destroying connections whose TIME_WAIT expired.
    pub fn advance_time(&self, delta: Duration) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut expired = Vec::new();
        for entry in self.established.iter() {
            let sock = entry.value();
            if sock.advance_time(delta) == AdvanceTimeResult::CloseConnection {
                expired.push(*entry.key());
            }
            out.extend(sock.segments());
        }
        for id in expired {
            tracing::debug!(?id, "TIME_WAIT expired, destroying connection");
            self.established.remove(&id);
        }
        out
    }

    /// Spawns the background ticker that drives connection timers and
    /// forwards segments that become due (retransmissions, mostly) to the
    /// transmit channel. The task ends when the receiver hangs up.
    pub fn start(self: &Arc<Self>, transmit: Sender<Segment>) -> JoinHandle<()> {
        let tcp = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(TICK).await;
                for segment in tcp.advance_time(TICK) {
                    if transmit.send(segment).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}
