//! The user-facing socket surface.
//!
//! A [`TcpSock`] wraps one connection's [`Tcb`] behind a lock and attaches
//! the four named wait points: `wait_connect`, `wait_accept`, `wait_send`,
//! and `wait_recv`. The protocol path never blocks; the blocking user calls
//! (connect, accept, send, recv) suspend on these wait points and are
//! released when segment processing signals the matching edge. A waiter that
//! wakes always re-checks connection state under the lock, so state
//! mutations performed before the wake are observed.
//!
//! A listening sock additionally owns the two child queues: the listen queue
//! (children still in SYN_RECV) and the accept queue (established children
//! an accept call has not picked up yet). A child holds a non-owning back
//! reference to its listener, used only for signalling and queue movement.

use crate::tcb::{AdvanceTimeResult, CloseResult, ProcessResult, State, Tcb, WakeSet};
use crate::tcp::ConnectionId;
use crate::wire::{ControlBlock, Segment};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;

/// Errors surfaced by the blocking socket operations.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SockError {
    #[error("the connection is closed")]
    Closed,
    #[error("the connection was refused by the peer")]
    Refused,
}

#[derive(Debug)]
pub struct TcpSock {
    tcb: RwLock<Tcb>,
    /// The listener this connection was spawned from, if any.
    parent: RwLock<Weak<TcpSock>>,
    /// Children in SYN_RECV, waiting for their handshake ACK
    listen_queue: Mutex<VecDeque<Arc<TcpSock>>>,
    /// Established children waiting for an accept call
    accept_queue: Mutex<VecDeque<Arc<TcpSock>>>,
    wait_connect: Notify,
    wait_accept: Notify,
    wait_send: Notify,
    wait_recv: Notify,
}

impl TcpSock {
    pub(crate) fn from_tcb(tcb: Tcb) -> Arc<Self> {
        Arc::new(Self {
            tcb: RwLock::new(tcb),
            parent: RwLock::new(Weak::new()),
            listen_queue: Mutex::new(VecDeque::new()),
            accept_queue: Mutex::new(VecDeque::new()),
            wait_connect: Notify::new(),
            wait_accept: Notify::new(),
            wait_send: Notify::new(),
            wait_recv: Notify::new(),
        })
    }

    /// Builds the SYN_RECV child for a connection request and links it onto
    /// the listener's listen queue.
    pub(crate) fn spawn(listener: &Arc<TcpSock>, cb: &ControlBlock) -> Arc<TcpSock> {
        let child = Self::from_tcb(listener.tcb.read().unwrap().spawn_child(cb));
        *child.parent.write().unwrap() = Arc::downgrade(listener);
        listener
            .listen_queue
            .lock()
            .unwrap()
            .push_back(child.clone());
        child
    }

    /// Removes a child from this listener's queues (its handshake never
    /// completed, or its connection died).
    pub(crate) fn unlink_child(&self, child: &Arc<TcpSock>) {
        self.listen_queue
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, child));
        self.accept_queue
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, child));
    }

    /// Runs the state machine over one arriving segment, then performs the
    /// queue movement and signalling it requested.
    pub(crate) fn process(self: &Arc<Self>, cb: &ControlBlock) -> ProcessResult {
        let (result, wake) = {
            let mut tcb = self.tcb.write().unwrap();
            let result = tcb.process(cb);
            (result, tcb.take_wakeups())
        };
        match result {
            ProcessResult::ChildEstablished => self.move_to_accept_queue(),
            ProcessResult::Close => {
                if let Some(parent) = self.parent.read().unwrap().upgrade() {
                    parent.unlink_child(self);
                }
                self.wake_all();
            }
            ProcessResult::Ok => {}
        }
        self.apply_wakeups(wake);
        result
    }

    /// The handshake completed: relocate this child from the listener's
    /// listen queue to its accept queue.
    fn move_to_accept_queue(self: &Arc<Self>) {
        if let Some(parent) = self.parent.read().unwrap().upgrade() {
            parent
                .listen_queue
                .lock()
                .unwrap()
                .retain(|c| !Arc::ptr_eq(c, self));
            parent.accept_queue.lock().unwrap().push_back(self.clone());
        }
    }

    fn apply_wakeups(&self, wake: WakeSet) {
        if wake.connect {
            self.wait_connect.notify_waiters();
        }
        if wake.accept {
            if let Some(parent) = self.parent.read().unwrap().upgrade() {
                parent.wait_accept.notify_waiters();
            }
        }
        if wake.send {
            self.wait_send.notify_waiters();
        }
        if wake.recv {
            self.wait_recv.notify_waiters();
        }
    }

    /// Releases every waiter; they observe the connection state and return.
    pub(crate) fn wake_all(&self) {
        self.wait_connect.notify_waiters();
        self.wait_accept.notify_waiters();
        self.wait_send.notify_waiters();
        self.wait_recv.notify_waiters();
    }

    pub(crate) fn advance_time(&self, delta: Duration) -> AdvanceTimeResult {
        let result = self.tcb.write().unwrap().advance_time(delta);
        if result == AdvanceTimeResult::CloseConnection {
            self.wake_all();
        }
        result
    }

    pub(crate) fn segments(&self) -> Vec<Segment> {
        self.tcb.write().unwrap().segments()
    }

    pub fn id(&self) -> ConnectionId {
        self.tcb.read().unwrap().id()
    }

    pub fn state(&self) -> State {
        self.tcb.read().unwrap().state()
    }

    /// Waits until the handshake started by a connect call completes.
    pub async fn established(&self) -> Result<(), SockError> {
        loop {
            let notified = self.wait_connect.notified();
            tokio::pin!(notified);
            // Register before checking so a wake between the check and the
            // await is not lost.
            notified.as_mut().enable();
            match self.state() {
                State::Established => return Ok(()),
                State::Closed => return Err(SockError::Refused),
                _ => {}
            }
            notified.await;
        }
    }

    /// Takes the next established connection off the accept queue, waiting
    /// for one to arrive when none is pending.
    pub async fn accept(&self) -> Result<Arc<TcpSock>, SockError> {
        loop {
            let notified = self.wait_accept.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(child) = self.accept_queue.lock().unwrap().pop_front() {
                return Ok(child);
            }
            if self.state() == State::Closed {
                return Err(SockError::Closed);
            }
            notified.await;
        }
    }

    /// Reads received bytes, waiting when none are buffered. Returns 0 once
    /// the peer has closed its side and the buffer is drained.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, SockError> {
        loop {
            let notified = self.wait_recv.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut tcb = self.tcb.write().unwrap();
                let n = tcb.read(buf);
                if n > 0 {
                    return Ok(n);
                }
                match tcb.state() {
                    // The peer's FIN was processed and nothing is buffered.
                    State::CloseWait | State::LastAck | State::TimeWait | State::Closed => {
                        return Ok(0)
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Queues bytes for transmission, waiting while the peer's advertised
    /// window admits nothing new.
    pub async fn send(&self, bytes: &[u8]) -> Result<usize, SockError> {
        loop {
            let notified = self.wait_send.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut tcb = self.tcb.write().unwrap();
                match tcb.state() {
                    State::SynSent
                    | State::SynReceived
                    | State::Established
                    | State::CloseWait => {
                        if tcb.send_window_available() > 0 {
                            tcb.send(bytes);
                            return Ok(bytes.len());
                        }
                    }
                    _ => return Err(SockError::Closed),
                }
            }
            notified.await;
        }
    }

    /// Begins a local close: queues the FIN and moves the state machine
    /// along the active or passive close path.
    pub fn close(&self) -> CloseResult {
        let result = self.tcb.write().unwrap().close();
        // Blocked operations must observe the closing state.
        self.wake_all();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::Tcp;
    use crate::wire::ControlBlock;
    use std::net::{Ipv4Addr, SocketAddrV4};

    const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const CLIENT: SocketAddrV4 = SocketAddrV4::new(CLIENT_IP, 4000);
    const SERVER: SocketAddrV4 = SocketAddrV4::new(SERVER_IP, 80);

    /// Crosses queued segments between the two stacks until both go quiet.
    fn pump(client: &Tcp, server: &Tcp) {
        let mut to_server = client.poll_segments();
        let mut to_client = server.poll_segments();
        while !to_server.is_empty() || !to_client.is_empty() {
            let mut next_to_client = Vec::new();
            for segment in to_server.drain(..) {
                let cb = ControlBlock::from_segment(CLIENT_IP, SERVER_IP, segment);
                next_to_client.extend(server.segment_arrives(cb));
            }
            for segment in to_client.drain(..) {
                let cb = ControlBlock::from_segment(SERVER_IP, CLIENT_IP, segment);
                to_server.extend(client.segment_arrives(cb));
            }
            to_client = next_to_client;
        }
    }

    fn stacks() -> (Tcp, Tcp) {
        (Tcp::new(1500), Tcp::new(1500))
    }

    #[tokio::test]
    async fn accept_wakes_on_handshake_completion() {
        let (client, server) = stacks();
        let listener = server.listen(SERVER).unwrap();

        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        // Let the accept call park on the wait point before anything arrives.
        tokio::task::yield_now().await;

        let sock = client.connect(CLIENT, SERVER).unwrap();
        pump(&client, &server);

        let child = accepting.await.unwrap().unwrap();
        assert_eq!(child.state(), State::Established);
        assert_eq!(child.id(), ConnectionId::new(SERVER, CLIENT));
        assert_eq!(child.id(), sock.id().reverse());
        sock.established().await.unwrap();
        assert_eq!(sock.state(), State::Established);
    }

    #[tokio::test]
    async fn recv_wakes_on_data_and_sees_eof_after_fin() {
        let (client, server) = stacks();
        let listener = server.listen(SERVER).unwrap();
        let sock = client.connect(CLIENT, SERVER).unwrap();
        pump(&client, &server);
        let child = listener.accept().await.unwrap();

        let receiving = {
            let child = child.clone();
            tokio::spawn(async move {
                let mut buf = [0; 64];
                let n = child.recv(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        tokio::task::yield_now().await;

        sock.send(b"hello").await.unwrap();
        pump(&client, &server);
        assert_eq!(receiving.await.unwrap(), b"hello");

        // Active close from the client: the server side sees EOF.
        assert_eq!(sock.close(), CloseResult::Ok);
        pump(&client, &server);
        assert_eq!(child.state(), State::CloseWait);
        let mut buf = [0; 8];
        assert_eq!(child.recv(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_close_sequence_reaches_closed() {
        let (client, server) = stacks();
        let listener = server.listen(SERVER).unwrap();
        let sock = client.connect(CLIENT, SERVER).unwrap();
        pump(&client, &server);
        let child = listener.accept().await.unwrap();

        assert_eq!(sock.close(), CloseResult::Ok);
        pump(&client, &server);
        assert_eq!(sock.state(), State::FinWait2);
        assert_eq!(child.state(), State::CloseWait);

        assert_eq!(child.close(), CloseResult::Ok);
        pump(&client, &server);
        // The passive closer got its final ACK and is gone; the active
        // closer lingers in TIME_WAIT until its timer fires.
        assert_eq!(child.state(), State::Closed);
        assert!(server.connection(&child.id()).is_none());
        assert_eq!(sock.state(), State::TimeWait);

        client.advance_time(crate::tcb::MSL * 2 + Duration::from_millis(1));
        assert_eq!(sock.state(), State::Closed);
        assert!(client.connection(&sock.id()).is_none());
    }

    #[tokio::test]
    async fn connect_to_unbound_port_is_reset() {
        let (client, server) = stacks();
        let sock = client.connect(CLIENT, SERVER).unwrap();
        pump(&client, &server);
        assert_eq!(sock.established().await, Err(SockError::Refused));
        assert!(client.connection(&sock.id()).is_none());
    }
}
