//! The per-connection TCP state machine.
//!
//! A [`Tcb`] owns everything one connection needs: the sequence spaces, the
//! retransmission queue, the out-of-order reassembly buffer, the in-order
//! receive ring, and the timers. It is sans-IO and never blocks: arriving
//! segments are fed in as [`ControlBlock`]s through [`Tcb::process`], and
//! everything the connection wants to say goes into internal queues that the
//! embedding drains with [`Tcb::segments`]. Wait points released during
//! processing are reported through [`Tcb::take_wakeups`] so the sock layer
//! can unblock the user operations sleeping on them.

use crate::seq::{seq_geq, seq_gt, seq_leq, seq_lt};
use crate::tcp::ConnectionId;
use crate::wire::{ControlBlock, Segment, TcpHeader, TcpHeaderBuilder};
use std::collections::VecDeque;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;


mod reassembly;
use reassembly::{Fragment, ReassemblyBuffer};

mod retransmit;
use retransmit::{CachedSegment, RetransmitQueue};

mod ring;
pub use ring::RecvRing;

mod recv_space;
use recv_space::ReceiveSequenceSpace;

mod send_space;
use send_space::SendSequenceSpace;

mod state;
pub use state::State;

/// The maximum segment lifetime; TIME_WAIT holds a dying connection for
/// twice this before the endpoint is destroyed.
pub const MSL: Duration = Duration::from_secs(1);

/// Retransmission timeout for fresh connections.
pub const DEFAULT_RTO: Duration = Duration::from_millis(100);

/// The peer's advertised window is never trusted beyond this many octets.
pub const MAX_SND_WND: u16 = 4000;

/// Capacity of the in-order receive ring; also the largest window this
/// endpoint ever advertises.
pub const RECV_BUFFER_CAPACITY: usize = 4000;

/// Room left for lower-layer headers when segmentizing.
const SPACE_FOR_HEADERS: u16 = 50;

/// Wait points released while the state machine ran. The sock layer drains
/// this after every call that can signal waiters and maps each flag onto the
/// matching notification (`accept` targets the listener that spawned the
/// connection).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WakeSet {
    pub connect: bool,
    pub accept: bool,
    pub send: bool,
    pub recv: bool,
}

impl WakeSet {
    pub fn is_empty(self) -> bool {
        !(self.connect || self.accept || self.send || self.recv)
    }
}

/// What the embedding must do after a segment was processed.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Nothing beyond draining segments and wake-ups.
    Ok,
    /// A SYN_RECV child completed the handshake: move it from its listener's
    /// listen queue to the accept queue.
    ChildEstablished,
    /// The connection reached CLOSED: remove it from the established table
    /// and release every waiter.
    Close,
}

/// The result of advancing a connection's virtual clock.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceTimeResult {
    /// Nothing happened that the caller needs to act on.
    Ignore,
    /// The TIME_WAIT timer expired: remove the connection from the
    /// established table and destroy it.
    CloseConnection,
}

/// The result of a local close call.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseResult {
    Ok,
    /// The connection is already closing.
    ConnectionClosing,
}

/// The transmission control block: all state for one TCP connection.
#[derive(Debug)]
pub struct Tcb {
    /// The 4-tuple identifying this connection
    id: ConnectionId,
    /// Maximum transmission unit of the underlying network
    mtu: u16,
    state: State,
    /// The send sequence space
    snd: SendSequenceSpace,
    /// The receive sequence space
    rcv: ReceiveSequenceSpace,
    /// Outbound segments cached until the peer acknowledges them
    send_buf: RetransmitQueue,
    /// User bytes queued for segmentization
    tx_text: VecDeque<u8>,
    /// Header-only segments to emit exactly once
    oneshot: Vec<TcpHeader>,
    /// In-order received bytes, consumed by the user read path
    rcv_buf: RecvRing,
    /// Out-of-order payload fragments awaiting their in-order prefix
    rcv_ofo_buf: ReassemblyBuffer,
    rto: Duration,
    /// Armed exactly while `send_buf` is non-empty
    retrans_timer: Option<Duration>,
    time_wait_timer: Option<Duration>,
    /// Virtual clock, advanced by `advance_time`
    now: Duration,
    wake: WakeSet,
}

impl Tcb {
    fn new(
        id: ConnectionId,
        mtu: u16,
        state: State,
        snd: SendSequenceSpace,
        rcv: ReceiveSequenceSpace,
    ) -> Self {
        Self {
            id,
            mtu,
            state,
            snd,
            rcv,
            send_buf: RetransmitQueue::default(),
            tx_text: VecDeque::new(),
            oneshot: Vec::new(),
            rcv_buf: RecvRing::new(RECV_BUFFER_CAPACITY),
            rcv_ofo_buf: ReassemblyBuffer::default(),
            rto: DEFAULT_RTO,
            retrans_timer: None,
            time_wait_timer: None,
            now: Duration::ZERO,
            wake: WakeSet::default(),
        }
    }

    /// Active open: a fresh connection in SYN_SENT with its SYN queued.
    pub fn open(id: ConnectionId, iss: u32, mtu: u16) -> Self {
        let mut tcb = Self::new(
            id,
            mtu,
            State::SynSent,
            SendSequenceSpace {
                iss,
                una: iss,
                nxt: iss.wrapping_add(1),
                wnd: 0,
            },
            ReceiveSequenceSpace::default(),
        );
        let syn = tcb.header_builder(iss).syn().wnd(tcb.rcv.wnd);
        tcb.enqueue(syn);
        tcb
    }

    /// Passive open: a listening endpoint. It never carries data; matching
    /// connection requests spawn children via [`Tcb::spawn_child`].
    pub fn listen(local: SocketAddrV4, iss: u32, mtu: u16) -> Self {
        let id = ConnectionId {
            local,
            remote: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };
        Self::new(
            id,
            mtu,
            State::Listen,
            SendSequenceSpace {
                iss,
                una: iss,
                nxt: iss,
                wnd: 0,
            },
            ReceiveSequenceSpace::default(),
        )
    }

    /// Allocates the SYN_RECV child answering a connection request that
    /// arrived on this listening endpoint. The child takes the swapped
    /// 4-tuple, synchronizes its receive space from the request, and queues
    /// its SYN|ACK. The caller links the child to the listener and inserts
    /// it into the established table.
    pub fn spawn_child(&self, cb: &ControlBlock) -> Tcb {
        debug_assert_eq!(self.state, State::Listen);
        let id = ConnectionId {
            local: SocketAddrV4::new(cb.daddr, cb.dport),
            remote: SocketAddrV4::new(cb.saddr, cb.sport),
        };
        let iss = self.snd.nxt;
        let mut child = Tcb::new(
            id,
            self.mtu,
            State::SynReceived,
            SendSequenceSpace {
                iss,
                una: iss,
                nxt: iss.wrapping_add(1),
                wnd: cb.rwnd.min(MAX_SND_WND),
            },
            ReceiveSequenceSpace {
                nxt: cb.seq_end,
                ..Default::default()
            },
        );
        let syn_ack = child
            .header_builder(iss)
            .syn()
            .ack(child.rcv.nxt)
            .wnd(child.rcv.wnd);
        child.enqueue(syn_ack);
        child
    }

    /// Local close. No new data can be sent afterwards; the FIN is queued
    /// and retransmitted until acknowledged.
    pub fn close(&mut self) -> CloseResult {
        match self.state {
            State::Established => {
                self.enqueue_fin();
                self.state = State::FinWait1;
                CloseResult::Ok
            }
            State::CloseWait => {
                self.enqueue_fin();
                self.state = State::LastAck;
                CloseResult::Ok
            }
            _ => CloseResult::ConnectionClosing,
        }
    }

    /// Processes one arriving segment. The handlers run in a fixed order:
    /// the handshake states first, then reset and stray-SYN handling, then
    /// the close-sequence states, and finally the generic data/ACK path.
    pub fn process(&mut self, cb: &ControlBlock) -> ProcessResult {
        match self.state {
            // A reset for whatever reaches a closed endpoint was already
            // emitted by the router; nothing to do here.
            State::Closed => return ProcessResult::Ok,
            // Connection requests are turned into children by the router;
            // any other segment addressed to a listener is dropped.
            State::Listen => return ProcessResult::Ok,
            State::SynSent if !cb.flags.rst() && (cb.flags.syn() || cb.flags.ack()) => {
                return self.process_syn_sent(cb);
            }
            State::SynReceived if !cb.flags.rst() && cb.flags.ack() => {
                return self.process_syn_received(cb);
            }
            _ => {}
        }

        if cb.flags.rst() {
            // Peer reset: the connection dies on the spot and every waiter
            // observes the closure.
            tracing::debug!(id = ?self.id, "connection reset by peer");
            self.enter_closed();
            return ProcessResult::Close;
        }

        if cb.flags.syn() {
            // Valid SYNs were consumed by the LISTEN and SYN_SENT paths; one
            // on a synchronized connection is a protocol violation.
            tracing::error!(id = ?self.id, "unexpected SYN on synchronized connection");
            self.oneshot.push(reset_for(cb));
            self.enter_closed();
            return ProcessResult::Close;
        }

        if !cb.flags.ack() {
            tracing::error!(id = ?self.id, "received segment without ACK, dropping");
            return ProcessResult::Ok;
        }

        if self.state == State::Established && cb.flags.fin() && cb.seq == self.rcv.nxt {
            // Passive close
            self.ack_data(cb);
            self.rcv.nxt = cb.seq_end;
            self.send_ack();
            self.state = State::CloseWait;
            // The user read path sees EOF and can initiate its own close.
            self.wake.recv = true;
            return ProcessResult::Ok;
        }

        if self.state == State::FinWait1 && cb.ack == self.snd.nxt {
            self.ack_data(cb);
            self.state = State::FinWait2;
            return ProcessResult::Ok;
        }

        if self.state == State::FinWait2 && cb.flags.fin() && cb.seq == self.rcv.nxt {
            self.ack_data(cb);
            self.rcv.nxt = cb.seq_end;
            self.send_ack();
            self.time_wait_timer = Some(2 * MSL);
            self.state = State::TimeWait;
            return ProcessResult::Ok;
        }

        if self.state == State::LastAck && cb.ack == self.snd.nxt {
            self.ack_data(cb);
            self.enter_closed();
            return ProcessResult::Close;
        }

        // Generic data/ACK path
        if !self.is_seq_valid(cb) {
            tracing::error!(id = ?self.id, seq = cb.seq, "segment outside receive window, dropping");
            // A bare ACK resynchronizes the peer.
            self.send_ack();
            return ProcessResult::Ok;
        }
        self.ack_data(cb);
        if seq_lt(cb.ack, self.snd.una) {
            // The peer is behind; remind it where we are.
            self.send_ack();
        }
        if seq_gt(cb.ack, self.snd.nxt) {
            tracing::error!(id = ?self.id, ack = cb.ack, "ACK beyond SND.NXT, dropping");
            return ProcessResult::Ok;
        }
        if cb.pl_len() > 0 {
            self.recv_data(cb);
            self.update_window_safe(cb);
            self.send_ack();
        }
        ProcessResult::Ok
    }

    fn process_syn_sent(&mut self, cb: &ControlBlock) -> ProcessResult {
        if !(cb.flags.syn() && cb.flags.ack()) || cb.ack != self.snd.nxt {
            // Not the SYN|ACK this endpoint is waiting for.
            self.oneshot.push(reset_for(cb));
            return ProcessResult::Ok;
        }
        self.rcv.nxt = cb.seq_end;
        self.snd.wnd = cb.rwnd.min(MAX_SND_WND);
        self.snd.una = cb.ack;
        self.send_ack();
        self.state = State::Established;
        self.wake.connect = true;
        self.ack_data(cb);
        ProcessResult::Ok
    }

    fn process_syn_received(&mut self, cb: &ControlBlock) -> ProcessResult {
        self.rcv.nxt = cb.seq_end;
        self.snd.wnd = cb.rwnd.min(MAX_SND_WND);
        self.state = State::Established;
        // The listener can now hand this connection to an accept call.
        self.wake.accept = true;
        self.ack_data(cb);
        ProcessResult::ChildEstablished
    }

    /// Cumulative acknowledgement processing: prunes the retransmission
    /// queue, advances `snd_una`, and re-arms or cancels the retransmit
    /// timer. Acknowledgements outside `[snd_una, snd_nxt]` are ignored
    /// here; the callers decide whether they warrant a reply.
    fn ack_data(&mut self, cb: &ControlBlock) {
        if !(seq_leq(self.snd.una, cb.ack) && seq_leq(cb.ack, self.snd.nxt)) {
            return;
        }
        if let Some(end) = self.send_buf.prune(cb.ack) {
            if seq_gt(end, self.snd.una) {
                self.snd.una = end;
                self.wake.send = true;
            }
        }
        if self.send_buf.is_empty() {
            self.retrans_timer = None;
        } else {
            self.retrans_timer = Some(self.rto);
        }
    }

    /// Files the segment's payload into the reassembly buffer and promotes
    /// the contiguous prefix into the in-order ring.
    fn recv_data(&mut self, cb: &ControlBlock) {
        if seq_geq(cb.seq, self.rcv.nxt) {
            let fragment = Fragment::new(cb.seq, cb.payload.clone());
            if !self.rcv_ofo_buf.insert(fragment) {
                tracing::debug!(id = ?self.id, seq = cb.seq, "discarding duplicate or overlapping payload");
            }
        }
        let mut promoted = false;
        while let Some(head) = self.rcv_ofo_buf.head() {
            if head.seq != self.rcv.nxt || self.rcv_buf.free() < head.len() {
                break;
            }
            let fragment = self.rcv_ofo_buf.pop_head().unwrap();
            self.rcv_buf.write(&fragment.bytes);
            self.rcv.nxt = fragment.seq_end;
            promoted = true;
        }
        self.rcv.wnd = self.rcv_buf.free() as u16;
        if promoted {
            self.wake.recv = true;
        }
    }

    /// Receive-window membership: the segment must start before the right
    /// edge of the window and end at or after `rcv_nxt`. The `max(wnd, 1)`
    /// floor keeps pure ACKs acceptable while the window is closed.
    fn is_seq_valid(&self, cb: &ControlBlock) -> bool {
        let rcv_end = self.rcv.nxt.wrapping_add(self.rcv.wnd.max(1) as u32);
        seq_lt(cb.seq, rcv_end) && seq_leq(self.rcv.nxt, cb.seq_end)
    }

    fn update_window(&mut self, cb: &ControlBlock) {
        let old = self.snd.wnd;
        self.snd.wnd = cb.rwnd.min(MAX_SND_WND);
        if old == 0 && self.snd.wnd > 0 {
            self.wake.send = true;
        }
    }

    /// Applies a window update only when the acknowledgement sits inside the
    /// send space.
    fn update_window_safe(&mut self, cb: &ControlBlock) {
        if seq_leq(self.snd.una, cb.ack) && seq_leq(cb.ack, self.snd.nxt) {
            self.update_window(cb);
        }
    }

    /// Emits a header-only ACK carrying the current `snd_nxt`, `rcv_nxt`,
    /// and receive window.
    fn send_ack(&mut self) {
        let ack = self
            .header_builder(self.snd.nxt)
            .ack(self.rcv.nxt)
            .wnd(self.rcv.wnd);
        self.enqueue(ack);
    }

    fn enqueue_fin(&mut self) {
        let fin = self
            .header_builder(self.snd.nxt)
            .fin()
            .ack(self.rcv.nxt)
            .wnd(self.rcv.wnd);
        self.enqueue(fin);
        self.snd.nxt = self.snd.nxt.wrapping_add(1);
    }

    fn header_builder(&self, seq: u32) -> TcpHeaderBuilder {
        TcpHeaderBuilder::new(self.id.local.port(), self.id.remote.port(), seq)
    }

    /// Finishes a header-only segment and queues it: SYN and FIN segments
    /// occupy sequence space and go on the retransmission queue, everything
    /// else is sent exactly once.
    fn enqueue(&mut self, builder: TcpHeaderBuilder) {
        let header = builder.build(*self.id.local.ip(), *self.id.remote.ip(), &[]);
        if header.ctl.syn() || header.ctl.fin() {
            self.push_cached(header, Vec::new());
        } else {
            self.oneshot.push(header);
        }
    }

    fn push_cached(&mut self, header: TcpHeader, payload: Vec<u8>) {
        let was_empty = self.send_buf.is_empty();
        self.send_buf
            .push(CachedSegment::new(header, payload, self.now));
        if was_empty {
            self.retrans_timer = Some(self.rto);
        }
    }

    fn enter_closed(&mut self) {
        self.state = State::Closed;
        self.send_buf.clear();
        self.retrans_timer = None;
        self.time_wait_timer = None;
    }

    /// Queues user bytes for transmission. Data is segmentized lazily in
    /// [`Tcb::segments`] under the peer's window.
    pub fn send(&mut self, bytes: &[u8]) {
        self.tx_text.extend(bytes);
    }

    /// Bytes of new data the peer's window currently admits beyond what is
    /// already queued or in flight.
    pub fn send_window_available(&self) -> usize {
        let in_flight = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
        (self.snd.wnd as usize).saturating_sub(in_flight + self.tx_text.len())
    }

    /// Drains the segments that are ready for the wire: queued one-shot
    /// replies, newly segmentized data, and anything due for retransmission.
    pub fn segments(&mut self) -> Vec<Segment> {
        let mut out: Vec<Segment> = mem::take(&mut self.oneshot)
            .into_iter()
            .map(|header| Segment::new(header, Vec::new()))
            .collect();

        match self.state {
            State::SynSent | State::SynReceived | State::Established | State::CloseWait => {
                let max_segment_len = self.mtu.saturating_sub(SPACE_FOR_HEADERS) as usize;
                let mut queued = self.send_buf.queued_bytes();
                loop {
                    let window = (self.snd.wnd as usize).saturating_sub(queued);
                    let take = max_segment_len.min(window).min(self.tx_text.len());
                    if take == 0 {
                        break;
                    }
                    let payload: Vec<u8> = self.tx_text.drain(..take).collect();
                    let header = self
                        .header_builder(self.snd.nxt)
                        .ack(self.rcv.nxt)
                        .wnd(self.rcv.wnd)
                        .build(*self.id.local.ip(), *self.id.remote.ip(), &payload);
                    self.snd.nxt = self.snd.nxt.wrapping_add(take as u32);
                    queued += take;
                    self.push_cached(header, payload);
                }
            }
            _ => {}
        }

        out.extend(self.send_buf.take_ready(self.now));
        out
    }

    /// Advances the connection's virtual clock, firing the retransmit and
    /// TIME_WAIT timers as they expire.
    pub fn advance_time(&mut self, delta: Duration) -> AdvanceTimeResult {
        self.now += delta;
        if let Some(remaining) = self.retrans_timer {
            if delta >= remaining {
                // The oldest outstanding segment goes out again.
                self.send_buf.mark_head_for_retransmit();
                self.retrans_timer = Some(self.rto);
            } else {
                self.retrans_timer = Some(remaining - delta);
            }
        }
        if let Some(remaining) = self.time_wait_timer {
            if delta >= remaining {
                self.enter_closed();
                return AdvanceTimeResult::CloseConnection;
            }
            self.time_wait_timer = Some(remaining - delta);
        }
        AdvanceTimeResult::Ignore
    }

    /// Drains in-order received bytes into `out` and re-opens the advertised
    /// window accordingly. Non-blocking; the sock layer suspends on the recv
    /// wait point when nothing is buffered.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.rcv_buf.read(out);
        self.rcv.wnd = self.rcv_buf.free() as u16;
        n
    }

    /// Hands over the wait points released since the last call.
    pub fn take_wakeups(&mut self) -> WakeSet {
        mem::take(&mut self.wake)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Builds the RST segment answering an offending control block, derived from
/// the CB's own 4-tuple and sequence numbers.
pub fn reset_for(cb: &ControlBlock) -> TcpHeader {
    if cb.flags.ack() {
        TcpHeaderBuilder::new(cb.dport, cb.sport, cb.ack)
    } else {
        TcpHeaderBuilder::new(cb.dport, cb.sport, 0).ack(cb.seq_end)
    }
    .rst()
    .build(cb.daddr, cb.saddr, &[])
}
