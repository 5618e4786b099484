//! A user-space TCP connection engine.
//!
//! The heart of the crate is [`Tcb`], the per-connection state machine. It
//! consumes parsed inbound segments ([`ControlBlock`]s) and drives the
//! connection through the TCP state graph: handshake, data exchange,
//! out-of-order reassembly, cumulative acknowledgement processing,
//! retransmission-queue pruning, and both active and passive close. The TCB
//! is sans-IO: it never touches the network itself, it only queues segments
//! that the embedding drains and puts on the wire.
//!
//! # Organization
//!
//! - [`wire`] parses and builds TCP headers and assembles the per-segment
//!   [`ControlBlock`].
//! - [`tcb`] holds the state machine and its buffers.
//! - [`tcp`] routes arriving segments to connections, owns the established
//!   table and the listen bindings, and drives timers.
//! - [`sock`] is the blocking user surface: connect, accept, send, recv, and
//!   close, suspending on per-connection wait points.

pub mod seq;
pub mod sock;
pub mod tcb;
pub mod tcp;
pub mod wire;

pub use sock::TcpSock;
pub use tcb::{State, Tcb};
pub use tcp::{ConnectionId, Tcp};
pub use wire::{ControlBlock, Segment, TcpHeader};
