/// The state of a TCP connection endpoint. The machine is driven by
/// [`Tcb::process`](super::Tcb::process) for arriving segments, by the user
/// calls [`Tcb::open`](super::Tcb::open) and [`Tcb::close`](super::Tcb::close),
/// and by timer expiry. Simultaneous open and close are not supported, so
/// there is no CLOSING state and the graph is:
///
/// ```text
/// CLOSED  --active open-->  SYN_SENT  --SYN|ACK rx-->  ESTABLISHED
/// CLOSED  --passive open--> LISTEN    --SYN rx-->      spawns SYN_RECV child
/// SYN_RECV  --ACK rx-->     ESTABLISHED
/// ESTABLISHED  --FIN rx-->  CLOSE_WAIT --app close-->  LAST_ACK --ACK rx--> CLOSED
/// ESTABLISHED  --app close--> FIN_WAIT_1 --ACK rx--> FIN_WAIT_2 --FIN rx--> TIME_WAIT --timer--> CLOSED
/// any          --RST rx-->  CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection. Terminal; a closed endpoint drops whatever reaches it.
    Closed,
    /// Waiting for connection requests. A listening endpoint never carries
    /// data itself; matching SYNs spawn children in [`State::SynReceived`].
    Listen,
    /// Waiting for a matching connection request after having sent one.
    SynSent,
    /// Waiting for the acknowledgement that completes the handshake after
    /// having both received and answered a connection request.
    SynReceived,
    /// An open connection; the normal state for the data transfer phase.
    Established,
    /// Closed locally; waiting for the peer to acknowledge our FIN.
    FinWait1,
    /// Our FIN is acknowledged; waiting for the peer's FIN.
    FinWait2,
    /// The peer closed; waiting for the local user to close as well.
    CloseWait,
    /// Waiting for the acknowledgement of our FIN after a passive close.
    LastAck,
    /// Waiting out two maximum segment lifetimes so that late segments from
    /// the closed connection drain from the network.
    TimeWait,
}
