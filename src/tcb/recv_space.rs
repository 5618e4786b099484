use super::RECV_BUFFER_CAPACITY;

/// The receive side of the sequence space.
///
/// Everything before `nxt` has been taken in order and acknowledged; the
/// peer is invited to send the `wnd` sequence numbers starting at `nxt`,
/// which is exactly the free capacity of the receive ring.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ReceiveSequenceSpace {
    /// Next sequence number expected on an incoming segment; the lower edge
    /// of the receive window
    pub nxt: u32,
    /// Free capacity of the receive buffer, advertised to the peer
    pub wnd: u16,
}

impl Default for ReceiveSequenceSpace {
    fn default() -> Self {
        Self {
            nxt: 0,
            wnd: RECV_BUFFER_CAPACITY as u16,
        }
    }
}
