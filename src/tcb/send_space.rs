/// The send side of the sequence space.
///
/// `una..nxt` is the in-flight range: transmitted, still waiting for the
/// peer's cumulative acknowledgement to cover it. New data may claim
/// sequence numbers up to `una + wnd`; everything past that waits for the
/// window to move.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct SendSequenceSpace {
    /// Initial send sequence number
    pub iss: u32,
    /// Oldest unacknowledged sequence number
    pub una: u32,
    /// Next sequence number to be sent
    pub nxt: u32,
    /// The peer's advertised receive window, capped at
    /// [`MAX_SND_WND`](super::MAX_SND_WND)
    pub wnd: u16,
}
