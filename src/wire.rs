//! TCP header parsing and construction.
//!
//! Inbound bytes become a [`TcpHeader`] plus payload, which the router folds
//! into a [`ControlBlock`] for the state machine. Outbound headers are built
//! with [`TcpHeaderBuilder`] and paired with their payload as a [`Segment`].
//! Options are not supported; a header is always exactly 20 octets.

use std::net::Ipv4Addr;

/// The length of a TCP header without options, in octets.
pub const HEADER_OCTETS: usize = 20;

/// The control bits of a TCP header, stored in wire layout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    /// No more data from sender
    pub fn fin(self) -> bool {
        self.0 & 0b1 == 1
    }

    /// Synchronize sequence numbers
    pub fn syn(self) -> bool {
        (self.0 >> 1) & 0b1 == 1
    }

    /// Reset the connection
    pub fn rst(self) -> bool {
        (self.0 >> 2) & 0b1 == 1
    }

    /// Push function
    pub fn psh(self) -> bool {
        (self.0 >> 3) & 0b1 == 1
    }

    /// Acknowledgment field significant
    pub fn ack(self) -> bool {
        (self.0 >> 4) & 0b1 == 1
    }

    /// Urgent pointer field significant
    pub fn urg(self) -> bool {
        (self.0 >> 5) & 0b1 == 1
    }

    pub fn set_fin(&mut self, fin: bool) {
        self.0 = self.0 & !0b1 | fin as u8;
    }

    pub fn set_syn(&mut self, syn: bool) {
        self.0 = self.0 & !0b10 | (syn as u8) << 1;
    }

    pub fn set_rst(&mut self, rst: bool) {
        self.0 = self.0 & !0b100 | (rst as u8) << 2;
    }

    pub fn set_ack(&mut self, ack: bool) {
        self.0 = self.0 & !0b1_0000 | (ack as u8) << 4;
    }
}

impl From<u8> for Flags {
    fn from(n: u8) -> Self {
        Self(n)
    }
}

impl From<Flags> for u8 {
    fn from(flags: Flags) -> Self {
        flags.0
    }
}

/// Things that can go wrong when parsing a TCP header.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("the TCP header ended unexpectedly")]
    HeaderTooShort,
    #[error("TCP options are not supported")]
    UnexpectedOptions,
    #[error("invalid checksum (expected {expected:#06x}, computed {computed:#06x})")]
    InvalidChecksum { expected: u16, computed: u16 },
}

/// A parsed TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub ctl: Flags,
    pub wnd: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    /// Parses the fixed 20-octet header at the front of `segment`, verifying
    /// the checksum over the whole segment and the IPv4 pseudo-header. The
    /// field layout is the exact mirror of [`serialize`](Self::serialize).
    pub fn from_bytes(
        segment: &[u8],
        src_address: Ipv4Addr,
        dst_address: Ipv4Addr,
    ) -> Result<Self, ParseError> {
        if segment.len() < HEADER_OCTETS {
            return Err(ParseError::HeaderTooShort);
        }
        let (head, text) = segment.split_at(HEADER_OCTETS);

        if (head[12] >> 4) as usize * 4 != HEADER_OCTETS {
            return Err(ParseError::UnexpectedOptions);
        }

        let expected = u16::from_be_bytes([head[16], head[17]]);
        let computed = segment_checksum(src_address, dst_address, head, text);
        if expected != computed {
            return Err(ParseError::InvalidChecksum { expected, computed });
        }

        Ok(TcpHeader {
            src_port: u16::from_be_bytes([head[0], head[1]]),
            dst_port: u16::from_be_bytes([head[2], head[3]]),
            seq: u32::from_be_bytes([head[4], head[5], head[6], head[7]]),
            ack: u32::from_be_bytes([head[8], head[9], head[10], head[11]]),
            ctl: Flags::from(head[13] & 0b11_1111),
            wnd: u16::from_be_bytes([head[14], head[15]]),
            checksum: expected,
            urgent: u16::from_be_bytes([head[18], head[19]]),
        })
    }

    /// Writes the header back into wire format.
    pub fn serialize(&self) -> [u8; HEADER_OCTETS] {
        let mut out = [0; HEADER_OCTETS];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = ((HEADER_OCTETS / 4) as u8) << 4;
        out[13] = self.ctl.into();
        out[14..16].copy_from_slice(&self.wnd.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        out
    }
}

/// Builds outbound TCP headers.
///
/// A builder starts as a bare segment carrying only ports and a sequence
/// number; control bits, the acknowledgement, and the advertised window are
/// layered on before [`build`](Self::build) computes the checksum.
#[derive(Debug, Clone, Copy)]
pub struct TcpHeaderBuilder {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    ctl: Flags,
    wnd: u16,
}

impl TcpHeaderBuilder {
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack: 0,
            ctl: Flags::default(),
            wnd: 0,
        }
    }

    pub fn syn(mut self) -> Self {
        self.ctl.set_syn(true);
        self
    }

    pub fn fin(mut self) -> Self {
        self.ctl.set_fin(true);
        self
    }

    pub fn rst(mut self) -> Self {
        self.ctl.set_rst(true);
        self
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.ctl.set_ack(true);
        self.ack = ack;
        self
    }

    pub fn wnd(mut self, wnd: u16) -> Self {
        self.wnd = wnd;
        self
    }

    /// Finishes the header, computing the checksum over the given payload
    /// and the IPv4 pseudo-header.
    pub fn build(self, src_address: Ipv4Addr, dst_address: Ipv4Addr, payload: &[u8]) -> TcpHeader {
        let mut header = TcpHeader {
            src_port: self.src_port,
            dst_port: self.dst_port,
            seq: self.seq,
            ack: self.ack,
            ctl: self.ctl,
            wnd: self.wnd,
            checksum: 0,
            urgent: 0,
        };
        header.checksum =
            segment_checksum(src_address, dst_address, &header.serialize(), payload);
        header
    }
}

/// An outbound segment: a finished header and the payload it carries.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(header: TcpHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// The length of the segment in sequence space, control bits included.
    pub fn seg_len(&self) -> usize {
        self.payload.len() + self.header.ctl.syn() as usize + self.header.ctl.fin() as usize
    }

    /// Wire representation: header followed by payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_OCTETS + self.payload.len());
        out.extend_from_slice(&self.header.serialize());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// The parsed metadata of one inbound segment, in the shape the state
/// machine consumes. `seq_end` is precomputed as `seq` plus the payload
/// length plus one for each of SYN and FIN.
#[derive(Debug, Clone)]
pub struct ControlBlock {
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub flags: Flags,
    pub seq: u32,
    pub seq_end: u32,
    pub ack: u32,
    pub rwnd: u16,
    pub payload: Vec<u8>,
}

impl ControlBlock {
    pub fn new(saddr: Ipv4Addr, daddr: Ipv4Addr, header: TcpHeader, payload: Vec<u8>) -> Self {
        let seg_len = payload.len() as u32 + header.ctl.syn() as u32 + header.ctl.fin() as u32;
        Self {
            saddr,
            daddr,
            sport: header.src_port,
            dport: header.dst_port,
            flags: header.ctl,
            seq: header.seq,
            seq_end: header.seq.wrapping_add(seg_len),
            ack: header.ack,
            rwnd: header.wnd,
            payload,
        }
    }

    /// Parses a whole segment (header and payload) into a control block.
    pub fn parse(saddr: Ipv4Addr, daddr: Ipv4Addr, bytes: &[u8]) -> Result<Self, ParseError> {
        let header = TcpHeader::from_bytes(bytes, saddr, daddr)?;
        Ok(Self::new(saddr, daddr, header, bytes[HEADER_OCTETS..].to_vec()))
    }

    /// Folds an already-built segment into a control block, as a loopback
    /// driver or a test harness does when crossing two endpoints directly.
    pub fn from_segment(saddr: Ipv4Addr, daddr: Ipv4Addr, segment: Segment) -> Self {
        Self::new(saddr, daddr, segment.header, segment.payload)
    }

    pub fn pl_len(&self) -> usize {
        self.payload.len()
    }
}

/// The TCP checksum over the IPv4 pseudo-header, the header bytes in `head`
/// (whose checksum field counts as zero), and the payload in `text`.
///
/// Big-endian 16-bit words are summed into 32 bits, so carries pile up in
/// the high half and are folded back only at the end; an odd trailing
/// payload byte is padded with zero.
fn segment_checksum(src: Ipv4Addr, dst: Ipv4Addr, head: &[u8], text: &[u8]) -> u16 {
    let src = src.octets();
    let dst = dst.octets();
    let mut sum: u32 = 0;

    // Pseudo-header: both addresses, the TCP protocol number, and the
    // length of the segment
    sum += u32::from(u16::from_be_bytes([src[0], src[1]]));
    sum += u32::from(u16::from_be_bytes([src[2], src[3]]));
    sum += u32::from(u16::from_be_bytes([dst[0], dst[1]]));
    sum += u32::from(u16::from_be_bytes([dst[2], dst[3]]));
    sum += 6;
    sum += (head.len() + text.len()) as u32;

    for i in (0..head.len()).step_by(2) {
        if i != 16 {
            sum += u32::from(u16::from_be_bytes([head[i], head[i + 1]]));
        }
    }

    let mut words = text.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let &[last] = words.remainder() {
        sum += u32::from(u16::from_be_bytes([last, 0]));
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn parses_packet() -> anyhow::Result<()> {
        let payload = b"Hello, world!";
        let mut expected = etherparse::TcpHeader::new(0xcafe, 0xbabe, 123456789, 1024);
        expected.acknowledgment_number = 10;
        expected.ack = true;
        expected.psh = true;
        expected.checksum = expected.calc_checksum_ipv4_raw(SRC.octets(), DST.octets(), payload)?;
        let mut serial = vec![];
        expected.write(&mut serial)?;
        serial.extend_from_slice(payload);

        let actual = TcpHeader::from_bytes(&serial, SRC, DST)?;
        assert_eq!(actual.src_port, 0xcafe);
        assert_eq!(actual.dst_port, 0xbabe);
        assert_eq!(actual.seq, 123456789);
        assert_eq!(actual.ack, 10);
        assert!(actual.ctl.ack());
        assert!(actual.ctl.psh());
        assert!(!actual.ctl.syn());
        assert_eq!(actual.wnd, 1024);
        assert_eq!(actual.checksum, expected.checksum);
        assert_eq!(actual.urgent, 0);
        Ok(())
    }

    #[test]
    fn builder_checksum_matches_etherparse() -> anyhow::Result<()> {
        let payload = b"lorem ipsum dolor";
        let built = TcpHeaderBuilder::new(4000, 5000, 42)
            .ack(999)
            .wnd(2048)
            .build(SRC, DST, payload);

        let mut reference = etherparse::TcpHeader::new(4000, 5000, 42, 2048);
        reference.acknowledgment_number = 999;
        reference.ack = true;
        let expected = reference.calc_checksum_ipv4_raw(SRC.octets(), DST.octets(), payload)?;
        assert_eq!(built.checksum, expected);
        Ok(())
    }

    #[test]
    fn round_trips_through_serialization() -> anyhow::Result<()> {
        let payload = b"abc";
        let header = TcpHeaderBuilder::new(1, 2, 100)
            .syn()
            .ack(200)
            .wnd(4000)
            .build(SRC, DST, payload);
        let mut bytes = header.serialize().to_vec();
        bytes.extend_from_slice(payload);
        let cb = ControlBlock::parse(SRC, DST, &bytes)?;
        assert_eq!(cb.seq, 100);
        // SYN occupies one sequence number on top of the payload
        assert_eq!(cb.seq_end, 104);
        assert_eq!(cb.ack, 200);
        assert_eq!(cb.rwnd, 4000);
        assert_eq!(cb.payload, payload);
        Ok(())
    }

    #[test]
    fn rejects_corrupted_segment() {
        let header = TcpHeaderBuilder::new(1, 2, 100).ack(200).build(SRC, DST, &[]);
        let mut bytes = header.serialize().to_vec();
        bytes[4] ^= 0xff;
        assert!(matches!(
            TcpHeader::from_bytes(&bytes, SRC, DST),
            Err(ParseError::InvalidChecksum { .. })
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(
            TcpHeader::from_bytes(&[0u8; 8], SRC, DST),
            Err(ParseError::HeaderTooShort)
        );
    }
}
