use core::{fmt, ops};
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Checksum, Result};
use super::{checksum, IpProtocol, Ipv4Address};

/// The control flags of a TCP segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(pub u8);

impl Flags {
    /// No more data from sender.
    pub const FIN: Flags = Flags(0x01);
    /// Synchronize sequence numbers.
    pub const SYN: Flags = Flags(0x02);
    /// Reset the connection.
    pub const RST: Flags = Flags(0x04);
    /// Push function.
    pub const PSH: Flags = Flags(0x08);
    /// Acknowledgment field significant.
    pub const ACK: Flags = Flags(0x10);
    /// Urgent pointer field significant.
    pub const URG: Flags = Flags(0x20);
    /// ECN-Echo.
    pub const ECE: Flags = Flags(0x40);
    /// Congestion window reduced.
    pub const CWR: Flags = Flags(0x80);

    /// The empty set of flags.
    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Check if all flags in `other` are set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if any flag in `other` is set.
    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(Flags, &str); 8] = [
            (Flags::FIN, "fin"), (Flags::SYN, "syn"), (Flags::RST, "rst"), (Flags::PSH, "psh"),
            (Flags::ACK, "ack"), (Flags::URG, "urg"), (Flags::ECE, "ece"), (Flags::CWR, "cwr"),
        ];
        let mut first = true;
        for &(flag, name) in NAMES.iter() {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

byte_wrapper! {
    /// A byte sequence representing a TCP segment.
    #[derive(Debug, PartialEq, Eq)]
    pub struct tcp([u8]);
}

mod field {
    use crate::wire::field::*;

    pub(crate) const SRC_PORT: Field = 0..2;
    pub(crate) const DST_PORT: Field = 2..4;
    pub(crate) const SEQ_NUM:  Field = 4..8;
    pub(crate) const ACK_NUM:  Field = 8..12;
    pub(crate) const DATA_OFF: usize = 12;
    pub(crate) const FLAGS:    usize = 13;
    pub(crate) const WIN_SIZE: Field = 14..16;
    pub(crate) const CHECKSUM: Field = 16..18;
    pub(crate) const URGENT:   Field = 18..20;

    pub(crate) const OPTIONS:  Rest  = 20..;

    pub(crate) const OPT_END: u8 = 0x00;
    pub(crate) const OPT_NOP: u8 = 0x01;
    pub(crate) const OPT_MSS: u8 = 0x02;
    pub(crate) const OPT_SACKPERM: u8 = 0x04;
}

/// The length of a TCP header without options.
pub const HEADER_LEN: usize = field::OPTIONS.start;

/// The length of the option block sent along a SYN.
///
/// It holds the maximum segment size, the SACK-permitted option and two octets of padding.
pub const SYN_OPTIONS_LEN: usize = 8;

impl tcp {
    /// Imbue a raw octet buffer with TCP packet structure.
    pub fn new_unchecked(buffer: &[u8]) -> &tcp {
        Self::__from_macro_new_unchecked(buffer)
    }

    /// Imbue a mutable octet buffer with TCP packet structure.
    pub fn new_unchecked_mut(buffer: &mut [u8]) -> &mut tcp {
        Self::__from_macro_new_unchecked_mut(buffer)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&tcp> {
        let packet = Self::new_unchecked(data);
        packet.check_len()?;
        Ok(packet)
    }

    /// Unwrap the packet as a raw byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error::Truncated)` if the buffer is too short.
    /// Returns `Err(Error::Malformed)` if the header length field has a value smaller
    /// than the minimal header length.
    ///
    /// The result of this check is invalidated by calling [set_header_len].
    ///
    /// [set_header_len]: #method.set_header_len
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < HEADER_LEN {
            Err(Error::Truncated)
        } else {
            let header_len = usize::from(self.header_len());
            if len < header_len {
                Err(Error::Truncated)
            } else if header_len < HEADER_LEN {
                Err(Error::Malformed)
            } else {
                Ok(())
            }
        }
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> u32 {
        NetworkEndian::read_u32(&self.0[field::SEQ_NUM])
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> u32 {
        NetworkEndian::read_u32(&self.0[field::ACK_NUM])
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        (self.0[field::DATA_OFF] >> 4) * 4
    }

    /// Return the control flags.
    #[inline]
    pub fn flags(&self) -> Flags {
        Flags(self.0[field::FLAGS])
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the options of the header.
    pub fn options(&self) -> &[u8] {
        let header_len = usize::from(self.header_len());
        &self.0[field::OPTIONS.start..header_len]
    }

    /// Find the maximum segment size announced in the options, if any.
    pub fn max_seg_size(&self) -> Option<u16> {
        let mut options = self.options();
        while let Some(&kind) = options.first() {
            match kind {
                field::OPT_END => return None,
                field::OPT_NOP => options = &options[1..],
                _ => {
                    let len = usize::from(*options.get(1)?);
                    if len < 2 || len > options.len() {
                        return None;
                    }
                    if kind == field::OPT_MSS && len == 4 {
                        return Some(NetworkEndian::read_u16(&options[2..4]));
                    }
                    options = &options[len..];
                },
            }
        }
        None
    }

    /// Validate the segment checksum.
    ///
    /// The buffer must contain exactly the segment.
    pub fn verify_checksum(&self, src_addr: Ipv4Address, dst_addr: Ipv4Address) -> bool {
        checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Tcp, self.0.len() as u16),
            checksum::data(&self.0)
        ]) == !0
    }

    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.0[field::SEQ_NUM], value)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.0[field::ACK_NUM], value)
    }

    /// Set the header length, in octets. The reserved bits are cleared.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        self.0[field::DATA_OFF] = (value / 4) << 4;
    }

    /// Set the control flags.
    #[inline]
    pub fn set_flags(&mut self, value: Flags) {
        self.0[field::FLAGS] = value.0
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::URGENT], value)
    }

    /// Write the option block of a SYN directly after the fixed header.
    ///
    /// Announces `mss` as maximum segment size and permits selective acknowledgments. Does not
    /// change the header length.
    pub fn set_syn_options(&mut self, mss: u16) {
        let options = &mut self.0[field::OPTIONS.start..field::OPTIONS.start + SYN_OPTIONS_LEN];
        options[0] = field::OPT_MSS;
        options[1] = 4;
        NetworkEndian::write_u16(&mut options[2..4], mss);
        options[4] = field::OPT_SACKPERM;
        options[5] = 2;
        options[6] = field::OPT_END;
        options[7] = field::OPT_END;
    }

    /// Compute and fill in the segment checksum.
    ///
    /// The buffer must contain exactly the segment.
    pub fn fill_checksum(&mut self, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        self.set_checksum(0);
        let checksum = !checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Tcp, self.0.len() as u16),
            checksum::data(&self.0)
        ]);
        self.set_checksum(checksum)
    }

    /// Return the part of the payload present in the buffer.
    pub fn payload_slice(&self) -> &[u8] {
        let header_len = usize::from(self.header_len());
        &self.0[header_len..]
    }

    /// Return the part of the payload present in the buffer, mutably.
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        let header_len = usize::from(self.header_len());
        &mut self.0[header_len..]
    }
}

impl AsRef<[u8]> for tcp {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A high-level representation of a Transmission Control Protocol segment header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    /// The sending port.
    pub src_port:     u16,
    /// The receiving port.
    pub dst_port:     u16,
    /// The sequence number of the first octet (or the SYN).
    pub seq_number:   u32,
    /// The next sequence number the sender expects, meaningful with `ACK` set.
    pub ack_number:   u32,
    /// The control flags.
    pub flags:        Flags,
    /// The receive window of the sender.
    pub window_len:   u16,
    /// The maximum segment size option, only emitted as part of the SYN option block.
    pub max_seg_size: Option<u16>,
    /// The number of payload octets.
    pub payload_len:  usize,
}

impl Repr {
    /// Parse a Transmission Control Protocol segment and return a high-level representation.
    ///
    /// With manual checksums the buffer must contain exactly the segment. Otherwise the buffer
    /// may end early and `segment_len` supplies the length of the complete segment, as taken
    /// from the IP header.
    pub fn parse(
        packet: &tcp,
        segment_len: usize,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        checksum: Checksum,
    ) -> Result<Repr> {
        packet.check_len()?;
        let header_len = usize::from(packet.header_len());
        if segment_len < header_len { return Err(Error::Malformed) }
        // Source and destination ports must be present.
        if packet.src_port() == 0 { return Err(Error::Malformed) }
        if packet.dst_port() == 0 { return Err(Error::Malformed) }
        // Valid checksum is expected.
        if checksum.manual() {
            if packet.as_bytes().len() != segment_len { return Err(Error::Truncated) }
            if !packet.verify_checksum(src_addr, dst_addr) { return Err(Error::WrongChecksum) }
        }

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            seq_number: packet.seq_number(),
            ack_number: packet.ack_number(),
            flags: packet.flags(),
            window_len: packet.window_len(),
            max_seg_size: packet.max_seg_size(),
            payload_len: segment_len - header_len,
        })
    }

    /// Return the length of the header that will be emitted from this high-level representation.
    pub fn header_len(&self) -> usize {
        match self.max_seg_size {
            Some(_) => HEADER_LEN + SYN_OPTIONS_LEN,
            None => HEADER_LEN,
        }
    }

    /// Return the length of a segment that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + self.payload_len
    }

    /// Emit a high-level representation into a Transmission Control Protocol segment.
    ///
    /// With manual checksums the payload must already be in place and the buffer must contain
    /// exactly the segment.
    pub fn emit(
        &self,
        packet: &mut tcp,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        checksum: Checksum,
    ) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number);
        packet.set_header_len(self.header_len() as u8);
        packet.set_flags(self.flags);
        packet.set_window_len(self.window_len);
        packet.set_urgent_at(0);
        if let Some(mss) = self.max_seg_size {
            packet.set_syn_options(mss);
        }

        if checksum.manual() {
            packet.fill_checksum(src_addr, dst_addr)
        } else {
            // make sure we get a consistently zeroed checksum,
            // since implementations might rely on it
            packet.set_checksum(0);
        }
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TCP src={} dst={} seq={} ack={} flags={} win={} len={}",
               self.src_port, self.dst_port, self.seq_number, self.ack_number,
               self.flags, self.window_len, self.payload_len)?;
        if let Some(mss) = self.max_seg_size {
            write!(f, " mss={}", mss)?;
        }
        Ok(())
    }
}
