//! Construction of outgoing headers in the packet buffer.
//!
//! Frames are laid out without IP options, so every header sits at a fixed offset. The `build_*`
//! methods write a header towards the current peer, the `reply_*` methods turn the received frame
//! in the packet buffer into an answer in place.
use crate::error::Result;
use crate::nic::{Device, Region, Source};
use crate::random::Random;
use crate::time::Clock;
use crate::wire::{Checksum, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Repr};
use crate::wire::{TcpFlags, TcpRepr, UdpRepr};
use crate::wire::{ethernet_frame, ipv4_packet, tcp_packet, udp_packet};
use crate::wire::{IPV4_HEADER_LEN, TCP_HEADER_LEN, TCP_SYN_OPTIONS_LEN};

use super::{Connection, Protocol, IP_OFFSET, TRANSPORT_OFFSET};

/// Source and destination address in front of the transport header.
const ADDRESSES_LEN: usize = 8;

impl<'a, D: Device, C: Clock, R: Random> Connection<'a, D, C, R> {
    /// Write the Ethernet header of a frame to the peer.
    pub(super) fn build_ethernet(&mut self, ethertype: EthernetProtocol) {
        let repr = EthernetRepr {
            src_addr: self.local.hardware_addr,
            dst_addr: self.peer.hardware_addr,
            ethertype,
        };
        repr.emit(ethernet_frame::new_unchecked_mut(&mut self.packet[..]));
    }

    /// Address the received frame back to its sender.
    pub(super) fn reply_ethernet(&mut self) {
        ethernet_frame::new_unchecked_mut(&mut self.packet[..])
            .swap_for_reply(self.local.hardware_addr);
    }

    /// Write the IPv4 header of a packet to the peer, with a fresh identification.
    pub(super) fn build_ip(&mut self, protocol: IpProtocol, payload_len: usize) {
        let repr = Ipv4Repr {
            src_addr: self.local.addr,
            dst_addr: self.peer.addr,
            protocol,
            payload_len,
            hop_limit: self.config.hop_limit,
            ident: self.random.next_u16(),
        };
        repr.emit(ipv4_packet::new_unchecked_mut(&mut self.packet[IP_OFFSET..]), Checksum::Manual);
    }

    /// Turn the received IPv4 header into the header of the answer.
    ///
    /// With a `payload_len` the answer has a different length than the request. The checksum is
    /// recomputed completely.
    pub(super) fn reply_ip(&mut self, payload_len: Option<usize>) {
        let hop_limit = self.config.hop_limit;
        let packet = ipv4_packet::new_unchecked_mut(&mut self.packet[IP_OFFSET..]);
        if let Some(len) = payload_len {
            packet.set_total_len((IPV4_HEADER_LEN + len) as u16);
        }
        packet.set_ident(packet.ident().wrapping_add(1));
        packet.set_hop_limit(hop_limit);
        packet.swap_addresses();
        packet.fill_checksum();
    }

    /// Write a TCP header to the peer with the current sequence and acknowledgment numbers.
    ///
    /// `syn_options` appends the option block announcing our segment size. A software checksum
    /// can only be computed for segments without payload, otherwise the checksum is left for
    /// [`offload_checksum`]. Returns the header length.
    ///
    /// [`offload_checksum`]: #method.offload_checksum
    pub(super) fn build_tcp(
        &mut self,
        flags: TcpFlags,
        payload_len: usize,
        syn_options: bool,
        checksum: Checksum,
    ) -> usize {
        let repr = TcpRepr {
            src_port: self.local.port,
            dst_port: self.peer.port,
            seq_number: self.seq,
            ack_number: self.ack,
            flags,
            window_len: self.config.window,
            max_seg_size: if syn_options { Some(self.config.window) } else { None },
            payload_len,
        };
        debug_assert!(payload_len == 0 || !checksum.manual());

        let header_end = TRANSPORT_OFFSET + repr.header_len();
        let packet = tcp_packet::new_unchecked_mut(&mut self.packet[TRANSPORT_OFFSET..header_end]);
        repr.emit(packet, self.local.addr, self.peer.addr, checksum);
        repr.header_len()
    }

    /// Write a UDP header to the peer, leaving the checksum for [`offload_checksum`].
    ///
    /// [`offload_checksum`]: #method.offload_checksum
    pub(super) fn build_udp(&mut self, payload_len: usize) -> usize {
        let repr = UdpRepr {
            src_port: self.local.port,
            dst_port: self.peer.port,
            payload_len,
        };
        let packet = udp_packet::new_unchecked_mut(&mut self.packet[TRANSPORT_OFFSET..]);
        repr.emit(packet, self.local.addr, self.peer.addr, Checksum::Ignored);
        repr.buffer_len()
    }

    /// Build all headers of the outgoing data segment and write them into the device.
    ///
    /// The payload must already be in place in the outgoing frame.
    pub(super) fn build_outgoing(&mut self, payload_len: usize) {
        let header_len = self.protocol.header_len();
        self.build_ethernet(EthernetProtocol::Ipv4);
        self.build_ip(self.protocol.into(), header_len + payload_len);
        match self.protocol {
            Protocol::Tcp => {
                let flags = TcpFlags::PSH | TcpFlags::ACK;
                self.build_tcp(flags, payload_len, false, Checksum::Ignored)
            },
            Protocol::Udp => self.build_udp(payload_len),
        };
        self.offload_checksum(header_len + payload_len);
    }

    /// Let the device compute the transport checksum of the outgoing frame.
    ///
    /// Writes the headers of the packet buffer into the frame first, the transport header holding
    /// the protocol and segment length in its checksum field. Summed with the addresses in front
    /// of the transport header this is exactly the pseudo header, so one contiguous range of the
    /// frame covers everything.
    pub(super) fn offload_checksum(&mut self, segment_len: usize) {
        let header_end = TRANSPORT_OFFSET + self.prepare_checksum(segment_len);
        self.device.write(Region::Outgoing, 0, &self.packet[..header_end], Source::Ram);

        let mut checksum = self.device.checksum(
            Region::Outgoing,
            TRANSPORT_OFFSET - ADDRESSES_LEN,
            ADDRESSES_LEN + segment_len);
        // Zero would claim that no checksum was computed.
        if self.protocol == Protocol::Udp && checksum == 0 {
            checksum = 0xffff;
        }

        self.set_transport_checksum(checksum);
        self.device.write(
            Region::Outgoing,
            TRANSPORT_OFFSET,
            &self.packet[TRANSPORT_OFFSET..header_end],
            Source::Ram);
    }

    /// Verify the transport checksum of the received frame with the help of the device.
    ///
    /// Uses the same placeholder as [`offload_checksum`], overwriting the checksum field in the
    /// device's copy of the frame.
    ///
    /// [`offload_checksum`]: #method.offload_checksum
    pub(super) fn verify_offloaded(&mut self, segment_len: usize) -> bool {
        let received = self.transport_checksum();
        let header_end = TRANSPORT_OFFSET + self.prepare_checksum(segment_len);
        self.device.write(
            Region::Received,
            TRANSPORT_OFFSET,
            &self.packet[TRANSPORT_OFFSET..header_end],
            Source::Ram);

        let computed = self.device.checksum(
            Region::Received,
            TRANSPORT_OFFSET - ADDRESSES_LEN,
            ADDRESSES_LEN + segment_len);
        computed == received || (computed == 0 && received == 0xffff)
    }

    /// Store the pseudo header placeholder, returns the transport header length.
    fn prepare_checksum(&mut self, segment_len: usize) -> usize {
        let protocol = u16::from(u8::from(IpProtocol::from(self.protocol)));
        self.set_transport_checksum(protocol + segment_len as u16)
    }

    pub(super) fn transport_checksum(&self) -> u16 {
        let segment = &self.packet[TRANSPORT_OFFSET..];
        match self.protocol {
            Protocol::Tcp => tcp_packet::new_unchecked(segment).checksum(),
            Protocol::Udp => udp_packet::new_unchecked(segment).checksum(),
        }
    }

    fn set_transport_checksum(&mut self, value: u16) -> usize {
        let segment = &mut self.packet[TRANSPORT_OFFSET..];
        match self.protocol {
            Protocol::Tcp => {
                let packet = tcp_packet::new_unchecked_mut(segment);
                packet.set_checksum(value);
                usize::from(packet.header_len())
            },
            Protocol::Udp => {
                udp_packet::new_unchecked_mut(segment).set_checksum(value);
                self.protocol.header_len()
            },
        }
    }

    /// Transmit the start of the packet buffer as a new frame.
    pub(super) fn dispatch(&mut self, len: usize) -> Result<()> {
        self.device.send(&self.packet[..len])
    }

    /// Answer the received TCP segment in place, without payload.
    pub(super) fn reply_tcp(&mut self, flags: TcpFlags, syn_options: bool) -> Result<()> {
        let header_len = if syn_options {
            TCP_HEADER_LEN + TCP_SYN_OPTIONS_LEN
        } else {
            TCP_HEADER_LEN
        };
        self.reply_ethernet();
        self.reply_ip(Some(header_len));
        self.build_tcp(flags, 0, syn_options, Checksum::Manual);
        net_trace!("socket: sending {} seq={} ack={}", flags, self.seq, self.ack);
        self.dispatch(TRANSPORT_OFFSET + header_len)
    }

    /// Pick a new initial sequence number and send a SYN.
    pub(super) fn send_syn(&mut self) -> Result<()> {
        self.init_seq();
        self.ack = 0;

        let header_len = TCP_HEADER_LEN + TCP_SYN_OPTIONS_LEN;
        self.build_ethernet(EthernetProtocol::Ipv4);
        self.build_ip(IpProtocol::Tcp, header_len);
        self.build_tcp(TcpFlags::SYN, 0, true, Checksum::Manual);
        self.seq = self.seq.wrapping_add(1);
        self.dispatch(TRANSPORT_OFFSET + header_len)
    }

    /// Abort the connection towards the peer.
    pub(super) fn send_reset(&mut self) -> Result<()> {
        self.build_ethernet(EthernetProtocol::Ipv4);
        self.build_ip(IpProtocol::Tcp, TCP_HEADER_LEN);
        self.build_tcp(TcpFlags::RST | TcpFlags::ACK, 0, false, Checksum::Manual);
        self.dispatch(TRANSPORT_OFFSET + TCP_HEADER_LEN)
    }

    /// Derive an initial sequence number from the clock and the random source.
    pub(super) fn init_seq(&mut self) {
        let millis = self.clock.now().total_millis() as u32;
        let high = u32::from(self.random.next_u16()) << 16;
        let low = u32::from(self.random.next_u16());
        self.seq = millis ^ high ^ low;
    }
}
