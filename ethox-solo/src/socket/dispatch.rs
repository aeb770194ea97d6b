//! The dispatch loop and the per-protocol receive paths.
//!
//! Each frame is checked outside in. Anything malformed, addressed elsewhere or not expected in
//! the current state is dropped with a trace message and the loop moves on to the next frame.
//! Only the headers are read into the packet buffer. Payload is copied by the device straight
//! from the received frame into the receive storage.
use crate::nic::{Device, Region};
use crate::random::Random;
use crate::time::{Clock, Duration};
use crate::wire::{Checksum, EthernetProtocol, Icmpv4Message, Icmpv4Repr, IpProtocol};
use crate::wire::{Ipv4Repr, TcpFlags, TcpRepr, UdpRepr};
use crate::wire::{ethernet_frame, icmpv4_packet, ipv4_packet, tcp_packet, udp_packet};
use crate::wire::UDP_HEADER_LEN;

use super::{Connection, Peer, Protocol, State};
use super::{IP_OFFSET, MAX_RECEIVE_LEN, PACKET_BUFFER_LEN, TRANSPORT_OFFSET};

impl<'a, D: Device, C: Clock, R: Random> Connection<'a, D, C, R> {
    /// Process received frames for at most `budget`.
    ///
    /// Returns early once the state changed or a segment was accepted on the established
    /// connection.
    pub(super) fn pump(&mut self, budget: Duration) {
        let start = self.clock.now();
        let initial = self.state;

        while self.clock.now() - start < budget && self.state == initial {
            let len = match self.device.poll() {
                Some(len) => len,
                None => continue,
            };

            let accepted = if len > MAX_RECEIVE_LEN {
                net_trace!("socket: dropping oversized frame of {} octets", len);
                false
            } else {
                self.receive(len)
            };

            self.device.release();

            if accepted {
                return;
            }
        }
    }

    /// Handle one received frame of `len` octets, returns if it was accepted.
    fn receive(&mut self, len: usize) -> bool {
        let stored = len.min(PACKET_BUFFER_LEN);
        self.device.read(Region::Received, 0, &mut self.packet[..stored]);

        let ethertype = match ethernet_frame::new_checked(&self.packet[..stored]) {
            Ok(frame) => frame.ethertype(),
            Err(err) => {
                net_trace!("socket: dropping frame: {}", err);
                return false;
            },
        };

        match ethertype {
            EthernetProtocol::Arp => {
                self.receive_arp(stored);
                false
            },
            EthernetProtocol::Ipv4 => self.receive_ipv4(len, stored),
            other => {
                net_trace!("socket: dropping frame with type {}", other);
                false
            },
        }
    }

    fn receive_ipv4(&mut self, len: usize, stored: usize) -> bool {
        let repr = match ipv4_packet::new_checked(&self.packet[IP_OFFSET..stored])
            .and_then(|packet| Ipv4Repr::parse(packet, Checksum::Manual))
        {
            Ok(repr) => repr,
            Err(err) => {
                net_trace!("socket: dropping packet: {}", err);
                return false;
            },
        };

        if repr.dst_addr != self.local.addr {
            net_trace!("socket: dropping packet for {}", repr.dst_addr);
            return false;
        }

        // Short frames are padded, the IP header tells the true length.
        let frame_len = TRANSPORT_OFFSET + repr.payload_len;
        if frame_len > len {
            net_trace!("socket: dropping truncated packet of {} octets", len);
            return false;
        }

        match (repr.protocol, self.protocol) {
            (IpProtocol::Icmp, _) => {
                self.receive_icmp(frame_len);
                false
            },
            (IpProtocol::Udp, Protocol::Udp) => self.receive_udp(repr, stored),
            (IpProtocol::Tcp, Protocol::Tcp) => self.receive_tcp(repr, stored),
            (other, _) => {
                net_trace!("socket: ignoring {} from {}", other, repr.src_addr);
                false
            },
        }
    }

    /// Answer an echo request in place.
    fn receive_icmp(&mut self, frame_len: usize) {
        if self.tx_offset != 0 {
            net_trace!("icmp: outgoing frame busy, ignoring");
            return;
        }
        if frame_len > PACKET_BUFFER_LEN {
            net_trace!("icmp: message of {} octets does not fit", frame_len);
            return;
        }

        match icmpv4_packet::new_checked(&self.packet[TRANSPORT_OFFSET..frame_len])
            .and_then(|packet| Icmpv4Repr::parse(packet, Checksum::Manual))
        {
            Ok(Icmpv4Repr::EchoRequest { ident, seq_no, .. }) => {
                net_trace!("icmp: echo reply ident={} seq={}", ident, seq_no);
            },
            Ok(_) => return,
            Err(err) => {
                net_trace!("icmp: dropping message: {}", err);
                return;
            },
        }

        self.reply_ethernet();
        self.reply_ip(None);
        icmpv4_packet::new_unchecked_mut(&mut self.packet[TRANSPORT_OFFSET..frame_len])
            .patch_msg_type(Icmpv4Message::EchoReply);
        if let Err(err) = self.dispatch(frame_len) {
            net_debug!("icmp: could not send reply: {}", err);
        }
    }

    fn receive_udp(&mut self, ip: Ipv4Repr, stored: usize) -> bool {
        let repr = match udp_packet::new_checked(&self.packet[TRANSPORT_OFFSET..stored])
            .and_then(|packet| UdpRepr::parse(packet, ip.src_addr, ip.dst_addr, Checksum::Ignored))
        {
            Ok(repr) => repr,
            Err(err) => {
                net_trace!("udp: dropping datagram: {}", err);
                return false;
            },
        };

        let segment_len = UDP_HEADER_LEN + repr.payload_len;
        if segment_len > ip.payload_len {
            net_trace!("udp: datagram longer than its packet");
            return false;
        }
        if repr.dst_port != self.local.port {
            net_trace!("udp: dropping datagram for port {}", repr.dst_port);
            return false;
        }
        if self.transport_checksum() != 0 && !self.verify_offloaded(segment_len) {
            net_trace!("udp: dropping datagram: wrong checksum");
            return false;
        }

        match self.state {
            State::Established | State::Listening if repr.payload_len > 0 => (),
            _ => return false,
        }

        if self.state == State::Listening {
            self.peer = Peer {
                hardware_addr: ethernet_frame::new_unchecked(&self.packet[..]).src_addr(),
                addr: ip.src_addr,
                port: repr.src_port,
            };
            self.set_state(State::Established);
        }

        let accepted = self.absorb(TRANSPORT_OFFSET + UDP_HEADER_LEN, repr.payload_len);
        net_trace!("udp: accepted {} of {} octets", accepted, repr.payload_len);
        true
    }

    fn receive_tcp(&mut self, ip: Ipv4Repr, stored: usize) -> bool {
        let repr = match tcp_packet::new_checked(&self.packet[TRANSPORT_OFFSET..stored])
            .and_then(|packet| TcpRepr::parse(
                packet, ip.payload_len, ip.src_addr, ip.dst_addr, Checksum::Ignored))
        {
            Ok(repr) => repr,
            Err(err) => {
                net_trace!("tcp: dropping segment: {}", err);
                return false;
            },
        };

        if repr.dst_port != self.local.port {
            net_trace!("tcp: dropping segment for port {}", repr.dst_port);
            return false;
        }
        if !self.verify_offloaded(ip.payload_len) {
            net_trace!("tcp: dropping segment: wrong checksum");
            return false;
        }

        net_trace!("tcp: {} in {}", repr, self.state);
        match self.state {
            State::Handshaking => {
                self.tcp_handshake(ip, repr);
                false
            },
            State::Listening => {
                self.tcp_listen(ip, repr);
                false
            },
            State::Established => self.tcp_established(ip, repr),
            _ => false,
        }
    }

    /// Complete an active open with the SYN+ACK of the peer.
    fn tcp_handshake(&mut self, ip: Ipv4Repr, repr: TcpRepr) {
        if repr.flags != TcpFlags::SYN | TcpFlags::ACK
            || repr.ack_number != self.seq
            || repr.src_port != self.peer.port
            || ip.src_addr != self.peer.addr
        {
            return;
        }

        self.ack = repr.seq_number.wrapping_add(1);
        if let Err(err) = self.reply_tcp(TcpFlags::ACK, false) {
            net_debug!("tcp: could not acknowledge handshake: {}", err);
        }
        self.set_state(State::Established);
    }

    /// Accept a passive open.
    fn tcp_listen(&mut self, ip: Ipv4Repr, repr: TcpRepr) {
        if !repr.flags.contains(TcpFlags::SYN)
            || repr.flags.intersects(TcpFlags::ACK | TcpFlags::RST | TcpFlags::FIN)
        {
            return;
        }

        self.peer = Peer {
            hardware_addr: ethernet_frame::new_unchecked(&self.packet[..]).src_addr(),
            addr: ip.src_addr,
            port: repr.src_port,
        };
        self.init_seq();
        self.ack = repr.seq_number.wrapping_add(1);

        if let Err(err) = self.reply_tcp(TcpFlags::SYN | TcpFlags::ACK, true) {
            net_debug!("tcp: could not answer SYN: {}", err);
        }
        self.seq = self.seq.wrapping_add(1);
        self.set_state(State::Established);
    }

    /// Handle a segment on the established connection, returns if it was accepted.
    fn tcp_established(&mut self, ip: Ipv4Repr, repr: TcpRepr) -> bool {
        if repr.seq_number != self.ack
            || repr.src_port != self.peer.port
            || ip.src_addr != self.peer.addr
        {
            return false;
        }

        if repr.flags.contains(TcpFlags::RST) {
            net_debug!("tcp: reset by peer");
            self.set_state(State::Closed);
            return false;
        }

        // Only the acknowledgment of the segment in flight is expected.
        if !repr.flags.contains(TcpFlags::ACK)
            || repr.ack_number != self.seq.wrapping_add(self.seq_adv)
        {
            return false;
        }
        self.seq = repr.ack_number;

        if repr.flags.contains(TcpFlags::FIN) {
            net_debug!("tcp: finished by peer");
            if let Err(err) = self.reply_tcp(TcpFlags::RST | TcpFlags::ACK, false) {
                net_debug!("tcp: could not send reset: {}", err);
            }
            self.set_state(State::Closed);
            return false;
        }

        let header_len = ip.payload_len - repr.payload_len;
        let accepted = self.absorb(TRANSPORT_OFFSET + header_len, repr.payload_len);
        if accepted > 0 {
            self.ack = self.ack.wrapping_add(accepted as u32);
            if let Err(err) = self.reply_tcp(TcpFlags::ACK, false) {
                net_debug!("tcp: could not acknowledge data: {}", err);
            }
        }

        true
    }

    /// Copy payload of the received frame into the receive storage, as much as fits.
    fn absorb(&mut self, offset: usize, len: usize) -> usize {
        let accepted = len.min(self.rx.len() - self.available);
        let end = self.available + accepted;
        self.device.read(Region::Received, offset, &mut self.rx[self.available..end]);
        self.available = end;
        accepted
    }
}
