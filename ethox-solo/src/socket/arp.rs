//! Address resolution for the single peer.
//!
//! There is no cache. The hardware address of the peer, or of the gateway in front of it, is
//! looked up once per `connect` and stored with the peer. A listening connection learns it from
//! the first frame of the peer instead.
use crate::nic::Device;
use crate::random::Random;
use crate::time::Clock;
use crate::wire::{ArpOperation, ArpRepr, EthernetAddress, EthernetProtocol, EthernetRepr};
use crate::wire::{Ipv4Address, arp_packet, ethernet_frame};
use crate::wire::{ARP_PACKET_LEN, ETHERNET_HEADER_LEN};
use crate::error::Result;

use super::{Connection, State};

/// Length of an ARP frame, without padding.
const ARP_FRAME_LEN: usize = ETHERNET_HEADER_LEN + ARP_PACKET_LEN;

impl<'a, D: Device, C: Clock, R: Random> Connection<'a, D, C, R> {
    /// Broadcast a request for the hardware address of `target`.
    ///
    /// The answer is picked up by the dispatch loop while the connection is resolving.
    pub(super) fn request_hardware_addr(&mut self, target: Ipv4Address) -> Result<()> {
        let eth = EthernetRepr {
            src_addr: self.local.hardware_addr,
            dst_addr: EthernetAddress::BROADCAST,
            ethertype: EthernetProtocol::Arp,
        };
        let arp = ArpRepr {
            operation: ArpOperation::Request,
            source_hardware_addr: self.local.hardware_addr,
            source_protocol_addr: self.local.addr,
            target_hardware_addr: EthernetAddress::UNSPECIFIED,
            target_protocol_addr: target,
        };

        eth.emit(ethernet_frame::new_unchecked_mut(&mut self.packet[..]));
        arp.emit(arp_packet::new_unchecked_mut(&mut self.packet[ETHERNET_HEADER_LEN..]));
        self.dispatch(ARP_FRAME_LEN)
    }

    /// Handle the ARP packet of the frame in the packet buffer.
    ///
    /// `len` is the number of octets of the frame held in the buffer.
    pub(super) fn receive_arp(&mut self, len: usize) {
        let repr = match arp_packet::new_checked(&self.packet[ETHERNET_HEADER_LEN..len])
            .and_then(ArpRepr::parse)
        {
            Ok(repr) => repr,
            Err(err) => {
                net_trace!("arp: dropping packet: {}", err);
                return;
            },
        };

        match repr.operation {
            ArpOperation::Request => {
                if repr.target_protocol_addr != self.local.addr {
                    return;
                }
                if self.tx_offset != 0 {
                    net_trace!("arp: outgoing frame busy, ignoring request of {}",
                        repr.source_protocol_addr);
                    return;
                }

                self.reply_ethernet();
                arp_packet::new_unchecked_mut(&mut self.packet[ETHERNET_HEADER_LEN..])
                    .answer_request(self.local.hardware_addr, self.local.addr);
                net_trace!("arp: is-at {} for {}", self.local.hardware_addr,
                    repr.source_protocol_addr);
                if let Err(err) = self.dispatch(ARP_FRAME_LEN) {
                    net_debug!("arp: could not send reply: {}", err);
                }
            },
            ArpOperation::Reply => {
                if self.state != State::ResolvingPeer
                    || repr.source_protocol_addr != self.next_hop
                {
                    net_trace!("arp: unsolicited reply from {}", repr.source_protocol_addr);
                    return;
                }

                net_debug!("arp: {} is-at {}", repr.source_protocol_addr, repr.source_hardware_addr);
                self.peer.hardware_addr = repr.source_hardware_addr;
                self.set_state(State::Handshaking);
            },
            ArpOperation::Unknown(op) => {
                net_trace!("arp: unknown operation {}", op);
            },
        }
    }
}
