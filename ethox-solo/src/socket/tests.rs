use super::*;
use crate::nic::sim::{Simulator, StepClock};
use crate::random::Xoroshiro256;
use crate::time::Instant;
use crate::wire::{ArpOperation, ArpRepr, Checksum, EthernetProtocol, EthernetRepr};
use crate::wire::{Icmpv4Repr, IpProtocol, Ipv4Repr, TcpFlags, TcpRepr, UdpRepr};
use crate::wire::{arp_packet, ethernet_frame, icmpv4_packet, ipv4_packet, tcp_packet, udp_packet};
use crate::wire::{ARP_PACKET_LEN, ICMPV4_HEADER_LEN};

#[derive(Clone, Copy)]
struct Host {
    hardware_addr: EthernetAddress,
    addr: Ipv4Address,
}

const LOCAL_HW: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x01]);
const LOCAL_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const LOCAL_PORT: u16 = 7;

const PEER: Host = Host {
    hardware_addr: EthernetAddress([0x02, 0, 0, 0, 0, 0x02]),
    addr: Ipv4Address::new(10, 0, 0, 3),
};
const PEER_PORT: u16 = 4000;
const PEER_ISN: u32 = 999;

const GATEWAY: Host = Host {
    hardware_addr: EthernetAddress([0x02, 0, 0, 0, 0, 0x03]),
    addr: Ipv4Address::new(10, 0, 0, 1),
};

/// A host behind the gateway, its frames carry the gateway's hardware address.
const REMOTE: Host = Host {
    hardware_addr: GATEWAY.hardware_addr,
    addr: Ipv4Address::new(192, 168, 7, 9),
};

type TestConnection<'a> = Connection<'a, Simulator, StepClock, Xoroshiro256>;

fn config() -> Config {
    Config {
        connection_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_millis(20),
        poll_timeout: Duration::from_millis(5),
        ..Config::default()
    }
}

fn connection(sim: Simulator, rx: &mut [u8]) -> TestConnection<'_> {
    let clock = StepClock::starting_at(Instant::from_millis(1_000), Duration::from_millis(1));
    let mut conn = Connection::with_config(sim, clock, Xoroshiro256::new(0x5eed), rx, config());
    conn.setup(LOCAL_IP, LOCAL_HW, 24, GATEWAY.addr);
    conn
}

/// Let the peer open a connection to `LOCAL_PORT`, starting its sequence at `PEER_ISN`.
fn accept(conn: &mut TestConnection) {
    conn.device_mut().inject(tcp_frame(PEER, segment(LOCAL_PORT, PEER_ISN, 0, TcpFlags::SYN), &[]));
    assert_eq!(conn.listen(LOCAL_PORT, Protocol::Tcp), Ok(PEER.addr));
    conn.device_mut().take_sent();
}

/// Put the connection into the established state without any exchange.
fn establish(conn: &mut TestConnection, protocol: Protocol) {
    conn.reset(protocol);
    conn.local.port = LOCAL_PORT;
    conn.peer = Peer {
        hardware_addr: PEER.hardware_addr,
        addr: PEER.addr,
        port: PEER_PORT,
    };
    conn.seq = 0x0001_0000;
    conn.ack = PEER_ISN + 1;
    conn.state = State::Established;
}

fn host_for(addr: Ipv4Address) -> Host {
    [PEER, GATEWAY, REMOTE].iter()
        .cloned()
        .find(|host| host.addr == addr)
        .unwrap()
}

fn ethernet(frame: &mut [u8], src_addr: EthernetAddress, dst_addr: EthernetAddress,
            ethertype: EthernetProtocol) {
    let repr = EthernetRepr { src_addr, dst_addr, ethertype };
    repr.emit(ethernet_frame::new_unchecked_mut(frame));
}

fn arp_frame(repr: ArpRepr, dst_addr: EthernetAddress) -> Vec<u8> {
    let mut frame = vec![0; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];
    ethernet(&mut frame, repr.source_hardware_addr, dst_addr, EthernetProtocol::Arp);
    repr.emit(arp_packet::new_unchecked_mut(&mut frame[ETHERNET_HEADER_LEN..]));
    frame
}

fn arp_request(from: Host, target: Ipv4Address) -> Vec<u8> {
    arp_frame(ArpRepr {
        operation: ArpOperation::Request,
        source_hardware_addr: from.hardware_addr,
        source_protocol_addr: from.addr,
        target_hardware_addr: EthernetAddress::UNSPECIFIED,
        target_protocol_addr: target,
    }, EthernetAddress::BROADCAST)
}

fn arp_reply(from: Host) -> Vec<u8> {
    arp_frame(ArpRepr {
        operation: ArpOperation::Reply,
        source_hardware_addr: from.hardware_addr,
        source_protocol_addr: from.addr,
        target_hardware_addr: LOCAL_HW,
        target_protocol_addr: LOCAL_IP,
    }, LOCAL_HW)
}

fn ip_frame(from: Host, protocol: IpProtocol, payload_len: usize) -> Vec<u8> {
    let mut frame = vec![0; TRANSPORT_OFFSET + payload_len];
    ethernet(&mut frame, from.hardware_addr, LOCAL_HW, EthernetProtocol::Ipv4);
    let repr = Ipv4Repr {
        src_addr: from.addr,
        dst_addr: LOCAL_IP,
        protocol,
        payload_len,
        hop_limit: 64,
        ident: 0x0101,
    };
    repr.emit(ipv4_packet::new_unchecked_mut(&mut frame[IP_OFFSET..]), Checksum::Manual);
    frame
}

fn segment(dst_port: u16, seq_number: u32, ack_number: u32, flags: TcpFlags) -> TcpRepr {
    TcpRepr {
        src_port: PEER_PORT,
        dst_port,
        seq_number,
        ack_number,
        flags,
        window_len: 1024,
        max_seg_size: None,
        payload_len: 0,
    }
}

fn tcp_frame(from: Host, mut repr: TcpRepr, payload: &[u8]) -> Vec<u8> {
    repr.payload_len = payload.len();
    let mut frame = ip_frame(from, IpProtocol::Tcp, repr.buffer_len());
    let packet = &mut frame[TRANSPORT_OFFSET..];
    packet[repr.header_len()..].copy_from_slice(payload);
    repr.emit(tcp_packet::new_unchecked_mut(packet), from.addr, LOCAL_IP, Checksum::Manual);
    frame
}

fn udp_frame(from: Host, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let repr = UdpRepr { src_port, dst_port, payload_len: payload.len() };
    let mut frame = ip_frame(from, IpProtocol::Udp, UDP_HEADER_LEN + payload.len());
    let packet = &mut frame[TRANSPORT_OFFSET..];
    packet[UDP_HEADER_LEN..].copy_from_slice(payload);
    repr.emit(udp_packet::new_unchecked_mut(packet), from.addr, LOCAL_IP, Checksum::Manual);
    frame
}

fn echo_request(ident: u16, seq_no: u16, payload: &[u8]) -> Vec<u8> {
    let repr = Icmpv4Repr::EchoRequest { ident, seq_no, payload: payload.len() };
    let mut frame = ip_frame(PEER, IpProtocol::Icmp, ICMPV4_HEADER_LEN + payload.len());
    let packet = &mut frame[TRANSPORT_OFFSET..];
    packet[ICMPV4_HEADER_LEN..].copy_from_slice(payload);
    repr.emit(icmpv4_packet::new_unchecked_mut(packet), Checksum::Manual);
    frame
}

fn sent_arp(frame: &[u8]) -> Option<ArpRepr> {
    let eth = ethernet_frame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }
    ArpRepr::parse(arp_packet::new_checked(eth.payload_slice()).ok()?).ok()
}

/// Parse an IPv4 packet sent by the stack, verifying its checksum.
fn sent_ip(frame: &[u8]) -> Option<Ipv4Repr> {
    let eth = ethernet_frame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let repr = Ipv4Repr::parse(ipv4_packet::new_checked(eth.payload_slice()).ok()?, Checksum::Manual).ok()?;
    assert_eq!(frame.len(), TRANSPORT_OFFSET + repr.payload_len, "frame has padding");
    Some(repr)
}

/// Parse a TCP segment sent by the stack, verifying all checksums in software.
fn sent_tcp(frame: &[u8]) -> Option<(Ipv4Repr, TcpRepr)> {
    let ip = sent_ip(frame)?;
    if ip.protocol != IpProtocol::Tcp {
        return None;
    }
    let packet = tcp_packet::new_checked(&frame[TRANSPORT_OFFSET..]).ok()?;
    let tcp = TcpRepr::parse(packet, ip.payload_len, ip.src_addr, ip.dst_addr, Checksum::Manual).ok()?;
    Some((ip, tcp))
}

fn sent_udp(frame: &[u8]) -> Option<(UdpRepr, Vec<u8>)> {
    let ip = sent_ip(frame)?;
    if ip.protocol != IpProtocol::Udp {
        return None;
    }
    let packet = udp_packet::new_checked(&frame[TRANSPORT_OFFSET..]).ok()?;
    let udp = UdpRepr::parse(packet, ip.src_addr, ip.dst_addr, Checksum::Manual).ok()?;
    Some((udp, packet.payload_slice().to_vec()))
}

fn tcp_payload(frame: &[u8]) -> &[u8] {
    &frame[TRANSPORT_OFFSET + TCP_HEADER_LEN..]
}

fn answer_arp(request: ArpRepr) -> Option<Vec<u8>> {
    if request.operation != ArpOperation::Request {
        return None;
    }
    [PEER, GATEWAY].iter()
        .find(|host| host.addr == request.target_protocol_addr)
        .map(|&host| arp_reply(host))
}

/// A peer that resolves, accepts the handshake and acknowledges all data.
fn server(isn: u32) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + 'static {
    move |frame: &[u8]| {
        if let Some(arp) = sent_arp(frame) {
            return answer_arp(arp).into_iter().collect();
        }

        let (ip, tcp) = match sent_tcp(frame) {
            Some(parsed) => parsed,
            None => return Vec::new(),
        };
        let from = host_for(ip.dst_addr);
        let mut answer = TcpRepr {
            src_port: tcp.dst_port,
            dst_port: tcp.src_port,
            seq_number: isn.wrapping_add(1),
            ack_number: tcp.seq_number.wrapping_add(tcp.payload_len as u32),
            flags: TcpFlags::ACK,
            window_len: 1024,
            max_seg_size: None,
            payload_len: 0,
        };

        if tcp.flags == TcpFlags::SYN {
            answer.seq_number = isn;
            answer.ack_number = tcp.seq_number.wrapping_add(1);
            answer.flags = TcpFlags::SYN | TcpFlags::ACK;
            answer.max_seg_size = Some(1460);
            vec![tcp_frame(from, answer, &[])]
        } else if tcp.payload_len > 0 {
            vec![tcp_frame(from, answer, &[])]
        } else {
            Vec::new()
        }
    }
}

#[test]
fn connect_tcp() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::with_peer(server(PEER_ISN)), &mut rx);

    assert_eq!(conn.connect(PEER.addr, PEER_PORT, Protocol::Tcp), Ok(()));
    assert_eq!(conn.state(), State::Established);
    assert!(conn.local_port() >= 1024);
    assert_eq!(conn.peer_addr(), PEER.addr);
    assert_eq!(conn.peer_port(), PEER_PORT);

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 3);

    let request = sent_arp(&sent[0]).unwrap();
    assert_eq!(sent[0].len(), 42);
    assert_eq!(ethernet_frame::new_unchecked(&sent[0]).dst_addr(), EthernetAddress::BROADCAST);
    assert_eq!(request.operation, ArpOperation::Request);
    assert_eq!(request.source_hardware_addr, LOCAL_HW);
    assert_eq!(request.source_protocol_addr, LOCAL_IP);
    assert_eq!(request.target_protocol_addr, PEER.addr);

    let (ip, syn) = sent_tcp(&sent[1]).unwrap();
    assert_eq!(ethernet_frame::new_unchecked(&sent[1]).dst_addr(), PEER.hardware_addr);
    assert_eq!((ip.src_addr, ip.dst_addr), (LOCAL_IP, PEER.addr));
    assert_eq!(ip.hop_limit, 64);
    assert_eq!(syn.flags, TcpFlags::SYN);
    assert_eq!(syn.src_port, conn.local_port());
    assert_eq!(syn.dst_port, PEER_PORT);
    assert_eq!(syn.max_seg_size, Some(536));
    assert_eq!(syn.window_len, 536);
    assert_eq!(ip.payload_len, TCP_HEADER_LEN + 8);

    let (ip, ack) = sent_tcp(&sent[2]).unwrap();
    assert_eq!(ack.flags, TcpFlags::ACK);
    assert_eq!(ack.seq_number, syn.seq_number.wrapping_add(1));
    assert_eq!(ack.ack_number, PEER_ISN + 1);
    // The options of the SYN+ACK are cut off in the reply.
    assert_eq!(ip.payload_len, TCP_HEADER_LEN);
    assert_eq!(conn.seq, ack.seq_number);
    assert_eq!(conn.ack, PEER_ISN + 1);
}

#[test]
fn resolve_then_handshake() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    conn.reset(Protocol::Tcp);
    conn.local.port = 1234;
    conn.peer = Peer { addr: PEER.addr, port: PEER_PORT, ..Peer::NONE };
    conn.next_hop = PEER.addr;
    conn.state = State::ResolvingPeer;
    conn.request_hardware_addr(PEER.addr).unwrap();

    // Only the address being resolved may answer.
    conn.device_mut().inject(arp_reply(GATEWAY));
    conn.pump(Duration::from_millis(10));
    assert_eq!(conn.state(), State::ResolvingPeer);

    conn.device_mut().inject(arp_reply(PEER));
    conn.pump(Duration::from_millis(10));
    assert_eq!(conn.state(), State::Handshaking);
    assert_eq!(conn.peer.hardware_addr, PEER.hardware_addr);

    conn.send_syn().unwrap();
    let syn = sent_tcp(conn.device().sent().last().unwrap()).unwrap().1;

    // Acknowledges the wrong sequence number.
    let wrong = segment(1234, PEER_ISN, syn.seq_number, TcpFlags::SYN | TcpFlags::ACK);
    conn.device_mut().inject(tcp_frame(PEER, wrong, &[]));
    conn.pump(Duration::from_millis(10));
    assert_eq!(conn.state(), State::Handshaking);

    let right = segment(1234, PEER_ISN, syn.seq_number + 1, TcpFlags::SYN | TcpFlags::ACK);
    let sent = conn.device().sent().len();

    // Correct acknowledgment, but from another port or another host.
    let other_port = TcpRepr { src_port: PEER_PORT + 1, ..right };
    conn.device_mut().inject(tcp_frame(PEER, other_port, &[]));
    conn.pump(Duration::from_millis(10));
    assert_eq!(conn.state(), State::Handshaking);
    conn.device_mut().inject(tcp_frame(GATEWAY, right, &[]));
    conn.pump(Duration::from_millis(10));
    assert_eq!(conn.state(), State::Handshaking);
    assert_eq!(conn.device().sent().len(), sent);

    conn.device_mut().inject(tcp_frame(PEER, right, &[]));
    conn.pump(Duration::from_millis(10));
    assert_eq!(conn.state(), State::Established);

    let (_, ack) = sent_tcp(conn.device().sent().last().unwrap()).unwrap();
    assert_eq!(ack.flags, TcpFlags::ACK);
    assert_eq!(ack.seq_number, syn.seq_number + 1);
    assert_eq!(ack.ack_number, PEER_ISN + 1);
    assert_eq!(conn.device().released(), 6);
}

#[test]
fn connect_through_gateway() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::with_peer(server(PEER_ISN)), &mut rx);

    assert_eq!(conn.connect(REMOTE.addr, 80, Protocol::Tcp), Ok(()));
    assert_eq!(conn.peer_addr(), REMOTE.addr);

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent_arp(&sent[0]).unwrap().target_protocol_addr, GATEWAY.addr);
    let (ip, syn) = sent_tcp(&sent[1]).unwrap();
    assert_eq!(ethernet_frame::new_unchecked(&sent[1]).dst_addr(), GATEWAY.hardware_addr);
    assert_eq!(ip.dst_addr, REMOTE.addr);
    assert_eq!(syn.dst_port, 80);
}

#[test]
fn connect_unreachable() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);

    assert_eq!(conn.connect(PEER.addr, PEER_PORT, Protocol::Tcp), Err(Error::Unreachable));
    assert_eq!(conn.state(), State::Closed);
    assert_eq!(conn.peer_addr(), Ipv4Address::UNSPECIFIED);

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|frame| sent_arp(frame).is_some()));
}

#[test]
fn connect_handshake_exhausted() {
    let mut rx = [0; 64];
    let sim = Simulator::with_peer(|frame: &[u8]| {
        sent_arp(frame).and_then(answer_arp).into_iter().collect()
    });
    let mut conn = connection(sim, &mut rx);

    assert_eq!(conn.connect(PEER.addr, PEER_PORT, Protocol::Tcp), Err(Error::TimedOut));
    assert_eq!(conn.state(), State::Closed);

    // One request, then one SYN per attempt and no reset.
    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1 + 3);
    for frame in &sent[1..] {
        assert_eq!(sent_tcp(frame).unwrap().1.flags, TcpFlags::SYN);
    }
}

#[test]
fn listen_tcp() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    conn.device_mut().inject(tcp_frame(PEER, segment(LOCAL_PORT, PEER_ISN, 0, TcpFlags::SYN), &[]));

    assert_eq!(conn.listen(LOCAL_PORT, Protocol::Tcp), Ok(PEER.addr));
    assert_eq!(conn.state(), State::Established);
    assert_eq!(conn.peer_port(), PEER_PORT);

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(ethernet_frame::new_unchecked(&sent[0]).dst_addr(), PEER.hardware_addr);
    let (ip, syn_ack) = sent_tcp(&sent[0]).unwrap();
    assert_eq!((ip.src_addr, ip.dst_addr), (LOCAL_IP, PEER.addr));
    assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!((syn_ack.src_port, syn_ack.dst_port), (LOCAL_PORT, PEER_PORT));
    assert_eq!(syn_ack.ack_number, 1000);
    assert_eq!(syn_ack.max_seg_size, Some(536));
    assert_eq!(conn.seq, syn_ack.seq_number.wrapping_add(1));
    assert_eq!(conn.ack, 1000);
}

#[test]
fn listen_ignores_other_segments() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    conn.device_mut().inject(tcp_frame(PEER, segment(LOCAL_PORT, PEER_ISN, 1, TcpFlags::ACK), &[]));
    conn.device_mut().inject(tcp_frame(PEER, segment(LOCAL_PORT, PEER_ISN, 0, TcpFlags::SYN | TcpFlags::RST), &[]));
    conn.device_mut().inject(tcp_frame(PEER, segment(LOCAL_PORT + 1, PEER_ISN, 0, TcpFlags::SYN), &[]));

    assert_eq!(conn.listen(LOCAL_PORT, Protocol::Tcp), Err(Error::TimedOut));
    assert_eq!(conn.state(), State::Closed);
    assert!(conn.device().sent().is_empty());
    assert_eq!(conn.device().released(), 3);
}

#[test]
fn established_ignores_wrong_ack() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);
    let seq = conn.seq;

    let wrong = segment(LOCAL_PORT, PEER_ISN + 1, seq.wrapping_add(5), TcpFlags::ACK);
    conn.device_mut().inject(tcp_frame(PEER, wrong, b"xyz"));
    assert_eq!(conn.available(), 0);
    assert_eq!(conn.state(), State::Established);
    assert_eq!((conn.seq, conn.ack), (seq, PEER_ISN + 1));
    assert!(conn.device().sent().is_empty());

    // Neither out of order data.
    let early = segment(LOCAL_PORT, PEER_ISN + 4, seq, TcpFlags::ACK);
    conn.device_mut().inject(tcp_frame(PEER, early, b"xyz"));
    assert_eq!(conn.available(), 0);
    assert!(conn.device().sent().is_empty());
}

#[test]
fn receive_data() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);
    assert_eq!(conn.ack, 1000);
    let seq = conn.seq;

    let data = segment(LOCAL_PORT, 1000, seq, TcpFlags::PSH | TcpFlags::ACK);
    conn.device_mut().inject(tcp_frame(PEER, data, b"0123456789"));
    assert_eq!(conn.available(), 10);
    assert_eq!(conn.ack, 1010);

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    let (_, ack) = sent_tcp(&sent[0]).unwrap();
    assert_eq!(ack.flags, TcpFlags::ACK);
    assert_eq!((ack.seq_number, ack.ack_number), (seq, 1010));

    assert_eq!(conn.read(4), b"0123");
    assert_eq!(conn.available(), 6);
    assert_eq!(conn.read(100), b"456789");
    assert_eq!(conn.read(100), b"");
}

#[test]
fn receive_truncated() {
    let mut rx = [0; 16];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);
    let seq = conn.seq;

    let first = segment(LOCAL_PORT, 1000, seq, TcpFlags::ACK);
    conn.device_mut().inject(tcp_frame(PEER, first, &[0xaa; 15]));
    let second = segment(LOCAL_PORT, 1015, seq, TcpFlags::ACK);
    conn.device_mut().inject(tcp_frame(PEER, second, b"0123456789"));

    assert_eq!(conn.available(), 15);
    assert_eq!(conn.available(), 16);
    assert_eq!(conn.ack, 1016);

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent_tcp(&sent[1]).unwrap().1.ack_number, 1016);
    assert_eq!(&conn.rx[15..], b"0");
}

#[test]
fn read_is_bounded_by_packet_buffer() {
    let mut rx = [0; 300];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);
    let seq = conn.seq;

    // The segment does not fit the packet buffer, its payload is copied by the device.
    let payload: Vec<u8> = (0..200u8).collect();
    conn.device_mut().inject(tcp_frame(PEER, segment(LOCAL_PORT, 1000, seq, TcpFlags::ACK), &payload));

    assert_eq!(conn.read(1000), &payload[..PACKET_BUFFER_LEN]);
    assert_eq!(conn.read(1000), &payload[PACKET_BUFFER_LEN..]);

    conn.device_mut().inject(tcp_frame(PEER, segment(LOCAL_PORT, 1200, seq, TcpFlags::ACK), b"abc"));
    assert_eq!(conn.available(), 3);
    conn.flush();
    assert_eq!(conn.available(), 0);
}

#[test]
fn close_is_idempotent() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);

    conn.close();
    assert_eq!(conn.state(), State::Closed);
    assert_eq!((conn.peer_addr(), conn.peer_port()), (Ipv4Address::UNSPECIFIED, 0));
    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    let (ip, rst) = sent_tcp(&sent[0]).unwrap();
    assert_eq!(ip.dst_addr, PEER.addr);
    assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!((rst.src_port, rst.dst_port), (LOCAL_PORT, PEER_PORT));

    conn.close();
    assert_eq!(conn.state(), State::Closed);
    assert_eq!((conn.peer_addr(), conn.peer_port()), (Ipv4Address::UNSPECIFIED, 0));
    assert!(conn.device().sent().is_empty());
}

#[test]
fn finished_by_peer() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);
    let seq = conn.seq;

    conn.device_mut().inject(tcp_frame(PEER, segment(LOCAL_PORT, 1000, seq, TcpFlags::FIN | TcpFlags::ACK), &[]));
    assert_eq!(conn.available(), 0);
    assert_eq!(conn.state(), State::Closed);

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent_tcp(&sent[0]).unwrap().1.flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(conn.write(b"late", WriteFlags::NONE), Err(Error::NotEstablished));
}

#[test]
fn reset_by_peer() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);

    conn.device_mut().inject(tcp_frame(PEER, segment(LOCAL_PORT, 1000, 0, TcpFlags::RST), &[]));
    assert_eq!(conn.available(), 0);
    assert_eq!(conn.state(), State::Closed);
    assert!(conn.device().sent().is_empty());
}

#[test]
fn write_tcp() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::with_peer(server(PEER_ISN)), &mut rx);
    conn.connect(PEER.addr, PEER_PORT, Protocol::Tcp).unwrap();
    conn.device_mut().take_sent();
    let seq = conn.seq;

    assert_eq!(conn.write(b"hello", WriteFlags::NONE), Ok(5));
    assert_eq!(conn.seq, seq + 5);
    assert_eq!(conn.state(), State::Established);

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    let (_, data) = sent_tcp(&sent[0]).unwrap();
    assert_eq!(data.flags, TcpFlags::PSH | TcpFlags::ACK);
    assert_eq!((data.seq_number, data.ack_number), (seq, PEER_ISN + 1));
    assert_eq!(tcp_payload(&sent[0]), b"hello");
}

#[test]
fn write_in_pieces() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);
    conn.device_mut().set_peer(server(PEER_ISN));

    assert_eq!(conn.write(b"ab", WriteFlags::MORE_DATA), Ok(2));
    assert!(conn.device().sent().is_empty());
    assert_eq!(conn.write(b"cd", WriteFlags::PERSISTENT), Ok(2));

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(tcp_payload(&sent[0]), b"abcd");
    assert_eq!(conn.device().persistent_writes(), 1);
    assert_eq!(conn.tx_offset, 0);
}

#[test]
fn write_oversized() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);
    conn.device_mut().set_peer(server(PEER_ISN));
    let seq = conn.seq;

    // Sent right away even though more data was announced.
    let accepted = MAX_FRAME_LEN - TRANSPORT_OFFSET - TCP_HEADER_LEN;
    assert_eq!(conn.write(&[0x55; 2000], WriteFlags::MORE_DATA), Ok(accepted));
    assert_eq!(conn.seq, seq.wrapping_add(accepted as u32));

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), MAX_FRAME_LEN);
    assert!(sent_tcp(&sent[0]).is_some());
}

#[test]
fn write_unacknowledged() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);

    assert_eq!(conn.write(b"data", WriteFlags::NONE), Err(Error::TimedOut));
    assert_eq!(conn.state(), State::Closed);

    // Every attempt transmits the same frame, then the connection is reset.
    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 3 + 1);
    assert!(sent[..3].iter().all(|frame| frame == &sent[0]));
    assert_eq!(sent_tcp(&sent[3]).unwrap().1.flags, TcpFlags::RST | TcpFlags::ACK);
}

#[test]
fn write_acknowledged_on_retransmission() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    accept(&mut conn);
    let mut peer = server(PEER_ISN);
    let mut transmissions = 0;
    conn.device_mut().set_peer(move |frame: &[u8]| {
        transmissions += 1;
        if transmissions == 1 { Vec::new() } else { peer(frame) }
    });
    let seq = conn.seq;

    assert_eq!(conn.write(b"data", WriteFlags::NONE), Ok(4));
    assert_eq!(conn.state(), State::Established);
    assert_eq!(conn.seq, seq + 4);

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(tcp_payload(&sent[1]), b"data");
}

#[test]
fn write_requires_connection() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    assert_eq!(conn.write(b"data", WriteFlags::NONE), Err(Error::NotEstablished));
    assert!(conn.device().sent().is_empty());
}

#[test]
fn connect_udp() {
    let mut rx = [0; 64];
    let sim = Simulator::with_peer(|frame: &[u8]| {
        sent_arp(frame).and_then(answer_arp).into_iter().collect()
    });
    let mut conn = connection(sim, &mut rx);

    assert_eq!(conn.connect(PEER.addr, 53, Protocol::Udp), Ok(()));
    assert_eq!(conn.state(), State::Established);
    assert_eq!(conn.device_mut().take_sent().len(), 1);

    assert_eq!(conn.write(b"query", WriteFlags::NONE), Ok(5));
    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    let (udp, payload) = sent_udp(&sent[0]).unwrap();
    assert_eq!((udp.src_port, udp.dst_port), (conn.local_port(), 53));
    assert_eq!(payload, b"query");
    assert_ne!(udp_packet::new_unchecked(&sent[0][TRANSPORT_OFFSET..]).checksum(), 0);
}

#[test]
fn listen_udp() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    conn.device_mut().inject(udp_frame(PEER, PEER_PORT, LOCAL_PORT, b""));
    conn.device_mut().inject(udp_frame(PEER, PEER_PORT, LOCAL_PORT, b"hi"));

    assert_eq!(conn.listen(LOCAL_PORT, Protocol::Udp), Ok(PEER.addr));
    assert_eq!(conn.peer_port(), PEER_PORT);
    assert_eq!(conn.read(10), b"hi");

    assert_eq!(conn.write(b"ok", WriteFlags::NONE), Ok(2));
    let sent = conn.device_mut().take_sent();
    assert_eq!(ethernet_frame::new_unchecked(&sent[0]).dst_addr(), PEER.hardware_addr);
    let (udp, payload) = sent_udp(&sent[0]).unwrap();
    assert_eq!((udp.src_port, udp.dst_port), (LOCAL_PORT, PEER_PORT));
    assert_eq!(payload, b"ok");
}

#[test]
fn listen_udp_needs_payload() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    conn.device_mut().inject(udp_frame(PEER, PEER_PORT, LOCAL_PORT, b""));

    assert_eq!(conn.listen(LOCAL_PORT, Protocol::Udp), Err(Error::TimedOut));
    assert_eq!(conn.state(), State::Closed);
    assert_eq!(conn.device().released(), 1);
}

#[test]
fn udp_checksums() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    establish(&mut conn, Protocol::Udp);

    let mut corrupted = udp_frame(PEER, PEER_PORT, LOCAL_PORT, b"bad");
    *corrupted.last_mut().unwrap() ^= 0x40;
    conn.device_mut().inject(corrupted);
    assert_eq!(conn.available(), 0);

    // A zero checksum was not computed by the sender.
    let mut unchecked = udp_frame(PEER, PEER_PORT, LOCAL_PORT, b"good");
    unchecked[TRANSPORT_OFFSET + 6] = 0;
    unchecked[TRANSPORT_OFFSET + 7] = 0;
    conn.device_mut().inject(unchecked);
    assert_eq!(conn.available(), 4);
    assert_eq!(conn.read(4), b"good");
}

#[test]
fn answers_ping() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    conn.device_mut().inject(echo_request(0x1234, 7, b"abcdefgh"));
    conn.pump(Duration::from_millis(10));

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    let eth = ethernet_frame::new_unchecked(&sent[0]);
    assert_eq!((eth.src_addr(), eth.dst_addr()), (LOCAL_HW, PEER.hardware_addr));

    let ip = sent_ip(&sent[0]).unwrap();
    assert_eq!((ip.src_addr, ip.dst_addr), (LOCAL_IP, PEER.addr));
    assert_eq!(ip.ident, 0x0102);

    let message = icmpv4_packet::new_checked(&sent[0][TRANSPORT_OFFSET..]).unwrap();
    let reply = Icmpv4Repr::parse(message, Checksum::Manual).unwrap();
    assert_eq!(reply, Icmpv4Repr::EchoReply { ident: 0x1234, seq_no: 7, payload: 8 });
    assert_eq!(message.payload_slice(), b"abcdefgh");
}

#[test]
fn drops_oversized_ping() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    conn.device_mut().inject(echo_request(0x1234, 8, &[0x61; 400]));
    conn.pump(Duration::from_millis(10));

    assert!(conn.device().sent().is_empty());
    assert_eq!(conn.device().released(), 1);
}

#[test]
fn answers_arp_request() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    conn.device_mut().inject(arp_request(PEER, Ipv4Address::new(10, 0, 0, 99)));
    conn.device_mut().inject(arp_request(PEER, LOCAL_IP));
    conn.pump(Duration::from_millis(10));

    let sent = conn.device_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), 42);
    assert_eq!(ethernet_frame::new_unchecked(&sent[0]).dst_addr(), PEER.hardware_addr);
    let reply = sent_arp(&sent[0]).unwrap();
    assert_eq!(reply, ArpRepr {
        operation: ArpOperation::Reply,
        source_hardware_addr: LOCAL_HW,
        source_protocol_addr: LOCAL_IP,
        target_hardware_addr: PEER.hardware_addr,
        target_protocol_addr: PEER.addr,
    });
}

#[test]
fn no_replies_while_writing() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    establish(&mut conn, Protocol::Tcp);

    assert_eq!(conn.write(b"x", WriteFlags::MORE_DATA), Ok(1));
    conn.device_mut().inject(echo_request(1, 1, b""));
    conn.device_mut().inject(arp_request(PEER, LOCAL_IP));

    // Not even polled.
    assert_eq!(conn.available(), 0);
    assert_eq!(conn.device().pending(), 2);

    conn.pump(Duration::from_millis(10));
    assert!(conn.device().sent().is_empty());
    assert_eq!(conn.device().released(), 2);
    assert_eq!(conn.device().outgoing().map(<[u8]>::len), Some(TRANSPORT_OFFSET + TCP_HEADER_LEN + 1));
}

#[test]
fn drops_invalid_frames() {
    let mut rx = [0; 64];
    let mut conn = connection(Simulator::new(), &mut rx);
    establish(&mut conn, Protocol::Tcp);
    let seq = conn.seq;
    let data = segment(LOCAL_PORT, PEER_ISN + 1, seq, TcpFlags::ACK);

    let mut corrupted = tcp_frame(PEER, data, b"abc");
    *corrupted.last_mut().unwrap() ^= 0x01;
    let mut foreign = tcp_frame(PEER, data, b"abc");
    ipv4_packet::new_unchecked_mut(&mut foreign[IP_OFFSET..]).set_dst_addr(Ipv4Address::new(10, 0, 0, 42));
    ipv4_packet::new_unchecked_mut(&mut foreign[IP_OFFSET..]).fill_checksum();
    let mut options = tcp_frame(PEER, data, b"abc");
    ipv4_packet::new_unchecked_mut(&mut options[IP_OFFSET..]).set_header_len(24);
    ipv4_packet::new_unchecked_mut(&mut options[IP_OFFSET..]).fill_checksum();
    let other_port = tcp_frame(PEER, segment(LOCAL_PORT + 1, PEER_ISN + 1, seq, TcpFlags::ACK), b"abc");
    let other_host = tcp_frame(GATEWAY, data, b"abc");

    for frame in vec![vec![0; 1600], corrupted, foreign, options, other_port, other_host] {
        conn.device_mut().inject(frame);
    }

    conn.pump(Duration::from_millis(20));
    assert_eq!(conn.available, 0);
    assert_eq!(conn.ack, PEER_ISN + 1);
    assert!(conn.device().sent().is_empty());
    assert_eq!(conn.device().released(), 6);
}

#[test]
fn offloaded_checksum_matches_software() {
    for &protocol in [Protocol::Tcp, Protocol::Udp].iter() {
        for &len in [0usize, 1, 7, 100].iter() {
            let mut rx = [0; 16];
            let mut conn = connection(Simulator::new(), &mut rx);
            establish(&mut conn, protocol);

            let payload: Vec<u8> = (0..len).map(|i| (i * 37) as u8).collect();
            let payload_offset = TRANSPORT_OFFSET + protocol.header_len();
            conn.device.begin(payload_offset + len);
            conn.device.write(Region::Outgoing, payload_offset, &payload, Source::Ram);
            conn.build_outgoing(len);

            let offloaded = conn.device().outgoing().unwrap().to_vec();
            let mut software = offloaded.clone();
            match protocol {
                Protocol::Tcp => tcp_packet::new_unchecked_mut(&mut software[TRANSPORT_OFFSET..])
                    .fill_checksum(LOCAL_IP, PEER.addr),
                Protocol::Udp => udp_packet::new_unchecked_mut(&mut software[TRANSPORT_OFFSET..])
                    .fill_checksum(LOCAL_IP, PEER.addr),
            }
            assert_eq!(offloaded, software, "{:?} with {} octets", protocol, len);
        }
    }
}

#[test]
fn built_headers_parse_back() {
    let mut rx = [0; 16];
    let mut conn = connection(Simulator::new(), &mut rx);
    establish(&mut conn, Protocol::Tcp);

    conn.build_ethernet(EthernetProtocol::Ipv4);
    conn.build_ip(IpProtocol::Tcp, TCP_HEADER_LEN + 8);
    let header_len = conn.build_tcp(TcpFlags::SYN | TcpFlags::ACK, 0, true, Checksum::Manual);
    assert_eq!(header_len, TCP_HEADER_LEN + 8);

    let frame = &conn.packet[..TRANSPORT_OFFSET + header_len];
    let eth = EthernetRepr::parse(ethernet_frame::new_checked(frame).unwrap()).unwrap();
    assert_eq!(eth, EthernetRepr {
        src_addr: LOCAL_HW,
        dst_addr: PEER.hardware_addr,
        ethertype: EthernetProtocol::Ipv4,
    });

    let (ip, tcp) = sent_tcp(frame).unwrap();
    assert_eq!((ip.src_addr, ip.dst_addr, ip.hop_limit), (LOCAL_IP, PEER.addr, 64));
    assert!(ipv4_packet::new_unchecked(&frame[IP_OFFSET..]).dont_frag());
    assert_eq!(tcp, TcpRepr {
        src_port: LOCAL_PORT,
        dst_port: PEER_PORT,
        seq_number: 0x0001_0000,
        ack_number: PEER_ISN + 1,
        flags: TcpFlags::SYN | TcpFlags::ACK,
        window_len: 536,
        max_seg_size: Some(536),
        payload_len: 0,
    });
}

#[test]
fn reply_ip_recomputes_checksum() {
    let mut rx = [0; 16];
    let mut conn = connection(Simulator::new(), &mut rx);
    let frame = tcp_frame(PEER, segment(LOCAL_PORT, 1, 0, TcpFlags::SYN), b"0123456789");
    conn.packet[..frame.len()].copy_from_slice(&frame);

    conn.reply_ip(Some(TCP_HEADER_LEN));
    let packet = ipv4_packet::new_unchecked(&conn.packet[IP_OFFSET..TRANSPORT_OFFSET]);
    assert!(packet.verify_checksum());
    assert_eq!(packet.total_len() as usize, IPV4_HEADER_LEN + TCP_HEADER_LEN);
    assert_eq!(packet.ident(), 0x0102);
    assert_eq!((packet.src_addr(), packet.dst_addr()), (LOCAL_IP, PEER.addr));
}
