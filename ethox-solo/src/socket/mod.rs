//! The connection.
//!
//! A [`Connection`] is the whole stack above the device. It owns the packet buffer, borrows the
//! receive storage and drives exactly one TCP or UDP conversation at a time:
//!
//! ```text
//!   Closed --connect--> ResolvingPeer --ARP reply--> Handshaking --SYN+ACK--> Established
//!   Closed --listen---> Listening --------SYN or first datagram-------------> Established
//!   Established --close, RST, FIN or exhausted retries--> Closed
//! ```
//!
//! Every operation that waits does so by running the dispatch loop for a bounded time. The loop
//! reads one frame at a time into the packet buffer, answers ARP requests and pings on the way
//! and feeds everything else to the state machine. Nothing is processed between calls.
//!
//! Only one written segment is ever in flight. Sequence numbers are therefore compared for
//! equality, never by modular ordering.
//!
//! [`Connection`]: struct.Connection.html
use core::{fmt, ops};

use crate::error::{Error, Result};
use crate::nic::{Device, Region, Source};
use crate::random::Random;
use crate::time::{Clock, Duration};
use crate::wire::{EthernetAddress, IpProtocol, Ipv4Address};
use crate::wire::{ETHERNET_HEADER_LEN, IPV4_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN};

mod arp;
mod build;
mod dispatch;

#[cfg(test)]
mod tests;

/// The capacity of the packet buffer.
///
/// Received frames are read into the buffer up to this length, which is plenty for every header
/// the stack looks at.
pub const PACKET_BUFFER_LEN: usize = 160;

/// The longest frame the stack will assemble, without the frame check sequence.
pub const MAX_FRAME_LEN: usize = 1514;

/// Received frames reported longer than this are dropped unread.
pub const MAX_RECEIVE_LEN: usize = 1500;

const IP_OFFSET: usize = ETHERNET_HEADER_LEN;
const TRANSPORT_OFFSET: usize = IP_OFFSET + IPV4_HEADER_LEN;

/// The state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Waiting for a peer to open the connection.
    Listening,
    /// Looking up the hardware address of the peer or the gateway towards it.
    ResolvingPeer,
    /// The hardware address is known, the handshake is in progress.
    Handshaking,
    /// Data may be exchanged.
    Established,
    /// No connection.
    Closed,
}

/// The transport protocol of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// A TCP stream.
    Tcp,
    /// UDP datagrams, without handshake or acknowledgement.
    Udp,
}

/// Timeouts and protocol parameters of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Config {
    /// How long `listen` waits for a peer.
    pub connection_timeout: Duration,
    /// How long each ARP request, SYN and data segment waits for its answer.
    pub request_timeout: Duration,
    /// How long `available` looks for pending frames.
    pub poll_timeout: Duration,
    /// Attempts made for address resolution, handshake and each data segment.
    pub retries: u8,
    /// The time-to-live of outgoing packets.
    pub hop_limit: u8,
    /// The advertised TCP window, also announced as maximum segment size.
    pub window: u16,
}

/// Options of a single `write`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WriteFlags(pub u8);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Local {
    hardware_addr: EthernetAddress,
    addr: Ipv4Address,
    prefix_len: u8,
    gateway: Ipv4Address,
    port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Peer {
    hardware_addr: EthernetAddress,
    addr: Ipv4Address,
    port: u16,
}

/// The single connection of the stack.
///
/// Generic over the controller, the millisecond clock and the random source. The receive storage
/// is borrowed for the lifetime of the connection and bounds how many received bytes can be
/// buffered before the application reads them.
pub struct Connection<'a, D, C, R> {
    device: D,
    clock: C,
    random: R,
    config: Config,

    /// Headers of the frame being built or of the last frame received.
    packet: [u8; PACKET_BUFFER_LEN],
    rx: &'a mut [u8],
    /// Number of valid bytes at the front of `rx`.
    available: usize,
    /// End of the outgoing frame while a write is being assembled, zero otherwise.
    tx_offset: usize,

    local: Local,
    peer: Peer,
    /// The address resolved for the peer, its own or the gateway's.
    next_hop: Ipv4Address,
    protocol: Protocol,
    state: State,

    seq: u32,
    seq_adv: u32,
    ack: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connection_timeout: Duration::from_millis(30_000),
            request_timeout: Duration::from_millis(3_000),
            poll_timeout: Duration::from_millis(1),
            retries: 3,
            hop_limit: 64,
            window: 536,
        }
    }
}

impl WriteFlags {
    /// No options, transmit immediately.
    pub const NONE: WriteFlags = WriteFlags(0);
    /// The data resides in persistent memory, see `nic::Source`.
    pub const PERSISTENT: WriteFlags = WriteFlags(0x1);
    /// More data for the same segment follows in another call.
    pub const MORE_DATA: WriteFlags = WriteFlags(0x2);

    /// Check if all flags in `other` are set.
    pub fn contains(self, other: WriteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for WriteFlags {
    type Output = WriteFlags;

    fn bitor(self, rhs: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 | rhs.0)
    }
}

impl Protocol {
    fn header_len(self) -> usize {
        match self {
            Protocol::Tcp => TCP_HEADER_LEN,
            Protocol::Udp => UDP_HEADER_LEN,
        }
    }
}

impl From<Protocol> for IpProtocol {
    fn from(protocol: Protocol) -> IpProtocol {
        match protocol {
            Protocol::Tcp => IpProtocol::Tcp,
            Protocol::Udp => IpProtocol::Udp,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Listening => write!(f, "LISTEN"),
            State::ResolvingPeer => write!(f, "RESOLVING"),
            State::Handshaking => write!(f, "SYN-SENT"),
            State::Established => write!(f, "ESTABLISHED"),
            State::Closed => write!(f, "CLOSED"),
        }
    }
}

impl Peer {
    const NONE: Peer = Peer {
        hardware_addr: EthernetAddress::UNSPECIFIED,
        addr: Ipv4Address::UNSPECIFIED,
        port: 0,
    };
}

impl<'a, D: Device, C: Clock, R: Random> Connection<'a, D, C, R> {
    /// Create a closed connection with the default configuration.
    ///
    /// The identity must be configured with [`setup`] before use.
    ///
    /// [`setup`]: #method.setup
    pub fn new(device: D, clock: C, random: R, rx: &'a mut [u8]) -> Self {
        Connection::with_config(device, clock, random, rx, Config::default())
    }

    /// Create a closed connection.
    pub fn with_config(device: D, clock: C, random: R, rx: &'a mut [u8], config: Config) -> Self {
        Connection {
            device,
            clock,
            random,
            config,
            packet: [0; PACKET_BUFFER_LEN],
            rx,
            available: 0,
            tx_offset: 0,
            local: Local {
                hardware_addr: EthernetAddress::UNSPECIFIED,
                addr: Ipv4Address::UNSPECIFIED,
                prefix_len: 32,
                gateway: Ipv4Address::UNSPECIFIED,
                port: 0,
            },
            peer: Peer::NONE,
            next_hop: Ipv4Address::UNSPECIFIED,
            protocol: Protocol::Tcp,
            state: State::Closed,
            seq: 0,
            seq_adv: 0,
            ack: 0,
        }
    }

    /// Configure the local identity and close the connection.
    ///
    /// Peers outside of `addr/prefix_len` are reached through `gateway`. A prefix longer than 32
    /// is treated as 32.
    pub fn setup(
        &mut self,
        addr: Ipv4Address,
        hardware_addr: EthernetAddress,
        prefix_len: u8,
        gateway: Ipv4Address,
    ) {
        self.local = Local {
            hardware_addr,
            addr,
            prefix_len: prefix_len.min(32),
            gateway,
            port: 0,
        };
        self.peer = Peer::NONE;
        self.tx_offset = 0;
        self.state = State::Closed;
        net_debug!("socket: setup {} {}/{} via {}", hardware_addr, addr, prefix_len, gateway);
    }

    /// Wait for a peer to connect to the local `port`.
    ///
    /// For TCP the connection is established by a SYN to the port, for UDP by the first non-empty
    /// datagram. Returns the address of the peer, or `Error::TimedOut` when none arrived within
    /// the connection timeout.
    pub fn listen(&mut self, port: u16, protocol: Protocol) -> Result<Ipv4Address> {
        self.reset(protocol);
        self.local.port = port;
        self.set_state(State::Listening);

        self.pump(self.config.connection_timeout);

        if self.state == State::Established {
            Ok(self.peer.addr)
        } else {
            self.close();
            Err(Error::TimedOut)
        }
    }

    /// Open a connection to `addr:port` from a random local port.
    ///
    /// Resolves the hardware address of the peer, or of the gateway when the peer is outside of
    /// the local network, and performs the handshake. Each phase is attempted the configured
    /// number of times. Fails with `Error::Unreachable` when the address could not be resolved
    /// and with `Error::TimedOut` when the handshake was not answered, the connection is closed
    /// in both cases.
    pub fn connect(&mut self, addr: Ipv4Address, port: u16, protocol: Protocol) -> Result<()> {
        self.reset(protocol);
        self.local.port = self.ephemeral_port();
        self.peer = Peer { addr, port, ..Peer::NONE };
        self.next_hop = if self.local.addr.same_subnet(addr, self.local.prefix_len) {
            addr
        } else {
            self.local.gateway
        };
        self.set_state(State::ResolvingPeer);

        for attempt in 0..self.config.retries {
            if self.state != State::ResolvingPeer {
                break;
            }
            net_debug!("socket: who-has {} (attempt {})", self.next_hop, attempt + 1);
            if let Err(err) = self.request_hardware_addr(self.next_hop) {
                self.close();
                return Err(err);
            }
            self.pump(self.config.request_timeout);
        }

        if self.state != State::Handshaking {
            self.close();
            return Err(Error::Unreachable);
        }

        if protocol == Protocol::Udp {
            self.set_state(State::Established);
            return Ok(());
        }

        for attempt in 0..self.config.retries {
            if self.state != State::Handshaking {
                break;
            }
            net_debug!("socket: SYN to {}:{} (attempt {})", addr, port, attempt + 1);
            if let Err(err) = self.send_syn() {
                self.close();
                return Err(err);
            }
            self.pump(self.config.request_timeout);
        }

        if self.state == State::Established {
            Ok(())
        } else {
            self.close();
            Err(Error::TimedOut)
        }
    }

    /// Process pending frames and return the number of buffered bytes.
    ///
    /// Closes the connection if it is no longer established. Buffered bytes remain readable.
    pub fn available(&mut self) -> usize {
        // The device holds a partially written segment, replies would overwrite it.
        if self.tx_offset == 0 {
            self.pump(self.config.poll_timeout);
        }

        if self.state != State::Established {
            self.close();
        }

        self.available
    }

    /// Read up to `max_len` buffered bytes.
    ///
    /// At most a packet buffer full of bytes is returned at once, the view stays valid until the
    /// next operation on the connection.
    pub fn read(&mut self, max_len: usize) -> &[u8] {
        let available = self.available();
        let len = max_len.min(PACKET_BUFFER_LEN).min(available);

        self.packet[..len].copy_from_slice(&self.rx[..len]);
        self.rx.copy_within(len..available, 0);
        self.available -= len;

        &self.packet[..len]
    }

    /// Send data to the peer.
    ///
    /// With `WriteFlags::MORE_DATA` the data is only appended to the outgoing segment. Otherwise
    /// the segment is completed and transmitted, a TCP segment is retried until acknowledged.
    /// Data exceeding the maximum frame is cut off and the segment sent immediately. Returns the
    /// number of bytes taken from `data`.
    ///
    /// Fails with `Error::NotEstablished` without a connection. When the segment was not
    /// acknowledged the connection is closed and `Error::TimedOut` returned, when the peer closed
    /// it in the meantime `Error::Closed`.
    pub fn write(&mut self, data: &[u8], flags: WriteFlags) -> Result<usize> {
        if self.state != State::Established {
            return Err(Error::NotEstablished);
        }

        if self.tx_offset == 0 {
            self.tx_offset = TRANSPORT_OFFSET + self.protocol.header_len();
            self.device.begin(self.tx_offset);
        }

        let mut more_data = flags.contains(WriteFlags::MORE_DATA);
        let room = MAX_FRAME_LEN - self.tx_offset;
        let len = if data.len() > room {
            more_data = false;
            room
        } else {
            data.len()
        };

        if len > 0 {
            let source = if flags.contains(WriteFlags::PERSISTENT) {
                Source::Persistent
            } else {
                Source::Ram
            };
            self.device.set_len(self.tx_offset + len);
            self.device.write(Region::Outgoing, self.tx_offset, &data[..len], source);
            self.tx_offset += len;
        }

        if more_data {
            return Ok(len);
        }

        self.transmit_segment()?;
        Ok(len)
    }

    /// Discard all buffered bytes.
    pub fn flush(&mut self) {
        self.available = 0;
    }

    /// Close the connection.
    ///
    /// An established TCP connection is reset. Closing a closed connection has no effect besides
    /// clearing the peer.
    pub fn close(&mut self) {
        if self.state == State::Established && self.protocol == Protocol::Tcp {
            if let Err(err) = self.send_reset() {
                net_debug!("socket: could not send reset: {}", err);
            }
        }

        self.set_state(State::Closed);
        self.peer = Peer::NONE;
        self.tx_offset = 0;
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The address of the peer, unspecified while there is none.
    pub fn peer_addr(&self) -> Ipv4Address {
        self.peer.addr
    }

    /// The port of the peer, zero while there is none.
    pub fn peer_port(&self) -> u16 {
        self.peer.port
    }

    /// The local port of the current or last connection.
    pub fn local_port(&self) -> u16 {
        self.local.port
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The underlying device, mutably.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Complete the outgoing segment and transmit it until acknowledged.
    fn transmit_segment(&mut self) -> Result<()> {
        let header_len = self.protocol.header_len();
        let segment_len = self.tx_offset - TRANSPORT_OFFSET;
        let payload_len = segment_len - header_len;

        self.build_outgoing(payload_len);
        self.seq_adv = payload_len as u32;

        let mut result = Err(Error::TimedOut);
        for attempt in 0..self.config.retries {
            if self.state != State::Established {
                break;
            }
            if attempt > 0 {
                net_debug!("socket: retransmitting {} octets (attempt {})", payload_len, attempt + 1);
            }
            if let Err(err) = self.device.transmit() {
                result = Err(err);
                break;
            }
            if self.protocol == Protocol::Udp {
                result = Ok(());
                break;
            }

            let initial_seq = self.seq;
            self.pump(self.config.request_timeout);
            if self.seq == initial_seq.wrapping_add(self.seq_adv) {
                result = Ok(());
                break;
            }
        }

        self.tx_offset = 0;
        self.seq_adv = 0;

        if self.state != State::Established {
            result = Err(Error::Closed);
        }

        if result.is_err() {
            self.close();
        }

        result
    }

    /// Clear all state of a previous connection.
    fn reset(&mut self, protocol: Protocol) {
        self.protocol = protocol;
        self.peer = Peer::NONE;
        self.next_hop = Ipv4Address::UNSPECIFIED;
        self.seq = 0;
        self.seq_adv = 0;
        self.ack = 0;
        self.available = 0;
        self.tx_offset = 0;
    }

    fn ephemeral_port(&mut self) -> u16 {
        // Ports below 1024 are reserved.
        match self.random.next_u16() {
            port if port < 1024 => port + 1024,
            port => port,
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            net_debug!("socket: {} -> {}", self.state, state);
        }
        self.state = state;
    }
}
