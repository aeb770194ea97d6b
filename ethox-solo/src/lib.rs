//! A single-connection TCP/IP stack for resource constrained devices.
//!
//! ## Table of contents
//!
//! 1. [Design](#design)
//! 2. [The wire module](wire/index.html)
//! 3. [Network interfaces](nic/index.html)
//! 4. [The socket](socket/index.html)
//!
//! ## Design
//!
//! The stack is built for a microcontroller with a few kilobytes of memory talking to a discrete
//! Ethernet controller over a byte oriented bus. The controller owns the frame memory, the stack
//! only ever holds the headers of one frame at a time in a small packet buffer. Everything else,
//! payload of outgoing segments included, stays in device memory and is addressed through the
//! [`Device`] trait.
//!
//! There is exactly one [`Connection`]. It resolves the hardware address of its peer, performs
//! the TCP handshake (or skips it for UDP), moves data in both directions with one segment in
//! flight and tears down again. In between it answers ARP requests and pings addressed to it.
//! Reception is polling only, every wait is bounded by a wall clock timeout measured with an
//! injected [`Clock`].
//!
//! Nothing within `ethox-solo` dynamically allocates memory. The receive storage is passed in on
//! construction, the packet buffer is a fixed array within the connection.
//!
//! [`Device`]: nic/trait.Device.html
//! [`Connection`]: socket/struct.Connection.html
//! [`Clock`]: time/trait.Clock.html
#![warn(missing_docs)]
#![warn(unreachable_pub)]

// tests should be able to use `std`
#![cfg_attr(all(
    not(feature = "std"),
    not(test)),
no_std)]

#[macro_use] mod macros;
pub mod error;
pub mod nic;
pub mod random;
pub mod socket;
pub mod time;
pub mod wire;

pub use self::error::{Error, Result};
pub use self::socket::{Config, Connection, Protocol, State, WriteFlags};
