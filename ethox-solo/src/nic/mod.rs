//! Encapsulates a discrete Ethernet controller.
//!
//! The controller keeps frames in its own memory. The stack never sees a received frame as a
//! whole, it reads the parts it needs into its packet buffer and asks the controller to move or
//! checksum the rest. Outgoing frames are assembled in controller memory as well, which is what
//! allows an application to write a segment in several pieces.
//!
//! Also permits software emulation of such a controller, see [`sim`] (with feature `std`).
//!
//! [`sim`]: sim/index.html
use crate::error::Result;

#[cfg(any(feature = "std", test))]
pub mod sim;

/// One of the two frames a device exposes to the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Region {
    /// The frame returned by the last successful [`Device::poll`].
    ///
    /// [`Device::poll`]: trait.Device.html#tymethod.poll
    Received,

    /// The frame started with the last [`Device::begin`].
    ///
    /// [`Device::begin`]: trait.Device.html#tymethod.begin
    Outgoing,
}

/// Where data written into a frame resides on the host.
///
/// Microcontrollers commonly keep constant data in a separate address space that must be read
/// with dedicated instructions. The device has to know which one it is copying from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// Ordinary memory.
    Ram,
    /// Program or other persistent memory.
    Persistent,
}

/// A network interface holding one received and one outgoing frame.
///
/// All offsets are relative to the start of the Ethernet header of the respective frame. The
/// stack never addresses memory outside the current length of a frame, an implementation may
/// panic if it does.
pub trait Device {
    /// Check for a newly received frame and return its length.
    ///
    /// The frame becomes the [`Region::Received`] until it is [released]. A device that still
    /// holds an unreleased frame may discard it.
    ///
    /// [`Region::Received`]: enum.Region.html#variant.Received
    /// [released]: #tymethod.release
    fn poll(&mut self) -> Option<usize>;

    /// Give the received frame back to the device.
    fn release(&mut self);

    /// Start a new outgoing frame of the given length, discarding the previous one.
    ///
    /// The content of the new frame is unspecified until written.
    fn begin(&mut self, len: usize);

    /// Change the length of the outgoing frame, preserving its content.
    fn set_len(&mut self, len: usize);

    /// Queue the outgoing frame for transmission.
    ///
    /// The frame stays in place and may be transmitted again. Fails with `Error::Illegal` when
    /// no outgoing frame was begun.
    fn transmit(&mut self) -> Result<()>;

    /// Copy bytes out of a frame.
    fn read(&mut self, region: Region, offset: usize, buf: &mut [u8]);

    /// Copy bytes into a frame.
    fn write(&mut self, region: Region, offset: usize, data: &[u8], source: Source);

    /// Compute the Internet checksum over a range of a frame.
    ///
    /// Returns the complemented one's complement sum, i.e. the value to be placed in a checksum
    /// field when the field itself was zero within the range.
    fn checksum(&mut self, region: Region, offset: usize, len: usize) -> u16;

    /// Replace the outgoing frame and transmit it.
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.begin(frame.len());
        self.write(Region::Outgoing, 0, frame, Source::Ram);
        self.transmit()
    }
}
