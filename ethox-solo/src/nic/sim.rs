//! A software simulated Ethernet controller.
//!
//! Frames handed to the simulator are delivered in order by [`Device::poll`]. Every transmitted
//! frame is recorded and may be answered by a scripted peer, whose answers are queued for
//! reception. Together with a [`StepClock`] this runs the stack deterministically.
//!
//! [`Device::poll`]: ../trait.Device.html#tymethod.poll
//! [`StepClock`]: struct.StepClock.html
use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::time::{Clock, Duration, Instant};
use crate::wire::checksum;
use super::{Device, Region, Source};

/// The other end of the link, answering each transmitted frame with any number of frames.
pub type Peer = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>>>;

/// A simulated controller.
#[derive(Default)]
pub struct Simulator {
    inbound: VecDeque<Vec<u8>>,
    received: Option<Vec<u8>>,
    outgoing: Option<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    peer: Option<Peer>,
    released: usize,
    persistent_writes: usize,
}

/// A clock advancing by a fixed step every time it is queried.
#[derive(Clone, Copy, Debug)]
pub struct StepClock {
    now: Instant,
    step: Duration,
}

impl Simulator {
    /// Create a simulator without a peer.
    pub fn new() -> Self {
        Simulator::default()
    }

    /// Create a simulator whose transmissions are answered by `peer`.
    pub fn with_peer<F>(peer: F) -> Self
        where F: FnMut(&[u8]) -> Vec<Vec<u8>> + 'static
    {
        let mut sim = Simulator::default();
        sim.set_peer(peer);
        sim
    }

    /// Replace the peer.
    pub fn set_peer<F>(&mut self, peer: F)
        where F: FnMut(&[u8]) -> Vec<Vec<u8>> + 'static
    {
        self.peer = Some(Box::new(peer));
    }

    /// Remove the peer, transmissions go unanswered afterwards.
    pub fn clear_peer(&mut self) {
        self.peer = None;
    }

    /// Queue a frame for reception.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.inbound.push_back(frame);
    }

    /// The number of frames not yet polled.
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    /// All frames transmitted so far, oldest first.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Take the record of transmitted frames, leaving it empty.
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        core::mem::replace(&mut self.sent, Vec::new())
    }

    /// How many received frames were given back.
    pub fn released(&self) -> usize {
        self.released
    }

    /// How many writes declared persistent memory as their source.
    pub fn persistent_writes(&self) -> usize {
        self.persistent_writes
    }

    /// The current outgoing frame.
    pub fn outgoing(&self) -> Option<&[u8]> {
        self.outgoing.as_ref().map(Vec::as_slice)
    }

    /// # Panics
    /// This function panics if the region holds no frame.
    fn frame_mut(&mut self, region: Region) -> &mut Vec<u8> {
        let frame = match region {
            Region::Received => self.received.as_mut(),
            Region::Outgoing => self.outgoing.as_mut(),
        };

        match frame {
            Some(frame) => frame,
            None => panic!("no {:?} frame", region),
        }
    }
}

impl Device for Simulator {
    fn poll(&mut self) -> Option<usize> {
        self.received = self.inbound.pop_front();
        self.received.as_ref().map(Vec::len)
    }

    fn release(&mut self) {
        if self.received.take().is_some() {
            self.released += 1;
        }
    }

    fn begin(&mut self, len: usize) {
        self.outgoing = Some(vec![0; len]);
    }

    fn set_len(&mut self, len: usize) {
        if let Some(frame) = self.outgoing.as_mut() {
            frame.resize(len, 0);
        }
    }

    fn transmit(&mut self) -> Result<()> {
        let frame = self.outgoing.clone().ok_or(Error::Illegal)?;
        if let Some(peer) = self.peer.as_mut() {
            let answers = peer(&frame);
            self.inbound.extend(answers);
        }
        self.sent.push(frame);
        Ok(())
    }

    fn read(&mut self, region: Region, offset: usize, buf: &mut [u8]) {
        let frame = self.frame_mut(region);
        buf.copy_from_slice(&frame[offset..offset + buf.len()]);
    }

    fn write(&mut self, region: Region, offset: usize, data: &[u8], source: Source) {
        if source == Source::Persistent {
            self.persistent_writes += 1;
        }
        let frame = self.frame_mut(region);
        frame[offset..offset + data.len()].copy_from_slice(data);
    }

    fn checksum(&mut self, region: Region, offset: usize, len: usize) -> u16 {
        let frame = self.frame_mut(region);
        checksum::compute(&frame[offset..offset + len])
    }
}

impl StepClock {
    /// Create a clock starting at zero.
    pub fn new(step: Duration) -> Self {
        StepClock::starting_at(Instant::from_millis(0), step)
    }

    /// Create a clock starting at some point in time.
    pub fn starting_at(now: Instant, step: Duration) -> Self {
        StepClock { now, step }
    }

    /// The time the next query will return, without advancing.
    pub fn peek(&self) -> Instant {
        self.now
    }
}

impl Clock for StepClock {
    fn now(&mut self) -> Instant {
        let now = self.now;
        self.now += self.step;
        now
    }
}
