//! The Internet checksum.
//!
//! All functions work on the one's complement sum *without* the final complement unless noted
//! otherwise, so that partial sums over separate ranges can be combined. A header carries the
//! complement of the sum over all its covered octets, and a correct header therefore sums to
//! `0xffff` including its checksum field.
use byteorder::{ByteOrder, NetworkEndian};

use super::{IpProtocol, Ipv4Address};

fn propagate_carries(word: u32) -> u16 {
    let sum = (word >> 16) + (word & 0xffff);
    ((sum >> 16) as u16) + (sum as u16)
}

/// Compute an RFC 1071 compliant checksum (without the final complement).
///
/// An odd trailing octet is treated as the high octet of a zero padded word.
pub fn data(mut data: &[u8]) -> u16 {
    let mut accum = 0;

    // For each 32-byte chunk...
    const CHUNK_SIZE: usize = 32;
    while data.len() >= CHUNK_SIZE {
        let mut d = &data[..CHUNK_SIZE];
        // ... take by 2 bytes and sum them.
        while d.len() >= 2 {
            accum += NetworkEndian::read_u16(d) as u32;
            d = &d[2..];
        }

        data = &data[CHUNK_SIZE..];
    }

    // Sum the rest that does not fit the last 32-byte chunk,
    // taking by 2 bytes.
    while data.len() >= 2 {
        accum += NetworkEndian::read_u16(data) as u32;
        data = &data[2..];
    }

    // Add the last remaining odd byte, if any.
    if let Some(&value) = data.first() {
        accum += (value as u32) << 8;
    }

    propagate_carries(accum)
}

/// Combine several RFC 1071 compliant checksums.
///
/// Each part must have started at an even offset of the complete range.
pub fn combine(checksums: &[u16]) -> u16 {
    let mut accum: u32 = 0;
    for &word in checksums {
        accum += word as u32;
    }
    propagate_carries(accum)
}

/// Compute an IPv4 pseudo header checksum.
pub fn pseudo_header(
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    protocol: IpProtocol,
    length: u16,
) -> u16 {
    let mut proto_len = [0u8; 4];
    proto_len[1] = protocol.into();
    NetworkEndian::write_u16(&mut proto_len[2..4], length);

    combine(&[
        data(src_addr.as_bytes()),
        data(dst_addr.as_bytes()),
        data(&proto_len[..])
    ])
}

/// Compute the value to place into a checksum field covering `bytes`.
///
/// The field itself must be zero within `bytes`.
pub fn compute(bytes: &[u8]) -> u16 {
    !data(bytes)
}

/// Check that a range including its checksum field is consistent.
pub fn verify(bytes: &[u8]) -> bool {
    data(bytes) == !0
}

/// Incrementally update a checksum field after one 16-bit word changed.
///
/// Implements equation 3 of RFC 1624, `HC' = ~(~HC + ~m + m')`, which unlike the earlier
/// RFC 1141 formulation never produces a `-0` for a header that could not sum to it.
pub fn update(old_checksum: u16, old_word: u16, new_word: u16) -> u16 {
    !combine(&[!old_checksum, !old_word, new_word])
}
