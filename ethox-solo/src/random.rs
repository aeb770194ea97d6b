//! The pseudo-random source.
//!
//! Randomness is only used where the protocols want unpredictability: the initial sequence number
//! of a connection, the identification field of IP packets and the ephemeral local port. None of
//! this needs cryptographic quality.

/// A source of pseudo-random numbers.
pub trait Random {
    /// Produce the next 32 random bits.
    fn next_u32(&mut self) -> u32;

    /// Produce the next 16 random bits.
    fn next_u16(&mut self) -> u16 {
        (self.next_u32() >> 16) as u16
    }
}

/// Xoroshiro256**, yes this is far too good.
#[derive(Copy, Clone, Debug, Hash)]
pub struct Xoroshiro256 {
    state: [u64; 4],
}

impl Xoroshiro256 {
    /// Create a generator from a seed.
    ///
    /// The seed is spread over the full state with splitmix64 so that small seeds, including
    /// zero, still produce a usable sequence.
    pub fn new(seed: u64) -> Self {
        let mut mix = seed;
        let mut state = [0; 4];
        for word in state.iter_mut() {
            mix = mix.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = mix;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            *word = z ^ (z >> 31);
        }
        Xoroshiro256 { state }
    }

    /// Generate the next 64 bits.
    pub fn next(&mut self) -> u64 {
        let s = &mut self.state;
        let result_starstar = s[1]
            .wrapping_mul(5)
            .rotate_left(7)
            .wrapping_mul(9);

        let t = s[1] << 17;

        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];

        s[2] ^= t;

        s[3] = s[3].rotate_left(45);

        result_starstar
    }
}

impl Random for Xoroshiro256 {
    fn next_u32(&mut self) -> u32 {
        // The upper bits have the better quality.
        (self.next() >> 32) as u32
    }
}

impl<R: Random + ?Sized> Random for &'_ mut R {
    fn next_u32(&mut self) -> u32 {
        (**self).next_u32()
    }
}
