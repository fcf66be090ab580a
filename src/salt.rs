/// Rotating anonymization salt.
///
/// A fresh 16-bit salt is drawn at every counting-cycle reset, so the same
/// device maps to unrelated ids in consecutive cycles. Zero is a valid salt.

/// A 16-bit anonymization salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Salt(pub u16);

/// Source of random salts.
///
/// Firmware backs this with the chip's hardware RNG; tests use a seeded
/// generator.
pub trait SaltSource {
    fn next_salt(&mut self) -> Salt;
}

/// Owns the current salt and rotates it on demand.
#[derive(Debug, Clone, Copy)]
pub struct SaltManager {
    current: Salt,
}

impl SaltManager {
    pub const fn new(initial: Salt) -> Self {
        Self { current: initial }
    }

    pub fn current(&self) -> Salt {
        self.current
    }

    /// Draw and install a new salt. Only called from the cycle reset.
    pub fn rotate(&mut self, source: &mut impl SaltSource) -> Salt {
        self.current = source.next_salt();
        self.current
    }
}

/// Xorshift32 generator for hosts without a hardware RNG.
///
/// Good enough to decorrelate salts between cycles; not a CSPRNG.
#[derive(Debug, Clone, Copy)]
pub struct XorShiftSalt {
    state: u32,
}

impl XorShiftSalt {
    /// A zero seed would lock the generator at zero, so it is remapped.
    pub const fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9 } else { seed },
        }
    }
}

impl SaltSource for XorShiftSalt {
    fn next_salt(&mut self) -> Salt {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        Salt((x >> 16) as u16)
    }
}
