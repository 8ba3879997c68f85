use core::hash::BuildHasher;
use core::sync::atomic::{AtomicU64, Ordering};

use std::hash::RandomState;

// -----------------------------------------------------------------------------
// XorShift64Star

const UNSEEDED_STATE: u64 = 0xc1f651c67c62c6e0;

/// [xorshift*] generator used for victim selection when stealing.
///
/// Statistical quality barely matters here; what matters is that victim
/// choice is cheap and roughly uniform. Weak seeding is tolerated as long
/// as the state is never zero.
///
/// [xorshift*]: https://en.wikipedia.org/wiki/Xorshift#xorshift*
pub(crate) struct XorShift64Star {
    state: u64,
}

impl XorShift64Star {
    /// A generator with a fixed non-zero seed, usable from constant context.
    ///
    /// Threads that never bind to a scheduler keep this state; bound workers
    /// call [`reseed`](Self::reseed) so their victim sequences diverge.
    #[inline(always)]
    pub const fn unseeded() -> Self {
        Self { state: UNSEEDED_STATE }
    }

    /// Re-seeds from the hash of a global counter.
    ///
    /// Any non-zero value will do; looping guards against the astronomically
    /// unlikely zero hash.
    pub fn reseed(&mut self) {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let rs = RandomState::new();
        let mut seed = 0;
        while seed == 0 {
            seed = rs.hash_one(COUNTER.fetch_add(1, Ordering::Relaxed));
        }

        self.state = seed;
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        debug_assert_ne!(x, 0);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Returns a value in `0..n`. `n` must be non-zero.
    #[inline]
    pub fn next_bounded(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        (self.next() % n as u64) as usize
    }
}

// -----------------------------------------------------------------------------
// Tests
