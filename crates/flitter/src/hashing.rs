//! Deterministic hashing for values used as cache and state keys.
//!
//! Vector hashes must be stable across processes and runs: they key the
//! shared file cache, seed the pseudo-random sources and appear in state
//! snapshots. The default `Hasher` machinery is randomly keyed, so this
//! module implements SipHash-1-3 with a fixed key instead.

const KEY0: u64 = 0x666c_6974_7465_7221;
const KEY1: u64 = 0x6c69_7665_2d63_6f64;

/// Incremental SipHash-1-3 stream with a fixed key.
///
/// Writers push whole 64-bit lanes; the total lane count is folded into the
/// finalization so that differently-split inputs cannot collide trivially.
pub struct StableHasher {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
    lanes: u64,
}

impl StableHasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            v0: KEY0 ^ 0x736f_6d65_7073_6575,
            v1: KEY1 ^ 0x646f_7261_6e64_6f6d,
            v2: KEY0 ^ 0x6c79_6765_6e65_7261,
            v3: KEY1 ^ 0x7465_6462_7974_6573,
            lanes: 0,
        }
    }

    pub fn write_u64(&mut self, lane: u64) {
        self.lanes = self.lanes.wrapping_add(1);
        self.v3 ^= lane;
        round(&mut self.v0, &mut self.v1, &mut self.v2, &mut self.v3);
        self.v0 ^= lane;
    }

    pub fn write_f64(&mut self, value: f64) {
        // Normalize the two zero representations so -0.0 and 0.0 hash alike.
        let value = if value == 0.0 { 0.0 } else { value };
        self.write_u64(value.to_bits());
    }

    pub fn write_str(&mut self, text: &str) {
        let bytes = text.as_bytes();
        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            let mut lane = [0u8; 8];
            lane.copy_from_slice(chunk);
            self.write_u64(u64::from_le_bytes(lane));
        }
        let mut tail = (bytes.len() as u64) << 56;
        for (index, byte) in chunks.remainder().iter().copied().enumerate() {
            tail |= u64::from(byte) << (index * 8);
        }
        self.write_u64(tail);
    }

    #[must_use]
    pub fn finish(mut self) -> u64 {
        let tail = self.lanes << 56;
        self.v3 ^= tail;
        round(&mut self.v0, &mut self.v1, &mut self.v2, &mut self.v3);
        self.v0 ^= tail;
        self.v2 ^= 0xff;
        round(&mut self.v0, &mut self.v1, &mut self.v2, &mut self.v3);
        round(&mut self.v0, &mut self.v1, &mut self.v2, &mut self.v3);
        round(&mut self.v0, &mut self.v1, &mut self.v2, &mut self.v3);
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// One SipHash round.
fn round(v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64) {
    *v0 = v0.wrapping_add(*v1);
    *v1 = v1.rotate_left(13);
    *v1 ^= *v0;
    *v0 = v0.rotate_left(32);

    *v2 = v2.wrapping_add(*v3);
    *v3 = v3.rotate_left(16);
    *v3 ^= *v2;

    *v0 = v0.wrapping_add(*v3);
    *v3 = v3.rotate_left(21);
    *v3 ^= *v0;

    *v2 = v2.wrapping_add(*v1);
    *v1 = v1.rotate_left(17);
    *v1 ^= *v2;
    *v2 = v2.rotate_left(32);
}

/// Mixes two words into one, for lattice-point and per-index derivations.
#[must_use]
pub fn mix(a: u64, b: u64) -> u64 {
    let mut hasher = StableHasher::new();
    hasher.write_u64(a);
    hasher.write_u64(b);
    hasher.finish()
}
