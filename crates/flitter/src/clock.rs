//! Musical time: mapping the monotonic clock to beats.

use std::time::Instant;

/// Converts wall-clock seconds to beats under a tempo and quantum.
///
/// `start` is the clock time of beat zero; changing the tempo recomputes it
/// so the current beat is continuous across the change.
#[derive(Debug, Clone)]
pub struct BeatCounter {
    epoch: Instant,
    tempo: f64,
    quantum: u32,
    start: f64,
}

impl BeatCounter {
    pub const DEFAULT_TEMPO: f64 = 120.0;
    pub const DEFAULT_QUANTUM: u32 = 4;

    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            tempo: Self::DEFAULT_TEMPO,
            quantum: Self::DEFAULT_QUANTUM,
            start: 0.0,
        }
    }

    /// Seconds since the counter was created.
    #[must_use]
    pub fn clock(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    #[must_use]
    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    #[must_use]
    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    #[must_use]
    pub fn start(&self) -> f64 {
        self.start
    }

    #[must_use]
    pub fn beat_at_time(&self, clock: f64) -> f64 {
        (clock - self.start) * self.tempo / 60.0
    }

    #[must_use]
    pub fn beat(&self) -> f64 {
        self.beat_at_time(self.clock())
    }

    /// Adopts an explicit tempo/quantum/start triple (a control surface or a
    /// recovered state snapshot).
    pub fn update(&mut self, tempo: f64, quantum: u32, start: f64) {
        if tempo > 0.0 && tempo.is_finite() {
            self.tempo = tempo;
        }
        if quantum >= 1 {
            self.quantum = quantum;
        }
        if start.is_finite() {
            self.start = start;
        }
    }

    /// Changes the tempo, keeping the current beat continuous.
    pub fn set_tempo(&mut self, tempo: f64) {
        if tempo <= 0.0 || !tempo.is_finite() {
            return;
        }
        let now = self.clock();
        let beat = self.beat_at_time(now);
        self.tempo = tempo;
        self.start = now - beat * 60.0 / tempo;
    }
}

impl Default for BeatCounter {
    fn default() -> Self {
        Self::new()
    }
}
