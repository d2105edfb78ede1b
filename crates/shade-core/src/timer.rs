use std::time::{Duration, Instant};

/// Monotonic TSC timer used for call ordering and checkpoint pacing.
///
/// On x86_64 reads the time-stamp counter directly and calibrates it against
/// the OS clock once at construction; elsewhere it falls back to `Instant`
/// nanoseconds, keeping tick arithmetic identical.
#[derive(Debug, Clone)]
pub struct TscTimer {
    ticks_per_us: f64,
    origin: Instant,
}

impl TscTimer {
    pub fn new() -> Self {
        let origin = Instant::now();

        #[cfg(target_arch = "x86_64")]
        {
            let t0 = Instant::now();
            let c0 = Self::raw_tick();
            std::thread::sleep(Duration::from_millis(10));
            let c1 = Self::raw_tick();
            let elapsed_us = t0.elapsed().as_micros().max(1) as f64;
            let ticks_per_us = (c1.wrapping_sub(c0)) as f64 / elapsed_us;
            Self { ticks_per_us, origin }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            // 1 tick == 1 ns
            Self { ticks_per_us: 1000.0, origin }
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[inline]
    fn raw_tick() -> u64 {
        // SAFETY: rdtsc has no preconditions
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    /// Current tick value.
    #[inline]
    pub fn now(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            Self::raw_tick()
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            self.origin.elapsed().as_nanos() as u64
        }
    }

    /// Convert a duration in microseconds to ticks.
    #[inline]
    pub fn us_to_ticks(&self, us: u64) -> u64 {
        (us as f64 * self.ticks_per_us) as u64
    }

    /// Convert a duration in milliseconds to ticks.
    #[inline]
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        self.us_to_ticks(ms * 1000)
    }

    /// Convert ticks back to microseconds.
    #[inline]
    pub fn ticks_to_us(&self, ticks: u64) -> u64 {
        (ticks as f64 / self.ticks_per_us) as u64
    }
}

impl Default for TscTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let t = TscTimer::new();
        let a = t.now();
        let b = t.now();
        assert!(b >= a);
    }

    #[test]
    fn conversion_round_trip() {
        let t = TscTimer::new();
        let ticks = t.ms_to_ticks(5);
        let us = t.ticks_to_us(ticks);
        assert!((4_500..=5_500).contains(&us), "got {us}us");
    }
}
