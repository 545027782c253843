//! Time control and random number generation for the virtual network.

use std::time::{Duration, Instant};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::scheduler::SchedulerError;

/// Deterministic clock for simulation time control.
///
/// Time only moves when the scheduler dispatches an event or the caller
/// explicitly advances it, and is independent of wall-clock time.
#[derive(Debug, Clone)]
pub struct DeterministicClock {
    current_time: Instant,
    start_time: Instant,
}

impl Default for DeterministicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DeterministicClock {
    /// Creates new deterministic clock starting at simulation time zero.
    pub fn new() -> Self {
        let start = Instant::now();
        Self {
            current_time: start,
            start_time: start,
        }
    }

    /// Returns current simulation time.
    pub fn now(&self) -> Instant {
        self.current_time
    }

    /// Returns the instant simulation time zero maps to.
    pub fn start(&self) -> Instant {
        self.start_time
    }

    /// Returns elapsed time since simulation start.
    pub fn elapsed(&self) -> Duration {
        self.current_time.duration_since(self.start_time)
    }

    /// Advances simulation time to specific instant.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidEventScheduling` - If target time is in the past
    pub fn advance_to(&mut self, target: Instant) -> Result<(), SchedulerError> {
        if target < self.current_time {
            return Err(SchedulerError::InvalidEventScheduling {
                reason: "Cannot advance time backwards".to_string(),
            });
        }
        self.current_time = target;
        Ok(())
    }
}

/// Deterministic random number generator for reproducible simulations.
///
/// Uses the ChaCha8 algorithm so that loss decisions and latency samples
/// are identical across runs with the same seed.
#[derive(Debug)]
pub struct DeterministicRng {
    rng: ChaCha8Rng,
    seed: u64,
}

impl DeterministicRng {
    /// Creates deterministic RNG from seed value.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Returns the seed used for this RNG.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generates random number in range [0, 1).
    pub fn random_f64(&mut self) -> f64 {
        // 53 random mantissa bits keep the result strictly below 1.0
        (self.rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Generates random number in range [min, max).
    pub fn random_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        min + (self.rng.next_u64() % (max - min))
    }

    /// Generates random boolean with given probability.
    pub fn random_bool(&mut self, probability: f64) -> bool {
        self.random_f64() < probability
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advance_to() {
        let mut clock = DeterministicClock::new();
        let start = clock.now();

        clock.advance_to(start + Duration::from_millis(250)).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
        assert_eq!(clock.start(), start);

        // Advancing to the current instant is allowed
        clock.advance_to(clock.now()).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[test]
    fn test_clock_cannot_go_backwards() {
        let mut clock = DeterministicClock::new();
        clock
            .advance_to(clock.now() + Duration::from_secs(10))
            .unwrap();

        let past = clock.now() - Duration::from_secs(5);
        let result = clock.advance_to(past);

        assert!(matches!(
            result,
            Err(SchedulerError::InvalidEventScheduling { .. })
        ));
    }

    #[test]
    fn test_deterministic_rng_reproducibility() {
        let seed = 12345;
        let mut rng1 = DeterministicRng::from_seed(seed);
        let mut rng2 = DeterministicRng::from_seed(seed);

        let values1: Vec<u64> = (0..10).map(|_| rng1.random_range(0, 100)).collect();
        let values2: Vec<u64> = (0..10).map(|_| rng2.random_range(0, 100)).collect();

        assert_eq!(values1, values2);
        assert_eq!(rng1.seed(), seed);
    }

    #[test]
    fn test_rng_bool_extremes() {
        let mut rng = DeterministicRng::from_seed(7);

        for _ in 0..1000 {
            assert!(rng.random_bool(1.0));
            assert!(!rng.random_bool(0.0));
            let value = rng.random_f64();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_random_range_degenerate() {
        let mut rng = DeterministicRng::from_seed(1);
        assert_eq!(rng.random_range(5, 5), 5);
        assert_eq!(rng.random_range(9, 3), 9);
    }
}
