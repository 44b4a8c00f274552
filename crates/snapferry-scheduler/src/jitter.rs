//! Interval randomization so that several schedulers sharing a storage
//! backend do not fire in lockstep.

use rand::Rng;
use std::time::Duration;

/// Randomizes `base` uniformly within ±50 %.
///
/// A zero interval stays zero.
pub fn randomize(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    if millis < 2 {
        return base;
    }
    let half = millis / 2;
    Duration::from_millis(rand::thread_rng().gen_range(millis - half..=millis + half))
}

/// Initial delay of send worker `id` (1-based) among `workers`, so the
/// workers spread evenly over one interval.
pub fn stagger(interval: Duration, workers: usize, id: usize) -> Duration {
    if workers == 0 || id <= 1 {
        return Duration::ZERO;
    }
    interval / workers as u32 * (id - 1) as u32
}
