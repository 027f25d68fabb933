//! Randomised scheduling so a fleet of agents does not announce in lockstep.

use std::time::Duration;

use rand::Rng;

/// Jitter is bounded to this fraction (1/N) of the base period.
pub const JITTER_DIVISOR: u32 = 10;

/// Half the announce TTL, so a record is refreshed before it expires.
pub fn default_announce_period(announce_ttl: Duration) -> Duration {
    announce_ttl / 2
}

/// A uniformly random duration in `[0, max]`.
pub fn random_duration(max: Duration) -> Duration {
    let max_nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if max_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..=max_nanos))
}

/// `base` plus a random delay of at most `base / 10`.
pub fn jittered(base: Duration) -> Duration {
    base + random_duration(base / JITTER_DIVISOR)
}
