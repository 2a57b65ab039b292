//! Monotonic nanosecond clock shared by every producer of a capture.
//!
//! Timestamps come from `CLOCK_MONOTONIC` so they are comparable with those
//! recorded by the kernel tracer and by the Orbit API inside the target.

#![allow(unsafe_code)] // clock_gettime() requires unsafe

use log::info;
use std::time::{SystemTime, UNIX_EPOCH};

/// Back-to-back reads used for the resolution estimate
const RESOLUTION_SAMPLES: usize = 1_000;

/// Current value of the monotonic clock in nanoseconds.
#[must_use]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret != 0 {
        return 0;
    }
    let secs = u64::try_from(ts.tv_sec).unwrap_or(0);
    let nanos = u64::try_from(ts.tv_nsec).unwrap_or(0);
    secs.saturating_mul(1_000_000_000).saturating_add(nanos)
}

/// Wall-clock time in nanoseconds since the Unix epoch, for display only.
#[must_use]
pub fn unix_time_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

/// Estimate the resolution of [`now_ns`].
///
/// Takes the minimum non-zero delta over many back-to-back reads. Returns 0
/// if no two reads ever differed, which only happens on a broken clock.
#[must_use]
pub fn estimate_resolution_ns() -> u64 {
    estimate_resolution_with(now_ns, RESOLUTION_SAMPLES)
}

fn estimate_resolution_with(mut read: impl FnMut() -> u64, samples: usize) -> u64 {
    let mut min_delta = u64::MAX;
    let mut previous = read();
    for _ in 0..samples {
        let current = read();
        let delta = current.saturating_sub(previous);
        if delta > 0 && delta < min_delta {
            min_delta = delta;
        }
        previous = current;
    }
    if min_delta == u64::MAX {
        0
    } else {
        min_delta
    }
}

/// Estimate the clock resolution once and log it.
#[must_use]
pub fn estimate_and_log_resolution_ns() -> u64 {
    let resolution_ns = estimate_resolution_ns();
    info!("Clock resolution: {resolution_ns} (ns)");
    resolution_ns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_is_non_decreasing() {
        let mut previous = now_ns();
        for _ in 0..10_000 {
            let current = now_ns();
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn test_resolution_is_minimum_non_zero_delta() {
        let readings = [100, 100, 130, 135, 135, 200, 207];
        let mut iter = readings.into_iter();
        let resolution = estimate_resolution_with(|| iter.next().unwrap_or(207), readings.len() - 1);
        assert_eq!(resolution, 5);
    }

    #[test]
    fn test_resolution_of_frozen_clock_is_zero() {
        assert_eq!(estimate_resolution_with(|| 42, 100), 0);
    }

    #[test]
    fn test_real_clock_has_resolution() {
        assert!(estimate_resolution_ns() > 0);
    }
}
