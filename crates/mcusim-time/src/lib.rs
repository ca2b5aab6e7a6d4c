//! Deterministic virtual time for the peripheral models.
//!
//! All timer peripherals derive their counters from a single [`VirtualClock`] (monotonic
//! nanoseconds of guest time). Future work is expressed as one-shot events in a [`TimerQueue`];
//! the queue stores plain owner tokens rather than callbacks, so it stays trivially
//! re-creatable after a snapshot restore.
//!
//! Devices hold an [`Alarm`] handle. The machine owns the [`Scheduler`] and routes every due
//! event back to its owner with [`Scheduler::advance_to`].

#![forbid(unsafe_code)]

mod alarm;
mod clock;
mod scheduler;
mod timer_queue;

use thiserror::Error;

pub use alarm::Alarm;
pub use clock::VirtualClock;
pub use scheduler::Scheduler;
pub use timer_queue::{TimerEvent, TimerId, TimerQueue};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("deadline {deadline_ns}ns is before the current virtual time {now_ns}ns")]
    InPast { deadline_ns: u64, now_ns: u64 },

    #[error("unknown timer id {0:?}")]
    UnknownTimer(TimerId),
}

/// Converts virtual nanoseconds to whole ticks of a `hz` clock (floor).
pub fn ticks_from_ns(ns: u64, hz: u64) -> u64 {
    ((ns as u128) * (hz as u128) / NANOS_PER_SEC as u128) as u64
}

/// Smallest nanosecond count that covers `ticks` ticks of a `hz` clock (ceil).
pub fn ns_from_ticks_ceil(ticks: u64, hz: u64) -> u64 {
    if hz == 0 {
        return u64::MAX;
    }
    let numer = (ticks as u128) * NANOS_PER_SEC as u128;
    let denom = hz as u128;
    u64::try_from(numer.div_ceil(denom)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tick_conversion_rounds_the_right_way() {
        assert_eq!(ticks_from_ns(999, 1_000_000), 0);
        assert_eq!(ticks_from_ns(1_000, 1_000_000), 1);
        assert_eq!(ns_from_ticks_ceil(1, 3), 333_333_334);
        assert_eq!(ns_from_ticks_ceil(0, 3), 0);
    }

    proptest! {
        #[test]
        fn ceil_ns_always_covers_the_ticks(ticks in 0u64..1 << 40, hz in 1u64..200_000_000) {
            let ns = ns_from_ticks_ceil(ticks, hz);
            prop_assert!(ticks_from_ns(ns, hz) >= ticks);
            if ns > 0 {
                prop_assert!(ticks_from_ns(ns - 1, hz) < ticks);
            }
        }
    }
}
