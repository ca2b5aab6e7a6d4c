use std::cell::Cell;
use std::rc::Rc;

/// Shared monotonic guest clock, in nanoseconds.
///
/// Cloning yields another handle to the same clock. Only the machine's scheduler should move it
/// forward; devices just read it.
#[derive(Clone, Debug, Default)]
pub struct VirtualClock {
    now_ns: Rc<Cell<u64>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.now_ns.get()
    }

    /// Advances the clock by `ns` nanoseconds, saturating at `u64::MAX` (~584 years).
    #[inline]
    pub fn advance_ns(&self, ns: u64) {
        self.now_ns.set(self.now_ns.get().saturating_add(ns));
    }

    /// Sets the current time.
    ///
    /// This may move time backwards; it is meant for the scheduler and for restore paths that
    /// re-base every device afterwards.
    #[inline]
    pub fn set_now_ns(&self, now_ns: u64) {
        self.now_ns.set(now_ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_time() {
        let a = VirtualClock::new();
        let b = a.clone();
        a.advance_ns(10);
        assert_eq!(b.now_ns(), 10);
        b.set_now_ns(3);
        assert_eq!(a.now_ns(), 3);
    }
}
