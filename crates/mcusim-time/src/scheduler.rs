use std::cell::RefCell;
use std::rc::Rc;

use crate::{Alarm, TimerError, TimerQueue, VirtualClock};

/// Owner of the machine timeline.
///
/// Moves the [`VirtualClock`] forward and hands every due event to the caller's dispatch
/// function, with the clock parked at exactly that event's deadline.
#[derive(Debug)]
pub struct Scheduler<T: Copy> {
    clock: VirtualClock,
    queue: Rc<RefCell<TimerQueue<T>>>,
}

impl<T: Copy> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new(VirtualClock::new())
    }
}

impl<T: Copy> Scheduler<T> {
    pub fn new(clock: VirtualClock) -> Self {
        Self {
            clock,
            queue: Rc::new(RefCell::new(TimerQueue::new())),
        }
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn alarm(&self, owner: T) -> Alarm<T> {
        Alarm::new(self.clock.clone(), self.queue.clone(), owner)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.borrow().next_deadline()
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Drops every pending event. Used before restoring a snapshot, after which devices re-arm.
    pub fn clear(&self) {
        self.queue.borrow_mut().clear();
    }

    /// Runs the timeline up to `target_ns`, returning the number of dispatched events.
    ///
    /// Events scheduled by `dispatch` itself are honoured if they fall within `target_ns`.
    pub fn advance_to(
        &self,
        target_ns: u64,
        mut dispatch: impl FnMut(T, u64),
    ) -> Result<usize, TimerError> {
        let now_ns = self.clock.now_ns();
        if target_ns < now_ns {
            return Err(TimerError::InPast {
                deadline_ns: target_ns,
                now_ns,
            });
        }

        let mut fired = 0;
        loop {
            // The borrow must end before dispatch so the device can re-arm.
            let Some(event) = self.queue.borrow_mut().pop_due(target_ns) else {
                break;
            };
            let at_ns = event.deadline_ns.max(self.clock.now_ns());
            self.clock.set_now_ns(at_ns);
            dispatch(event.payload, at_ns);
            fired += 1;
        }
        self.clock.set_now_ns(target_ns);
        Ok(fired)
    }

    pub fn advance_ns(&self, delta_ns: u64, dispatch: impl FnMut(T, u64)) -> usize {
        let target_ns = self.clock.now_ns().saturating_add(delta_ns);
        // Cannot be in the past.
        self.advance_to(target_ns, dispatch).unwrap_or(0)
    }
}
