use std::cell::RefCell;
use std::rc::Rc;

use crate::{TimerError, TimerId, TimerQueue, VirtualClock};

/// A device's single pending wake-up on the shared timeline.
///
/// Holds the clock, the machine's shared queue and the token the machine uses to route the
/// event back to the device. Arming replaces any previously armed deadline.
#[derive(Debug, Clone)]
pub struct Alarm<T: Copy> {
    clock: VirtualClock,
    queue: Rc<RefCell<TimerQueue<T>>>,
    owner: T,
    id: Option<TimerId>,
}

impl<T: Copy> Alarm<T> {
    pub fn new(clock: VirtualClock, queue: Rc<RefCell<TimerQueue<T>>>, owner: T) -> Self {
        Self {
            clock,
            queue,
            owner,
            id: None,
        }
    }

    /// An alarm on a private clock and queue, for devices used outside a machine.
    pub fn detached(owner: T) -> Self {
        Self::new(
            VirtualClock::new(),
            Rc::new(RefCell::new(TimerQueue::new())),
            owner,
        )
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    pub fn owner(&self) -> T {
        self.owner
    }

    pub fn arm_at(&mut self, deadline_ns: u64) -> Result<(), TimerError> {
        let now_ns = self.clock.now_ns();
        if deadline_ns < now_ns {
            return Err(TimerError::InPast {
                deadline_ns,
                now_ns,
            });
        }
        self.cancel();
        self.id = Some(self.queue.borrow_mut().schedule(deadline_ns, self.owner));
        Ok(())
    }

    pub fn cancel(&mut self) {
        if let Some(id) = self.id.take() {
            // Already popped by the scheduler when the alarm fired.
            let _ = self.queue.borrow_mut().cancel(id);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.id.is_some_and(|id| self.queue.borrow().contains(id))
    }

    pub fn deadline_ns(&self) -> Option<u64> {
        self.id.and_then(|id| self.queue.borrow().deadline_of(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearming_replaces_the_pending_event() {
        let mut alarm = Alarm::detached(1u8);
        alarm.arm_at(100).unwrap();
        alarm.arm_at(50).unwrap();

        assert_eq!(alarm.deadline_ns(), Some(50));
        assert_eq!(alarm.queue.borrow().len(), 1);
    }

    #[test]
    fn past_deadline_is_rejected() {
        let mut alarm = Alarm::detached(());
        alarm.clock().set_now_ns(10);
        assert_eq!(
            alarm.arm_at(9),
            Err(TimerError::InPast {
                deadline_ns: 9,
                now_ns: 10
            })
        );
        assert!(!alarm.is_armed());
    }

    #[test]
    fn fired_alarm_is_no_longer_armed() {
        let mut alarm = Alarm::detached(());
        alarm.arm_at(5).unwrap();
        assert!(alarm.is_armed());
        alarm.queue.borrow_mut().pop_due(5);
        assert!(!alarm.is_armed());
        alarm.cancel();
    }
}
