use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use quanta::Instant;

/// Identifier of a scheduled timer.
pub type TimerId = u64;

/// A job run when its timer fires.
pub type TimerJob = Box<dyn FnMut() + Send>;

/// A timer taken out of the queue to be fired.
pub struct Timer {
    pub id: TimerId,
    pub deadline: Instant,
    period: Option<Duration>,
    pub job: TimerJob,
}

/// Timers ordered by absolute deadline, ties broken by id.
///
/// A timer popped by [`TimerQueue::pop_due`] stays known to the queue until
/// it is handed back with [`TimerQueue::restore`], so that a cancellation
/// issued while its job runs still prevents a periodic reschedule.
#[derive(Default)]
pub struct TimerQueue {
    queue: BTreeMap<(Instant, TimerId), Timer>,
    deadlines: HashMap<TimerId, Option<Instant>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `job` at `deadline`, then every `period` if given.
    pub fn insert(&mut self, id: TimerId, deadline: Instant, period: Option<Duration>, job: TimerJob) {
        let period = period.map(|p| p.max(Duration::from_micros(1)));
        self.deadlines.insert(id, Some(deadline));
        self.queue.insert(
            (deadline, id),
            Timer {
                id,
                deadline,
                period,
                job,
            },
        );
    }

    /// Cancel a timer. Return whether it was still scheduled or firing.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(Some(deadline)) => self.queue.remove(&(deadline, id)).is_some(),
            Some(None) => true,
            None => false,
        }
    }

    #[inline]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Take the earliest timer if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Timer> {
        let (&(deadline, id), _) = self.queue.first_key_value()?;
        if deadline > now {
            return None;
        }
        let timer = self.queue.remove(&(deadline, id))?;
        self.deadlines.insert(id, None);
        Some(timer)
    }

    /// Hand back a fired timer: periodic timers that were not cancelled are
    /// rescheduled after `now`, the others are forgotten.
    pub fn restore(&mut self, mut timer: Timer, now: Instant) {
        let alive = self.deadlines.get(&timer.id).is_some_and(Option::is_none);
        match timer.period {
            Some(period) if alive => {
                let mut next = timer.deadline + period;
                if next <= now {
                    next = now + period;
                }
                timer.deadline = next;
                self.deadlines.insert(timer.id, Some(next));
                self.queue.insert((next, timer.id), timer);
            }
            _ => {
                if alive {
                    self.deadlines.remove(&timer.id);
                }
            }
        }
    }

    /// Number of scheduled timers.
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<u64>>>, tag: u64) -> TimerJob {
        let log = log.clone();
        Box::new(move || log.lock().unwrap().push(tag))
    }

    fn fire_all(q: &mut TimerQueue, now: Instant) {
        while let Some(mut t) = q.pop_due(now) {
            (t.job)();
            q.restore(t, now);
        }
    }

    #[test]
    fn fire_in_deadline_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut q = TimerQueue::new();
        let t0 = Instant::now();
        q.insert(1, t0 + Duration::from_millis(30), None, recorder(&log, 30));
        q.insert(2, t0 + Duration::from_millis(10), None, recorder(&log, 10));
        q.insert(3, t0 + Duration::from_millis(20), None, recorder(&log, 20));
        q.insert(4, t0 + Duration::from_millis(50), None, recorder(&log, 50));
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_millis(10)));

        assert!(q.cancel(3));
        assert!(!q.cancel(3));
        fire_all(&mut q, t0 + Duration::from_millis(40));
        assert_eq!(*log.lock().unwrap(), vec![10, 30]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn periodic_timer_reschedules_until_cancelled() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut q = TimerQueue::new();
        let t0 = Instant::now();
        let period = Duration::from_millis(10);
        q.insert(7, t0 + period, Some(period), recorder(&log, 7));

        fire_all(&mut q, t0 + Duration::from_millis(15));
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_millis(20)));
        fire_all(&mut q, t0 + Duration::from_millis(25));
        assert_eq!(log.lock().unwrap().len(), 2);

        // Cancelled while firing: not rescheduled.
        let now = t0 + Duration::from_millis(30);
        let mut t = q.pop_due(now).unwrap();
        (t.job)();
        assert!(q.cancel(7));
        q.restore(t, now);
        assert!(q.is_empty());
        assert!(!q.cancel(7));
    }
}
