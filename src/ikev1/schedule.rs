use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EventId(u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Event<T> {
    deadline: Instant,
    created: Instant,
    task: T,
}

/// Deadline-ordered timer queue.
/// Cancelled events stay in the heap and are skipped when they reach the top.
pub struct Scheduler<T> {
    deadlines: BinaryHeap<Reverse<(Instant, EventId)>>,
    events: HashMap<EventId, Event<T>>,
    next_id: u64,
}

pub struct EventSnapshot<T> {
    pub id: EventId,
    pub remaining: Duration,
    pub deadline: Instant,
    pub created: Instant,
    pub task: T,
}

impl<T> Scheduler<T> {
    pub fn new() -> Scheduler<T> {
        Scheduler {
            deadlines: BinaryHeap::new(),
            events: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn schedule(&mut self, now: Instant, delay: Duration, task: T) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        let deadline = now + delay;
        self.deadlines.push(Reverse((deadline, id)));
        self.events.insert(
            id,
            Event {
                deadline,
                created: now,
                task,
            },
        );
        id
    }

    /// Cancels an event; returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.events.remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn is_pending(&self, id: EventId) -> bool {
        self.events.contains_key(&id)
    }

    /// Removes and returns the earliest event whose deadline has passed.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(EventId, T)> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if !self.events.contains_key(&id) {
                self.deadlines.pop();
                continue;
            }
            if deadline > now {
                return None;
            }
            self.deadlines.pop();
            return self.events.remove(&id).map(|event| (id, event.task));
        }
        None
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.events.contains_key(&id) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.events.clear();
    }

    pub fn snapshot(&self, now: Instant) -> Vec<EventSnapshot<T>>
    where
        T: Clone,
    {
        let mut result = self
            .events
            .iter()
            .map(|(id, event)| EventSnapshot {
                id: *id,
                remaining: event.deadline.saturating_duration_since(now),
                deadline: event.deadline,
                created: event.created,
                task: event.task.clone(),
            })
            .collect::<Vec<_>>();
        result.sort_by_key(|event| (event.deadline, event.id));
        result
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.schedule(now, Duration::from_secs(3), "c");
        scheduler.schedule(now, Duration::from_secs(1), "a");
        scheduler.schedule(now, Duration::from_secs(2), "b");
        assert_eq!(scheduler.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(scheduler.pop_expired(now).is_none());

        let later = now + Duration::from_secs(5);
        let fired = std::iter::from_fn(|| scheduler.pop_expired(later))
            .map(|(_, task)| task)
            .collect::<Vec<_>>();
        assert_eq!(fired, vec!["a", "b", "c"]);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn cancelled_events_are_skipped() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        let first = scheduler.schedule(now, Duration::from_secs(1), 1);
        scheduler.schedule(now, Duration::from_secs(2), 2);
        assert!(scheduler.cancel(first));
        assert!(!scheduler.cancel(first));
        assert!(!scheduler.is_pending(first));
        assert_eq!(scheduler.next_deadline(), Some(now + Duration::from_secs(2)));
        let later = now + Duration::from_secs(2);
        assert_eq!(scheduler.pop_expired(later).map(|(_, task)| task), Some(2));
        assert!(scheduler.pop_expired(later).is_none());
    }

    #[test]
    fn events_scheduled_while_firing() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.schedule(now, Duration::ZERO, 1);
        let (_, task) = scheduler.pop_expired(now).unwrap();
        assert_eq!(task, 1);
        // A callback re-arming itself for later doesn't fire in the same pass.
        let rearmed = scheduler.schedule(now, Duration::from_secs(1), 2);
        assert!(scheduler.pop_expired(now).is_none());
        assert!(scheduler.is_pending(rearmed));
    }

    #[test]
    fn snapshot_reports_remaining_time() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.schedule(now, Duration::from_secs(10), "retransmit");
        scheduler.schedule(now, Duration::from_secs(4), "expire");
        let snapshot = scheduler.snapshot(now + Duration::from_secs(1));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].task, "expire");
        assert_eq!(snapshot[0].remaining, Duration::from_secs(3));
        assert_eq!(snapshot[1].created, now);
    }
}
