//! Debounced commit scheduling
//!
//! One pending slot per widget id. Every notification pushes the slot's
//! deadline out by the quiet window; the slot is taken when the deadline
//! passes or when the gesture ends. Time is passed in, never read here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    deadline: Instant,
    /// Notifications coalesced into this slot
    coalesced: u32,
}

#[derive(Debug)]
pub struct CommitScheduler {
    quiet: Duration,
    slots: HashMap<String, Slot>,
}

impl CommitScheduler {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            slots: HashMap::new(),
        }
    }

    pub fn quiet_window(&self) -> Duration {
        self.quiet
    }

    /// Record a change; overwrites any pending slot for the id
    pub fn notify(&mut self, id: &str, now: Instant) {
        let deadline = now + self.quiet;
        self.slots
            .entry(id.to_string())
            .and_modify(|slot| {
                slot.deadline = deadline;
                slot.coalesced += 1;
            })
            .or_insert(Slot {
                deadline,
                coalesced: 1,
            });
    }

    /// Take the slot regardless of its deadline; true if a write was pending
    pub fn flush_now(&mut self, id: &str) -> bool {
        match self.slots.remove(id) {
            Some(slot) => {
                tracing::debug!("Flushing {} ({} changes coalesced)", id, slot.coalesced);
                true
            }
            None => false,
        }
    }

    /// Drop a pending write without performing it
    pub fn cancel(&mut self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    /// Move a pending slot to a new id (synthetic-id migration)
    pub fn rekey(&mut self, from: &str, to: &str) {
        if let Some(slot) = self.slots.remove(from) {
            let entry = self.slots.entry(to.to_string()).or_insert(slot);
            entry.deadline = entry.deadline.max(slot.deadline);
        }
    }

    /// Take every slot whose deadline has passed, in deadline order
    pub fn poll_due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<(Instant, String)> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(id, slot)| (slot.deadline, id.clone()))
            .collect();
        due.sort();
        for (_, id) in &due {
            self.slots.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Take everything (shutdown)
    pub fn drain(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().map(|slot| slot.deadline).min()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIET: Duration = Duration::from_millis(600);

    #[test]
    fn test_notifications_coalesce_into_one_slot() {
        let mut scheduler = CommitScheduler::new(QUIET);
        let start = Instant::now();
        for i in 0..50 {
            scheduler.notify("light.a", start + Duration::from_millis(i * 2));
        }
        assert_eq!(scheduler.len(), 1);
        assert_eq!(
            scheduler.next_deadline(),
            Some(start + Duration::from_millis(98) + QUIET)
        );

        assert!(scheduler.poll_due(start + Duration::from_millis(650)).is_empty());
        assert_eq!(
            scheduler.poll_due(start + Duration::from_millis(700)),
            vec!["light.a".to_string()]
        );
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_flush_now_supersedes_timer() {
        let mut scheduler = CommitScheduler::new(QUIET);
        let start = Instant::now();
        scheduler.notify("light.a", start);

        assert!(scheduler.flush_now("light.a"));
        assert!(!scheduler.flush_now("light.a"));
        assert!(scheduler.poll_due(start + QUIET * 2).is_empty());
    }

    #[test]
    fn test_ids_are_independent() {
        let mut scheduler = CommitScheduler::new(QUIET);
        let start = Instant::now();
        scheduler.notify("a", start);
        scheduler.notify("b", start + Duration::from_millis(500));

        assert_eq!(scheduler.poll_due(start + QUIET), vec!["a".to_string()]);
        assert!(scheduler.is_pending("b"));
        assert!(scheduler.cancel("b"));
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn test_rekey_moves_pending_slot() {
        let mut scheduler = CommitScheduler::new(QUIET);
        let start = Instant::now();
        scheduler.notify("-42", start);
        scheduler.rekey("-42", "sensor.a");
        assert!(!scheduler.is_pending("-42"));
        assert!(scheduler.is_pending("sensor.a"));
        assert_eq!(scheduler.drain(), vec!["sensor.a".to_string()]);
    }
}
