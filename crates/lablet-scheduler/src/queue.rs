//! Reservation queue: ordered backlog of unplaced reservations.
//!
//! Ordered by priority (0 first), then timeslot start, then arrival.
//! Re-queuing a reservation that is already waiting keeps its place.

use std::collections::{BTreeMap, HashMap};

use lablet_core::{InstanceId, Reservation, ReservationId};

type QueueKey = (u32, u64, u64);

/// A reservation waiting for capacity, with the PENDING instance that
/// will carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedReservation {
    pub reservation: Reservation,
    pub instance_id: InstanceId,
    pub queued_at: u64,
}

#[derive(Debug, Default)]
pub struct ReservationQueue {
    entries: BTreeMap<QueueKey, QueuedReservation>,
    index: HashMap<ReservationId, QueueKey>,
    next_seq: u64,
}

impl ReservationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue; returns false if the reservation was already queued.
    pub fn push(&mut self, entry: QueuedReservation) -> bool {
        if self.index.contains_key(&entry.reservation.id) {
            return false;
        }
        let key = (
            entry.reservation.priority,
            entry.reservation.timeslot.start,
            self.next_seq,
        );
        self.next_seq += 1;
        self.index.insert(entry.reservation.id.clone(), key);
        self.entries.insert(key, entry);
        true
    }

    pub fn remove(&mut self, reservation_id: &str) -> Option<QueuedReservation> {
        let key = self.index.remove(reservation_id)?;
        self.entries.remove(&key)
    }

    pub fn contains(&self, reservation_id: &str) -> bool {
        self.index.contains_key(reservation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in service order.
    pub fn snapshot(&self) -> Vec<QueuedReservation> {
        self.entries.values().cloned().collect()
    }

    /// Remove and return entries whose timeslot has ended.
    pub fn drain_expired(&mut self, now: u64) -> Vec<QueuedReservation> {
        let expired: Vec<ReservationId> = self
            .entries
            .values()
            .filter(|e| e.reservation.timeslot.end <= now)
            .map(|e| e.reservation.id.clone())
            .collect();
        expired.iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lablet_core::{DefinitionRef, Timeslot};

    fn entry(id: &str, priority: u32, start: u64) -> QueuedReservation {
        QueuedReservation {
            reservation: Reservation {
                id: id.to_string(),
                definition: DefinitionRef::new("ccna", semver::Version::new(1, 0, 0)),
                timeslot: Timeslot::new(start, start + 3600),
                owner_id: "alice".to_string(),
                priority,
                warm_lab: None,
            },
            instance_id: format!("inst-{id}"),
            queued_at: 0,
        }
    }

    fn order(queue: &ReservationQueue) -> Vec<String> {
        queue
            .snapshot()
            .into_iter()
            .map(|e| e.reservation.id)
            .collect()
    }

    #[test]
    fn ordered_by_priority_then_start_then_arrival() {
        let mut queue = ReservationQueue::new();
        queue.push(entry("late", 1, 5000));
        queue.push(entry("urgent", 0, 9000));
        queue.push(entry("early", 1, 1000));
        queue.push(entry("early-2", 1, 1000));

        assert_eq!(order(&queue), vec!["urgent", "early", "early-2", "late"]);
    }

    #[test]
    fn requeue_keeps_position() {
        let mut queue = ReservationQueue::new();
        queue.push(entry("a", 1, 1000));
        queue.push(entry("b", 1, 1000));
        assert!(!queue.push(entry("a", 1, 1000)));
        assert_eq!(order(&queue), vec!["a", "b"]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn remove_by_reservation_id() {
        let mut queue = ReservationQueue::new();
        queue.push(entry("a", 1, 1000));
        assert_eq!(queue.remove("a").unwrap().instance_id, "inst-a");
        assert!(queue.remove("a").is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_expired_by_timeslot_end() {
        let mut queue = ReservationQueue::new();
        queue.push(entry("old", 0, 0)); // ends at 3600
        queue.push(entry("new", 0, 10_000));

        let expired = queue.drain_expired(3600);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reservation.id, "old");
        assert!(!queue.contains("old"));
        assert!(queue.contains("new"));
    }
}
