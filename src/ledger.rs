//! Ticket ledger: turns each visit into one step of a prepaid ticket.
//!
//! Per (customer, course) a ticket moves `NONE -> OPEN -> COMPLETED`.
//! Completion is terminal; the next visit opens a fresh ticket.
//!
//! Two mechanisms keep the ledger consistent:
//! - a keyed lock serializes the read-modify-write for one
//!   (customer, course) pair while other pairs proceed untouched;
//! - the ticket write, open-ticket index and visit insert share one sled
//!   transaction, run on a blocking task that finishes even if the
//!   caller goes away.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::models::{Course, Record, Ticket, Visit};
use crate::storage::Storage;

/// One lock per key, created on demand and dropped once nobody holds it.
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Wait for exclusive access to `key`. The guard is owned, so it can
    /// move into a blocking task.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(key).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Input for one visit registration.
#[derive(Debug, Clone)]
pub struct VisitRequest {
    pub customer_id: u64,
    pub course_id: u64,
    pub store_id: u64,
    /// If given, must name the ticket this visit will consume.
    pub ticket_id: Option<u64>,
    pub memo: String,
}

/// Result of a consumed visit.
#[derive(Debug, Clone)]
pub struct Consumption {
    /// Ticket state after this visit.
    pub ticket: Ticket,
    pub visit: Visit,
    /// Position of this visit within the ticket (1-based).
    pub sequence: u32,
}

pub struct TicketLedger {
    storage: Storage,
    locks: KeyedLocks<(u64, u64)>,
}

impl TicketLedger {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            locks: KeyedLocks::default(),
        }
    }

    /// Record one visit against the open ticket for the pair, opening a
    /// new ticket first if there is none. A course of another store counts
    /// as not found.
    pub async fn consume_visit(&self, request: VisitRequest) -> Result<Consumption, LedgerError> {
        let course = self
            .storage
            .find_by_id::<Course>(request.course_id)?
            .filter(|course| course.store_id == request.store_id)
            .ok_or(LedgerError::CourseNotFound(request.course_id))?;

        let guard = self
            .locks
            .lock((request.customer_id, request.course_id))
            .await;
        let storage = self.storage.clone();

        let consumption = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            record_visit(&storage, &course, &request)
        })
        .await
        .map_err(|e| LedgerError::Interrupted(e.to_string()))??;

        if consumption.ticket.is_completed {
            info!(
                ticket_id = consumption.ticket.record.id,
                current = consumption.ticket.current_count,
                total = consumption.ticket.total_count,
                "ticket completed"
            );
        } else {
            debug!(
                ticket_id = consumption.ticket.record.id,
                current = consumption.ticket.current_count,
                total = consumption.ticket.total_count,
                "ticket advanced"
            );
        }
        Ok(consumption)
    }

    #[cfg(test)]
    fn locks(&self) -> &KeyedLocks<(u64, u64)> {
        &self.locks
    }
}

/// Fresh ticket for a pair, seeded from the course.
fn open_ticket_for(course: &Course, request: &VisitRequest) -> Ticket {
    Ticket {
        record: Record::default(),
        customer_id: request.customer_id,
        course_id: request.course_id,
        store_id: request.store_id,
        total_count: course.total_count.max(1),
        current_count: 0,
        is_completed: false,
    }
}

/// Count one visit on `ticket`. Completion never reverts.
pub fn advance(mut ticket: Ticket) -> Ticket {
    debug_assert!(!ticket.is_completed);
    ticket.current_count = ticket.current_count.saturating_add(1).min(ticket.total_count);
    if ticket.current_count >= ticket.total_count {
        ticket.is_completed = true;
    }
    ticket
}

fn record_visit(
    storage: &Storage,
    course: &Course,
    request: &VisitRequest,
) -> Result<Consumption, LedgerError> {
    let outcome: Result<Consumption, LedgerError> = storage.ticket_transaction(|tx| {
        let open = tx.open_ticket(request.customer_id, request.course_id)?;

        // Checked before any write, so the empty transaction commits harmlessly.
        if let Some(given) = request.ticket_id {
            if open.as_ref().map(|t| t.record.id) != Some(given) {
                return Ok(Err(LedgerError::TicketMismatch { given }));
            }
        }

        let mut ticket = advance(open.unwrap_or_else(|| open_ticket_for(course, request)));
        tx.save_ticket(&mut ticket)?;

        let mut visit = Visit {
            record: Record::default(),
            customer_id: request.customer_id,
            course_id: request.course_id,
            ticket_id: Some(ticket.record.id),
            visit_count: ticket.current_count,
            store_id: request.store_id,
            memo: request.memo.clone(),
        };
        tx.insert_visit(&mut visit)?;

        Ok(Ok(Consumption {
            sequence: ticket.current_count,
            ticket,
            visit,
        }))
    })
    .map_err(LedgerError::from)?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup(total: u32) -> (Storage, Arc<TicketLedger>, u64) {
        let storage = Storage::temporary().unwrap();
        let course = storage
            .create(Course {
                record: Record::default(),
                name: "Facial x3".to_string(),
                price: 30000,
                total_count: total,
                store_id: 1,
            })
            .unwrap();
        let ledger = Arc::new(TicketLedger::new(storage.clone()));
        (storage, ledger, course.record.id)
    }

    fn visit(customer_id: u64, course_id: u64) -> VisitRequest {
        VisitRequest {
            customer_id,
            course_id,
            store_id: 1,
            ticket_id: None,
            memo: String::new(),
        }
    }

    #[tokio::test]
    async fn sequential_visits_complete_then_reopen() {
        let (storage, ledger, course_id) = setup(3);

        let mut seen = vec![];
        for _ in 0..4 {
            let c = ledger.consume_visit(visit(1, course_id)).await.unwrap();
            seen.push((c.ticket.record.id, c.sequence, c.ticket.is_completed));
        }

        assert_eq!(seen[0].1, 1);
        assert_eq!(seen[1].1, 2);
        assert_eq!(seen[2].1, 3);
        assert!(!seen[0].2 && !seen[1].2 && seen[2].2);
        assert_eq!(seen[0].0, seen[2].0);

        // Fourth visit starts a fresh ticket.
        assert_ne!(seen[3].0, seen[0].0);
        assert_eq!(seen[3].1, 1);
        assert!(!seen[3].2);

        let tickets = storage.list::<Ticket>().unwrap();
        assert_eq!(tickets.len(), 2);
        let old = tickets.iter().find(|t| t.record.id == seen[0].0).unwrap();
        assert!(old.is_completed);
        assert_eq!(old.current_count, 3);
        assert_eq!(storage.list::<Visit>().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn visit_records_point_at_their_ticket() {
        let (storage, ledger, course_id) = setup(2);
        let first = ledger.consume_visit(visit(9, course_id)).await.unwrap();
        assert_eq!(first.visit.ticket_id, Some(first.ticket.record.id));
        assert_eq!(first.visit.visit_count, 1);

        let stored = storage.find_by_id::<Visit>(first.visit.record.id).unwrap().unwrap();
        assert_eq!(stored, first.visit);
    }

    #[tokio::test]
    async fn single_use_course_completes_immediately() {
        let (_, ledger, course_id) = setup(1);
        let c = ledger.consume_visit(visit(1, course_id)).await.unwrap();
        assert!(c.ticket.is_completed);
        assert_eq!(c.ticket.current_count, 1);

        let next = ledger.consume_visit(visit(1, course_id)).await.unwrap();
        assert_ne!(next.ticket.record.id, c.ticket.record.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_visits_share_one_ticket() {
        let (storage, ledger, course_id) = setup(3);

        let (a, b) = tokio::join!(
            {
                let ledger = ledger.clone();
                async move { ledger.consume_visit(visit(1, course_id)).await }
            },
            {
                let ledger = ledger.clone();
                async move { ledger.consume_visit(visit(1, course_id)).await }
            }
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.ticket.record.id, b.ticket.record.id);
        let mut seqs = vec![a.sequence, b.sequence];
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2]);

        let tickets = storage.list::<Ticket>().unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].current_count, 2);
        assert!(!tickets[0].is_completed);
        assert_eq!(storage.list::<Visit>().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_concurrent_visits_fill_tickets_in_order() {
        let (storage, ledger, course_id) = setup(5);

        let calls = (0..12).map(|_| {
            let ledger = ledger.clone();
            async move { ledger.consume_visit(visit(2, course_id)).await }
        });
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let tickets = storage.list::<Ticket>().unwrap();
        assert_eq!(tickets.len(), 3);
        assert_eq!(tickets.iter().filter(|t| t.is_completed).count(), 2);
        for t in &tickets {
            assert!(t.current_count <= t.total_count);
            assert_eq!(t.is_completed, t.current_count >= t.total_count);
        }
        let open: Vec<_> = tickets.iter().filter(|t| !t.is_completed).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].current_count, 2);

        // Per ticket, the visit sequence numbers are exactly 1..=current_count.
        let visits = storage.list::<Visit>().unwrap();
        for t in &tickets {
            let mut seqs: Vec<u32> = visits
                .iter()
                .filter(|v| v.ticket_id == Some(t.record.id))
                .map(|v| v.visit_count)
                .collect();
            seqs.sort_unstable();
            assert_eq!(seqs, (1..=t.current_count).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn unknown_course_writes_nothing() {
        let (storage, ledger, _) = setup(3);
        let err = ledger.consume_visit(visit(1, 4242)).await.unwrap_err();
        assert!(matches!(err, LedgerError::CourseNotFound(4242)));
        assert!(storage.list::<Ticket>().unwrap().is_empty());
        assert!(storage.list::<Visit>().unwrap().is_empty());
    }

    #[tokio::test]
    async fn course_of_another_store_writes_nothing() {
        let (storage, ledger, course_id) = setup(3);
        let mut elsewhere = visit(1, course_id);
        elsewhere.store_id = 2;
        let err = ledger.consume_visit(elsewhere).await.unwrap_err();
        assert!(matches!(err, LedgerError::CourseNotFound(id) if id == course_id));
        assert!(storage.list::<Ticket>().unwrap().is_empty());
        assert!(storage.list::<Visit>().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mismatched_ticket_id_is_rejected_without_writes() {
        let (storage, ledger, course_id) = setup(3);
        let first = ledger.consume_visit(visit(1, course_id)).await.unwrap();

        let mut wrong = visit(1, course_id);
        wrong.ticket_id = Some(first.ticket.record.id + 100);
        let err = ledger.consume_visit(wrong).await.unwrap_err();
        assert!(matches!(err, LedgerError::TicketMismatch { .. }));

        let mut right = visit(1, course_id);
        right.ticket_id = Some(first.ticket.record.id);
        let second = ledger.consume_visit(right).await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(storage.list::<Visit>().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn course_total_is_copied_at_open_time() {
        let (storage, ledger, course_id) = setup(3);
        ledger.consume_visit(visit(1, course_id)).await.unwrap();

        let mut course = storage.find_by_id::<Course>(course_id).unwrap().unwrap();
        course.total_count = 10;
        storage.update(&mut course).unwrap();

        let c = ledger.consume_visit(visit(1, course_id)).await.unwrap();
        assert_eq!(c.ticket.total_count, 3);
    }

    #[test]
    fn advance_completes_at_total() {
        let ticket = Ticket {
            record: Record::default(),
            customer_id: 1,
            course_id: 1,
            store_id: 1,
            total_count: 2,
            current_count: 1,
            is_completed: false,
        };
        let done = advance(ticket);
        assert_eq!(done.current_count, 2);
        assert!(done.is_completed);
    }

    #[tokio::test]
    async fn unrelated_keys_do_not_contend() {
        let locks = KeyedLocks::<(u64, u64)>::default();
        let _held = locks.lock((1, 1)).await;
        let other = tokio::time::timeout(Duration::from_millis(200), locks.lock((1, 2))).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock((1, 1))).await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn released_keys_are_pruned() {
        let (_, ledger, course_id) = setup(3);
        for customer in 1..=5 {
            ledger.consume_visit(visit(customer, course_id)).await.unwrap();
        }
        // Only the most recent key can still be tracked.
        assert!(ledger.locks().tracked() <= 1);
    }
}
