//! In-flight commands awaiting an agent reply.
//!
//! Each submitted command owns one entry in [`PendingTable`], keyed by its
//! correlation id. An entry is finished exactly once, either by a reply
//! ([`PendingTable::resolve_once`]) or by eviction
//! ([`PendingTable::evict_if_unresolved`], [`PendingTable::evict_expired`]).
//! Finishing removes the entry and consumes its one-shot sender inside the
//! same critical section, so the reply path and the timeout path can never
//! both act on one request.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use vibrant_core::{BrokerError, ClientId, CommandKind, CommandPayload, CommandResult, RequestId};

/// Caller-side handle for one submitted command.
///
/// Holds the receiving half of the result slot. Dropping it abandons the
/// wait; the table entry is still cleaned up by its deadline.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    client_id: ClientId,
    kind: CommandKind,
    created_at: DateTime<Utc>,
    deadline: Instant,
    pub(crate) slot: oneshot::Receiver<CommandResult>,
}

impl PendingRequest {
    /// Build a handle and the table entry that will resolve it.
    pub fn new(client_id: ClientId, payload: CommandPayload, ttl: Duration) -> (Self, PendingEntry) {
        let id = RequestId::for_client(&client_id);
        let (tx, rx) = oneshot::channel();
        let created_at = Utc::now();
        let deadline = Instant::now() + ttl;
        let kind = payload.kind();

        let entry = PendingEntry {
            id: id.clone(),
            client_id: client_id.clone(),
            payload,
            created_at,
            deadline,
            slot: tx,
        };
        let request = Self {
            id,
            client_id,
            kind,
            created_at,
            deadline,
            slot: rx,
        };
        (request, entry)
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Reaper deadline assigned at submit. Awaiting may extend the table's copy.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Table-side record of an unresolved command.
#[derive(Debug)]
pub struct PendingEntry {
    id: RequestId,
    client_id: ClientId,
    payload: CommandPayload,
    created_at: DateTime<Utc>,
    deadline: Instant,
    slot: oneshot::Sender<CommandResult>,
}

impl PendingEntry {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn payload(&self) -> &CommandPayload {
        &self.payload
    }

    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// An entry removed because its deadline passed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpiredRequest {
    pub id: RequestId,
    pub client_id: ClientId,
    pub kind: CommandKind,
}

/// What [`PendingTable::resolve_once`] did with a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Resolved,
    /// No entry: unknown, already resolved, or evicted.
    Unknown,
    /// The reply answers a different command kind; the entry is untouched.
    KindMismatch { expected: CommandKind },
}

impl Resolution {
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Resolved)
    }
}

/// Correlation id → unresolved command, behind a single mutex.
///
/// Critical sections are map operations plus a non-blocking one-shot send.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: PendingEntry) -> Result<(), BrokerError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&entry.id) {
            return Err(BrokerError::DuplicateRequest(entry.id));
        }
        let _ = entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Deliver `result` to the request's waiter and finish it.
    ///
    /// A result whose kind does not match the request's command leaves the
    /// entry pending. Unknown and already finished ids (duplicate or late
    /// replies) have no side effect.
    pub fn resolve_once(&self, id: &RequestId, result: CommandResult) -> Resolution {
        let mut entries = self.entries.lock();
        let expected = match entries.get(id) {
            Some(entry) => entry.kind(),
            None => return Resolution::Unknown,
        };
        if result.kind() != expected {
            return Resolution::KindMismatch { expected };
        }
        let Some(entry) = entries.remove(id) else {
            return Resolution::Unknown;
        };
        // Sent while the lock is held: an evictor that finds the entry gone
        // is guaranteed the value is already in the slot.
        if entry.slot.send(result).is_err() {
            tracing::debug!(request_id = %id, "no waiter for resolved request");
        }
        Resolution::Resolved
    }

    /// Push the entry's deadline out to at least `deadline`.
    ///
    /// Returns `false` when the id is no longer pending.
    pub fn extend_deadline(&self, id: &RequestId, deadline: Instant) -> bool {
        match self.entries.lock().get_mut(id) {
            Some(entry) => {
                entry.deadline = entry.deadline.max(deadline);
                true
            }
            None => false,
        }
    }

    /// Finish the request without a value, closing its slot.
    ///
    /// Returns `false` and does nothing when a reply already won.
    pub fn evict_if_unresolved(&self, id: &RequestId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Evict every entry whose deadline is at or before `now`.
    pub fn evict_expired(&self, now: Instant) -> Vec<ExpiredRequest> {
        let mut entries = self.entries.lock();
        let expired: Vec<RequestId> = entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .map(|e| ExpiredRequest {
                kind: e.kind(),
                id: e.id,
                client_id: e.client_id,
            })
            .collect()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vibrant_core::{EvalOutcome, ScreenshotOutcome};

    fn client(s: &str) -> ClientId {
        ClientId::parse(s).unwrap()
    }

    fn eval_result(v: i64) -> CommandResult {
        CommandResult::Evaluate(EvalOutcome::Value(serde_json::json!(v)))
    }

    fn pending(table: &PendingTable, ttl: Duration) -> PendingRequest {
        let (req, entry) = PendingRequest::new(client("c1"), CommandPayload::evaluate("1+1"), ttl);
        table.insert(entry).unwrap();
        req
    }

    #[test]
    fn new_request_metadata() {
        let (req, entry) =
            PendingRequest::new(client("c1"), CommandPayload::evaluate("x"), Duration::from_secs(5));
        assert_eq!(req.id(), entry.id());
        assert_eq!(req.client_id().as_str(), "c1");
        assert_eq!(req.kind(), CommandKind::Evaluate);
        assert_eq!(entry.payload(), &CommandPayload::evaluate("x"));
        assert!(req.deadline() > Instant::now());
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let table = PendingTable::new();
        let (_req, entry) =
            PendingRequest::new(client("c1"), CommandPayload::evaluate("x"), Duration::from_secs(5));
        let id = entry.id().clone();
        table.insert(entry).unwrap();

        let (tx, _rx) = oneshot::channel();
        let dup = PendingEntry {
            id: id.clone(),
            client_id: client("c1"),
            payload: CommandPayload::evaluate("y"),
            created_at: Utc::now(),
            deadline: Instant::now(),
            slot: tx,
        };
        assert_eq!(table.insert(dup), Err(BrokerError::DuplicateRequest(id)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn resolve_delivers_and_removes() {
        let table = PendingTable::new();
        let mut req = pending(&table, Duration::from_secs(5));

        assert!(table.resolve_once(req.id(), eval_result(2)).is_resolved());
        assert!(!table.contains(req.id()));
        assert_eq!((&mut req.slot).await.unwrap(), eval_result(2));
    }

    #[test]
    fn second_resolve_is_noop() {
        let table = PendingTable::new();
        let mut req = pending(&table, Duration::from_secs(5));

        assert!(table.resolve_once(req.id(), eval_result(1)).is_resolved());
        assert!(!table.resolve_once(req.id(), eval_result(2)).is_resolved());
        assert_eq!(req.slot.try_recv().unwrap(), eval_result(1));
    }

    #[test]
    fn resolve_without_waiter_is_harmless() {
        let table = PendingTable::new();
        let req = pending(&table, Duration::from_secs(5));
        let id = req.id().clone();
        drop(req);

        assert!(table.resolve_once(&id, eval_result(1)).is_resolved());
        assert!(table.is_empty());
    }

    #[test]
    fn evict_closes_slot_without_value() {
        let table = PendingTable::new();
        let mut req = pending(&table, Duration::from_secs(5));

        assert!(table.evict_if_unresolved(req.id()));
        assert!(table.is_empty());
        assert!(matches!(
            req.slot.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn evict_after_resolve_does_nothing() {
        let table = PendingTable::new();
        let mut req = pending(&table, Duration::from_secs(5));

        assert!(table.resolve_once(req.id(), eval_result(7)).is_resolved());
        assert!(!table.evict_if_unresolved(req.id()));
        assert_eq!(req.slot.try_recv().unwrap(), eval_result(7));
    }

    #[test]
    fn late_reply_after_evict_is_noop() {
        let table = PendingTable::new();
        let req = pending(&table, Duration::from_secs(5));

        assert!(table.evict_if_unresolved(req.id()));
        assert!(!table.resolve_once(req.id(), eval_result(1)).is_resolved());
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_id_is_noop() {
        let table = PendingTable::new();
        let _req = pending(&table, Duration::from_secs(5));
        let unknown = RequestId::from_raw("req_missing");

        assert!(!table.resolve_once(&unknown, eval_result(1)).is_resolved());
        assert!(!table.evict_if_unresolved(&unknown));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn evict_expired_only_takes_past_deadline() {
        let table = PendingTable::new();
        let short = pending(&table, Duration::ZERO);
        let long = pending(&table, Duration::from_secs(60));

        let expired = table.evict_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(&expired[0].id, short.id());
        assert_eq!(expired[0].kind, CommandKind::Evaluate);
        assert!(table.contains(long.id()));
        assert!(!table.contains(short.id()));
    }

    #[test]
    fn racing_resolve_and_evict_act_exactly_once() {
        for _ in 0..500 {
            let table = Arc::new(PendingTable::new());
            let mut req = pending(&table, Duration::from_secs(5));
            let id = req.id().clone();

            let t1 = {
                let table = Arc::clone(&table);
                let id = id.clone();
                std::thread::spawn(move || table.resolve_once(&id, eval_result(1)).is_resolved())
            };
            let t2 = {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.evict_if_unresolved(&id))
            };
            let resolved = t1.join().unwrap();
            let evicted = t2.join().unwrap();

            assert!(resolved ^ evicted, "exactly one path must act");
            assert!(table.is_empty());
            match req.slot.try_recv() {
                Ok(v) => assert!(resolved && v == eval_result(1)),
                Err(oneshot::error::TryRecvError::Closed) => assert!(evicted),
                Err(oneshot::error::TryRecvError::Empty) => panic!("slot left open"),
            }
        }
    }

    #[test]
    fn mismatched_kind_leaves_entry_pending() {
        let table = PendingTable::new();
        let (mut req, entry) = PendingRequest::new(
            client("c1"),
            CommandPayload::Screenshot { selectors: vec!["#a".into()] },
            Duration::from_secs(5),
        );
        table.insert(entry).unwrap();

        assert_eq!(
            table.resolve_once(req.id(), eval_result(1)),
            Resolution::KindMismatch { expected: CommandKind::Screenshot }
        );
        assert!(table.contains(req.id()));
        assert!(matches!(req.slot.try_recv(), Err(oneshot::error::TryRecvError::Empty)));

        let shot = CommandResult::Screenshot(ScreenshotOutcome::default());
        assert_eq!(table.resolve_once(req.id(), shot.clone()), Resolution::Resolved);
        assert_eq!(req.slot.try_recv().unwrap(), shot);
    }

    #[test]
    fn extend_deadline_only_moves_forward() {
        let table = PendingTable::new();
        let req = pending(&table, Duration::ZERO);
        let later = Instant::now() + Duration::from_secs(60);

        assert!(table.extend_deadline(req.id(), later));
        assert!(table.evict_expired(Instant::now()).is_empty());

        assert!(table.extend_deadline(req.id(), Instant::now()));
        assert!(table.evict_expired(later - Duration::from_secs(1)).is_empty());
        assert_eq!(table.evict_expired(later).len(), 1);

        assert!(!table.extend_deadline(req.id(), later));
    }
}
