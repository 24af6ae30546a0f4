//! Transaction id allocation and correlation of responses with pending requests.

use std::collections::{HashMap, VecDeque};

use log::debug;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult};
use crate::protocol::{MbapHeader, Request, Response, UnitId};

/// How many abandoned ids are remembered for late-reply detection
const ABANDONED_CAPACITY: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Transaction id {0} is already pending")]
    DuplicateId(u16),
}

/// A request that has been sent and is waiting for its response
#[derive(Debug)]
pub struct PendingTransaction {
    pub transaction_id: u16,
    pub unit_id: UnitId,
    pub request: Request,
    pub deadline: Instant,
    completion: oneshot::Sender<EngineResult<Response>>,
}

impl PendingTransaction {
    /// Deliver the outcome to whoever awaits this transaction
    pub fn complete(self, result: EngineResult<Response>) {
        if self.completion.send(result).is_err() {
            debug!(
                "Transaction {} completed after its caller went away",
                self.transaction_id
            );
        }
    }
}

/// What a received header corresponds to
#[derive(Debug)]
pub enum Resolution {
    /// The awaited transaction, now removed from the registry
    Pending(PendingTransaction),
    /// Reply to a transaction that was already abandoned
    Late(u16),
    /// Transaction id matches but the unit id does not; the transaction stays pending
    UnitMismatch {
        transaction_id: u16,
        expected: UnitId,
        actual: UnitId,
    },
    /// Nothing known about this transaction id
    NotFound(u16),
}

/// Registry of in-flight transactions on one connection
#[derive(Debug, Default)]
pub struct TransactionTracker {
    last_id: u16,
    pending: HashMap<u16, PendingTransaction>,
    abandoned: VecDeque<u16>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next transaction id
    ///
    /// Ids wrap from 65535 to 0. An id that is pending or still awaiting a late
    /// reply is skipped.
    pub fn next_id(&mut self) -> u16 {
        let mut candidate = self.last_id.wrapping_add(1);
        while self.is_in_use(candidate) && candidate != self.last_id {
            candidate = candidate.wrapping_add(1);
        }
        self.last_id = candidate;
        candidate
    }

    fn is_in_use(&self, id: u16) -> bool {
        self.pending.contains_key(&id) || self.abandoned.contains(&id)
    }

    /// Register a sent request and hand back the receiver for its outcome
    pub fn register(
        &mut self,
        transaction_id: u16,
        unit_id: UnitId,
        request: Request,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<EngineResult<Response>>, TrackerError> {
        if self.pending.contains_key(&transaction_id) {
            return Err(TrackerError::DuplicateId(transaction_id));
        }
        self.abandoned.retain(|id| *id != transaction_id);

        let (completion, receiver) = oneshot::channel();
        self.pending.insert(
            transaction_id,
            PendingTransaction { transaction_id, unit_id, request, deadline, completion },
        );
        Ok(receiver)
    }

    /// Match a received header against the registry
    pub fn resolve(&mut self, header: &MbapHeader) -> Resolution {
        let id = header.transaction_id;
        match self.pending.get(&id) {
            Some(pending) if pending.unit_id != header.unit_id => Resolution::UnitMismatch {
                transaction_id: id,
                expected: pending.unit_id,
                actual: header.unit_id,
            },
            Some(_) => match self.pending.remove(&id) {
                Some(pending) => Resolution::Pending(pending),
                None => Resolution::NotFound(id),
            },
            None => {
                if let Some(position) = self.abandoned.iter().position(|abandoned| *abandoned == id) {
                    self.abandoned.remove(position);
                    Resolution::Late(id)
                } else {
                    Resolution::NotFound(id)
                }
            }
        }
    }

    /// Give up on a transaction; a reply arriving later resolves as `Late`
    pub fn abandon(&mut self, transaction_id: u16) -> Option<PendingTransaction> {
        let pending = self.pending.remove(&transaction_id)?;
        if self.abandoned.len() == ABANDONED_CAPACITY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(transaction_id);
        Some(pending)
    }

    /// Abandon every pending transaction, completing each with a timeout-style error
    pub fn abandon_all(&mut self, reason: EngineError) {
        let ids: Vec<u16> = self.pending.keys().copied().collect();
        for id in ids {
            if let Some(pending) = self.abandon(id) {
                pending.complete(Err(reason.clone()));
            }
        }
    }

    /// Fail every pending transaction and forget abandoned ids
    ///
    /// Used when the connection goes away: nothing can arrive late any more.
    pub fn fail_all(&mut self, reason: EngineError) {
        for (_, pending) in self.pending.drain() {
            pending.complete(Err(reason.clone()));
        }
        self.abandoned.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, transaction_id: u16) -> bool {
        self.pending.contains_key(&transaction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutError;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(3)
    }

    #[test]
    fn test_ids_start_at_one_and_wrap_to_zero() {
        let mut tracker = TransactionTracker::new();
        assert_eq!(tracker.next_id(), 1);
        assert_eq!(tracker.next_id(), 2);

        tracker.last_id = 65534;
        assert_eq!(tracker.next_id(), 65535);
        assert_eq!(tracker.next_id(), 0);
        assert_eq!(tracker.next_id(), 1);
    }

    #[tokio::test]
    async fn test_ids_skip_pending_and_abandoned() {
        let mut tracker = TransactionTracker::new();
        let _rx = tracker.register(1, 1, Request::read(0, 1), deadline()).unwrap();
        let _rx2 = tracker.register(2, 1, Request::read(0, 1), deadline()).unwrap();
        tracker.abandon(2);

        assert_eq!(tracker.next_id(), 3);
        tracker.last_id = 0;
        assert_eq!(tracker.next_id(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let mut tracker = TransactionTracker::new();
        let _rx = tracker.register(5, 1, Request::read(0, 1), deadline()).unwrap();
        assert_eq!(
            tracker.register(5, 1, Request::read(0, 1), deadline()).unwrap_err(),
            TrackerError::DuplicateId(5)
        );
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_outcomes() {
        let mut tracker = TransactionTracker::new();
        let rx = tracker.register(7, 1, Request::read(0, 1), deadline()).unwrap();

        match tracker.resolve(&MbapHeader::new(7, 2, 3)) {
            Resolution::UnitMismatch { transaction_id, expected, actual } => {
                assert_eq!((transaction_id, expected, actual), (7, 1, 2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(tracker.is_pending(7));

        assert!(matches!(tracker.resolve(&MbapHeader::new(8, 1, 3)), Resolution::NotFound(8)));

        match tracker.resolve(&MbapHeader::new(7, 1, 3)) {
            Resolution::Pending(pending) => {
                pending.complete(Ok(Response::ReadHoldingRegisters(vec![9])));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.await.unwrap(), Ok(Response::ReadHoldingRegisters(vec![9])));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_reply_is_late_once() {
        let mut tracker = TransactionTracker::new();
        let _rx = tracker.register(3, 1, Request::read(0, 1), deadline()).unwrap();
        assert!(tracker.abandon(3).is_some());
        assert_eq!(tracker.pending_count(), 0);

        assert!(matches!(tracker.resolve(&MbapHeader::new(3, 1, 3)), Resolution::Late(3)));
        assert!(matches!(tracker.resolve(&MbapHeader::new(3, 1, 3)), Resolution::NotFound(3)));
    }

    #[tokio::test]
    async fn test_fail_all_completes_waiters() {
        let mut tracker = TransactionTracker::new();
        let rx = tracker.register(1, 1, Request::read(0, 1), deadline()).unwrap();
        let _late = tracker.register(2, 1, Request::read(0, 1), deadline()).unwrap();
        tracker.abandon(2);

        tracker.fail_all(EngineError::connection_lost("reset"));
        assert_eq!(rx.await.unwrap(), Err(EngineError::connection_lost("reset")));
        assert!(matches!(tracker.resolve(&MbapHeader::new(2, 1, 3)), Resolution::NotFound(2)));
    }

    #[tokio::test]
    async fn test_abandon_all() {
        let mut tracker = TransactionTracker::new();
        let rx = tracker.register(4, 1, Request::read(0, 1), deadline()).unwrap();
        tracker.abandon_all(EngineError::Timeout(TimeoutError::new("request", 10)));
        assert!(matches!(rx.await.unwrap(), Err(EngineError::Timeout(_))));
        assert!(matches!(tracker.resolve(&MbapHeader::new(4, 1, 3)), Resolution::Late(4)));
    }
}
