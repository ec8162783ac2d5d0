use crate::handler::ResponseHandler;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;
use tokio::time::Instant;

/// Locally generated request id, unique for the life of one connection.
pub type LocalId = u64;

/// Monotonic id source shared by every producer of one connection.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id; the first one handed out is 1.
    pub fn next_id(&self) -> LocalId {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Where the eventual response to a request goes.
pub(crate) enum ResponseTarget {
    /// The connection's own `register` exchange
    Registration,
    /// An external handler, held without keeping it alive
    Handler(Weak<dyn ResponseHandler>),
}

impl ResponseTarget {
    fn is_live(&self) -> bool {
        match self {
            ResponseTarget::Registration => true,
            ResponseTarget::Handler(handler) => handler.strong_count() > 0,
        }
    }
}

pub(crate) struct PendingRequest {
    pub target: ResponseTarget,
    pub method: String,
    pub issued_at: Instant,
    pub deadline: Option<Instant>,
}

impl PendingRequest {
    /// `timeout` of `None` or zero means the request never times out.
    pub fn new(target: ResponseTarget, method: String, timeout: Option<Duration>) -> Self {
        let issued_at = Instant::now();
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| issued_at + t);
        Self {
            target,
            method,
            issued_at,
            deadline,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// Outcome of one sweep over the table.
pub(crate) struct Sweep {
    pub expired: Vec<(LocalId, PendingRequest)>,
    pub abandoned: usize,
}

/// Outstanding outgoing requests keyed by local id.
#[derive(Default)]
pub(crate) struct CorrelationTable {
    reqs: HashMap<LocalId, PendingRequest>,
}

impl CorrelationTable {
    pub fn insert(&mut self, id: LocalId, req: PendingRequest) {
        let previous = self.reqs.insert(id, req);
        debug_assert!(previous.is_none(), "request id {} reused", id);
    }

    pub fn take(&mut self, id: LocalId) -> Option<PendingRequest> {
        self.reqs.remove(&id)
    }

    /// Removes expired entries (returned, oldest id first) and entries whose
    /// handler no longer exists (dropped silently).
    pub fn sweep(&mut self, now: Instant) -> Sweep {
        let mut expired_ids: Vec<LocalId> = self
            .reqs
            .iter()
            .filter(|(_, req)| req.expired(now))
            .map(|(id, _)| *id)
            .collect();
        expired_ids.sort_unstable();
        let expired = expired_ids
            .into_iter()
            .filter_map(|id| self.reqs.remove(&id).map(|req| (id, req)))
            .collect();

        let before = self.reqs.len();
        self.reqs.retain(|_, req| req.target.is_live());
        Sweep {
            expired,
            abandoned: before - self.reqs.len(),
        }
    }

    /// Empties the table, oldest id first.
    pub fn drain(&mut self) -> Vec<(LocalId, PendingRequest)> {
        let mut all: Vec<_> = self.reqs.drain().collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all
    }

    pub fn contains(&self, id: LocalId) -> bool {
        self.reqs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Response, ResponseHandler};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    struct Sink;

    impl ResponseHandler for Sink {
        fn on_response(&self, _response: Response) {}
    }

    fn handler_target(handler: &Arc<Sink>) -> ResponseTarget {
        let weak: Weak<dyn ResponseHandler> = Arc::downgrade(handler) as Weak<dyn ResponseHandler>;
        ResponseTarget::Handler(weak)
    }

    #[test]
    fn test_ids_strictly_increase() {
        let ids = IdAllocator::new();
        let first = ids.next_id();
        assert_eq!(first, 1);
        let mut last = first;
        for _ in 0..100 {
            let next = ids.next_id();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let ids = Arc::new(IdAllocator::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..500).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            let batch = worker.join().unwrap();
            assert!(batch.windows(2).all(|w| w[0] < w[1]));
            for id in batch {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let req = PendingRequest::new(
            ResponseTarget::Registration,
            "register".to_string(),
            Some(Duration::ZERO),
        );
        assert!(req.deadline.is_none());
        assert!(!req.expired(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn test_sweep_splits_expired_and_abandoned() {
        let live = Arc::new(Sink);
        let dropped = Arc::new(Sink);
        let mut table = CorrelationTable::default();
        table.insert(
            1,
            PendingRequest::new(handler_target(&live), "slow".to_string(), Some(Duration::from_millis(10))),
        );
        table.insert(
            2,
            PendingRequest::new(handler_target(&live), "patient".to_string(), None),
        );
        table.insert(
            3,
            PendingRequest::new(handler_target(&dropped), "orphan".to_string(), None),
        );
        drop(dropped);

        let sweep = table.sweep(Instant::now() + Duration::from_millis(20));
        assert_eq!(sweep.expired.len(), 1);
        assert_eq!(sweep.expired[0].0, 1);
        assert_eq!(sweep.expired[0].1.method, "slow");
        assert_eq!(sweep.abandoned, 1);
        assert_eq!(table.len(), 1);
        assert!(table.take(2).is_some());
        assert!(table.take(2).is_none());
    }

    #[test]
    fn test_drain_is_ordered() {
        let mut table = CorrelationTable::default();
        for id in [5, 1, 3] {
            table.insert(
                id,
                PendingRequest::new(ResponseTarget::Registration, "m".to_string(), None),
            );
        }
        let ids: Vec<_> = table.drain().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(table.len(), 0);
    }
}
