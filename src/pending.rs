//! Correlation table for in-flight requests.
//!
//! Every request gets a sync id that is unique among outstanding requests.
//! The reader task takes the entry for each response sync and completes its
//! oneshot sink; callers remove their own entry on timeout, so a late reply
//! finds nothing and is dropped.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::codec::{Response, ResponseDecoder};
use crate::error::{IprotoError, Result};
use crate::protocol::{ResponseHeader, AUTH_SYNC};

/// Receiving side of a pending request.
pub(crate) type Completion = oneshot::Receiver<Result<Response>>;

pub(crate) struct PendingRequest {
    decoder: ResponseDecoder,
    deadline: Option<Instant>,
    sink: oneshot::Sender<Result<Response>>,
}

impl PendingRequest {
    /// Decode the response body and deliver it to the waiting caller.
    pub(crate) fn complete(self, header: ResponseHeader, body: &[u8]) {
        let result = match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(IprotoError::Timeout),
            _ => self.decoder.decode(header, body),
        };
        // The caller may have given up already.
        let _ = self.sink.send(result);
    }

    fn fail(self, err: IprotoError) {
        let _ = self.sink.send(Err(err));
    }
}

struct Inner {
    requests: HashMap<u64, PendingRequest>,
    next_sync: u64,
    closed: bool,
}

pub(crate) struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                requests: HashMap::new(),
                next_sync: AUTH_SYNC + 1,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next sync id.
    ///
    /// Wraps around, skipping the handshake sync and ids still outstanding.
    pub(crate) fn next_sync(&self) -> u64 {
        let mut inner = self.lock();
        loop {
            let sync = inner.next_sync;
            inner.next_sync = inner.next_sync.wrapping_add(1);
            if sync != AUTH_SYNC && !inner.requests.contains_key(&sync) {
                return sync;
            }
        }
    }

    /// Track a request sent with `sync`.
    ///
    /// Fails with [`IprotoError::ConnectionLost`] once the table is closed.
    pub(crate) fn register(
        &self,
        sync: u64,
        decoder: ResponseDecoder,
        deadline: Option<Instant>,
    ) -> Result<Completion> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(IprotoError::ConnectionLost);
        }
        if inner.requests.contains_key(&sync) {
            return Err(IprotoError::Protocol(format!("sync {sync} is already in flight")));
        }

        let (sink, completion) = oneshot::channel();
        inner.requests.insert(
            sync,
            PendingRequest {
                decoder,
                deadline,
                sink,
            },
        );
        Ok(completion)
    }

    /// Take the entry for a response.
    pub(crate) fn take(&self, sync: u64) -> Option<PendingRequest> {
        self.lock().requests.remove(&sync)
    }

    /// Forget a request whose caller stopped waiting.
    pub(crate) fn remove(&self, sync: u64) -> bool {
        self.lock().requests.remove(&sync).is_some()
    }

    /// Close the table and fail every outstanding request.
    pub(crate) fn fail_all(&self, make_err: impl Fn() -> IprotoError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.requests.drain().map(|(_, pending)| pending).collect()
        };

        let count = drained.len();
        for pending in drained {
            pending.fail(make_err());
        }
        if count > 0 {
            trace!(count, "Failed pending requests");
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().requests.len()
    }

    #[cfg(test)]
    fn set_next_sync(&self, sync: u64) {
        self.lock().next_sync = sync;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BodyKind, ResponseBody};
    use std::time::Duration;

    fn decoder() -> ResponseDecoder {
        ResponseDecoder::new(BodyKind::Empty, None)
    }

    fn ok_header(sync: u64) -> ResponseHeader {
        ResponseHeader {
            code: 0,
            sync,
            schema_id: None,
        }
    }

    #[test]
    fn test_syncs_are_unique_and_start_at_one() {
        let table = PendingTable::new();
        let syncs: Vec<u64> = (0..100).map(|_| table.next_sync()).collect();

        assert_eq!(syncs[0], 1);
        let mut deduped = syncs.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), syncs.len());
    }

    #[test]
    fn test_wraparound_skips_auth_sync_and_live_ids() {
        let table = PendingTable::new();
        let _live = table.register(1, decoder(), None).unwrap();

        table.set_next_sync(u64::MAX);
        assert_eq!(table.next_sync(), u64::MAX);
        // 0 is reserved, 1 is still in flight.
        assert_eq!(table.next_sync(), 2);
    }

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let table = PendingTable::new();
        let sync = table.next_sync();
        let completion = table.register(sync, decoder(), None).unwrap();

        let pending = table.take(sync).unwrap();
        pending.complete(ok_header(sync), &[0x80]);

        let response = completion.await.unwrap().unwrap();
        assert_eq!(response.sync, sync);
        assert_eq!(response.body, ResponseBody::Empty);
        assert!(table.take(sync).is_none());
    }

    #[tokio::test]
    async fn test_expired_deadline_reports_timeout() {
        let table = PendingTable::new();
        let deadline = Instant::now() - Duration::from_millis(1);
        let completion = table.register(5, decoder(), Some(deadline)).unwrap();

        table.take(5).unwrap().complete(ok_header(5), &[0x80]);

        assert!(matches!(completion.await.unwrap(), Err(IprotoError::Timeout)));
    }

    #[tokio::test]
    async fn test_fail_all_closes_table() {
        let table = PendingTable::new();
        let completions: Vec<_> = (0..3)
            .map(|_| {
                let sync = table.next_sync();
                table.register(sync, decoder(), None).unwrap()
            })
            .collect();

        assert_eq!(table.len(), 3);
        assert_eq!(table.fail_all(|| IprotoError::ConnectionLost), 3);

        for completion in completions {
            assert!(matches!(
                completion.await.unwrap(),
                Err(IprotoError::ConnectionLost)
            ));
        }
        assert!(matches!(
            table.register(99, decoder(), None),
            Err(IprotoError::ConnectionLost)
        ));
    }

    #[test]
    fn test_remove_forgets_entry() {
        let table = PendingTable::new();
        let _completion = table.register(7, decoder(), None).unwrap();

        assert!(table.remove(7));
        assert!(!table.remove(7));
        assert_eq!(table.len(), 0);
    }
}
