//! Pending-request table keyed by request id.
//!
//! Every registered request completes exactly once: by its response, by
//! timeout/abort removal, or by [`Correlator::fail_all`] on disconnect.
//! Whichever path removes the entry first wins; the others find nothing.

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    gatelink_protocol::{ErrorShape, ResponseFrame, error_codes},
    serde_json::Value,
    tokio::{sync::oneshot, time::Instant},
    tracing::{debug, warn},
};

use crate::{Error, Result, telemetry};

pub(crate) type Completion = oneshot::Receiver<Result<Value>>;

struct PendingRequest {
    ticket: u64,
    method: String,
    sent_at: Instant,
    timeout: Duration,
    tx: oneshot::Sender<Result<Value>>,
}

/// Snapshot of one outstanding request, for diagnostics.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub id: String,
    pub method: String,
    pub age: Duration,
    pub timeout: Duration,
}

/// Handle returned by [`Correlator::register`].
pub(crate) struct Registration {
    pub id: String,
    pub ticket: u64,
    pub completion: Completion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Delivered { method: String },
    Unmatched,
}

#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    epoch: AtomicU64,
    next_seq: AtomicU64,
    next_ticket: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start issuing ids for a new connection epoch.
    pub fn begin_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
        self.next_seq.store(0, Ordering::SeqCst);
    }

    /// Next generated id, `"{epoch}-{n}"`.
    pub fn next_id(&self) -> String {
        let n = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{n}", self.epoch.load(Ordering::SeqCst))
    }

    /// Register a request before its frame is sent.
    ///
    /// An explicit id that is already pending is rejected with
    /// [`Error::DuplicateId`]; generated ids never collide.
    pub(crate) fn register(
        &self,
        id: Option<String>,
        method: &str,
        timeout: Duration,
    ) -> Result<Registration> {
        let (tx, completion) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.lock();
        let id = match id {
            Some(id) if pending.contains_key(&id) => return Err(Error::DuplicateId(id)),
            Some(id) => id,
            None => loop {
                let candidate = self.next_id();
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        pending.insert(id.clone(), PendingRequest {
            ticket,
            method: method.to_string(),
            sent_at: Instant::now(),
            timeout,
            tx,
        });
        telemetry::pending_requests(pending.len());
        Ok(Registration {
            id,
            ticket,
            completion,
        })
    }

    /// Complete the pending request matching `frame.id`.
    pub fn resolve(&self, frame: ResponseFrame) -> Resolution {
        let Some(entry) = self.lock().remove(&frame.id) else {
            // Late (already timed out) or duplicate response.
            debug!(id = %frame.id, ok = frame.ok, "dropping unmatched response");
            telemetry::unmatched_response();
            return Resolution::Unmatched;
        };
        telemetry::pending_requests(self.len());
        telemetry::response_matched(&entry.method, frame.ok, entry.sent_at.elapsed());

        let result = if frame.ok {
            Ok(frame.payload.unwrap_or(Value::Null))
        } else {
            let error = frame.error.unwrap_or_else(|| {
                ErrorShape::new(error_codes::INTERNAL, "request failed without error details")
            });
            Err(Error::Server {
                method: entry.method.clone(),
                error,
            })
        };
        if entry.tx.send(result).is_err() {
            debug!(id = %frame.id, method = %entry.method, "caller went away before response");
        }
        Resolution::Delivered {
            method: entry.method,
        }
    }

    /// Remove the entry for `id` if it still belongs to `ticket`.
    ///
    /// Returns false when the request already completed, so the caller can
    /// pick up a result that raced in.
    pub(crate) fn remove(&self, id: &str, ticket: u64) -> bool {
        let mut pending = self.lock();
        let owned = pending.get(id).is_some_and(|entry| entry.ticket == ticket);
        if owned {
            pending.remove(id);
            telemetry::pending_requests(pending.len());
        }
        owned
    }

    /// Reject every pending request with [`Error::Disconnected`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            if entry.tx.send(Err(Error::Disconnected)).is_err() {
                debug!(%id, method = %entry.method, "caller went away before disconnect");
            }
        }
        if count > 0 {
            warn!(count, "rejected pending requests after disconnect");
            telemetry::disconnect_rejections(count);
            telemetry::pending_requests(0);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Outstanding requests, oldest first.
    pub fn pending(&self) -> Vec<PendingInfo> {
        let mut infos: Vec<PendingInfo> = self
            .lock()
            .iter()
            .map(|(id, entry)| PendingInfo {
                id: id.clone(),
                method: entry.method.clone(),
                age: entry.sent_at.elapsed(),
                timeout: entry.timeout,
            })
            .collect();
        infos.sort_by(|a, b| b.age.cmp(&a.age));
        infos
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, serde_json::json};

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn generated_ids_carry_the_epoch() {
        let correlator = Correlator::new();
        correlator.begin_epoch(3);
        let a = correlator.register(None, "health", TIMEOUT).unwrap();
        let b = correlator.register(None, "health", TIMEOUT).unwrap();
        assert_eq!(a.id, "3-1");
        assert_eq!(b.id, "3-2");

        correlator.begin_epoch(4);
        let c = correlator.register(None, "health", TIMEOUT).unwrap();
        assert_eq!(c.id, "4-1");
        assert_eq!(correlator.len(), 3);
    }

    #[test]
    fn explicit_duplicate_id_is_rejected() {
        let correlator = Correlator::new();
        let _first = correlator
            .register(Some("r1".into()), "agents.add", TIMEOUT)
            .unwrap();
        let err = correlator
            .register(Some("r1".into()), "agents.add", TIMEOUT)
            .err()
            .unwrap();
        assert!(matches!(err, Error::DuplicateId(id) if id == "r1"));
        assert_eq!(correlator.len(), 1);
    }

    #[tokio::test]
    async fn resolve_delivers_payload_once() {
        let correlator = Correlator::new();
        let reg = correlator
            .register(Some("r1".into()), "agents.add", TIMEOUT)
            .unwrap();

        let first = correlator.resolve(ResponseFrame::ok("r1", json!({"agentId": "a-9"})));
        assert_eq!(first, Resolution::Delivered {
            method: "agents.add".into()
        });
        let duplicate = correlator.resolve(ResponseFrame::ok("r1", json!({})));
        assert_eq!(duplicate, Resolution::Unmatched);

        let value = reg.completion.await.unwrap().unwrap();
        assert_eq!(value["agentId"], "a-9");
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn error_response_maps_to_server_error() {
        let correlator = Correlator::new();
        let reg = correlator.register(None, "devices.revoke", TIMEOUT).unwrap();
        correlator.resolve(ResponseFrame::err(
            reg.id.clone(),
            ErrorShape::new(error_codes::NOT_FOUND, "no such device"),
        ));
        let err = reg.completion.await.unwrap().unwrap_err();
        assert_eq!(err.code(), error_codes::NOT_FOUND);
        assert!(matches!(err, Error::Server { method, .. } if method == "devices.revoke"));
    }

    #[tokio::test]
    async fn error_response_without_shape_is_internal() {
        let correlator = Correlator::new();
        let reg = correlator.register(None, "health", TIMEOUT).unwrap();
        correlator.resolve(ResponseFrame {
            id: reg.id.clone(),
            ok: false,
            payload: None,
            error: None,
            channel: None,
        });
        let err = reg.completion.await.unwrap().unwrap_err();
        assert_eq!(err.code(), error_codes::INTERNAL);
    }

    #[test]
    fn unknown_id_is_unmatched() {
        let correlator = Correlator::new();
        assert_eq!(
            correlator.resolve(ResponseFrame::ok("nope", json!(null))),
            Resolution::Unmatched
        );
    }

    #[tokio::test]
    async fn fail_all_rejects_every_pending_request() {
        let correlator = Correlator::new();
        let regs: Vec<_> = (0..5)
            .map(|_| correlator.register(None, "health", TIMEOUT).unwrap())
            .collect();
        assert_eq!(correlator.fail_all(), 5);
        assert!(correlator.is_empty());
        for reg in regs {
            assert!(matches!(
                reg.completion.await.unwrap(),
                Err(Error::Disconnected)
            ));
        }
        assert_eq!(correlator.fail_all(), 0);
    }

    #[test]
    fn remove_only_touches_the_owning_ticket() {
        let correlator = Correlator::new();
        let first = correlator
            .register(Some("r1".into()), "health", TIMEOUT)
            .unwrap();
        assert!(correlator.remove("r1", first.ticket));

        let second = correlator
            .register(Some("r1".into()), "health", TIMEOUT)
            .unwrap();
        assert!(!correlator.remove("r1", first.ticket));
        assert!(correlator.contains("r1"));
        assert!(correlator.remove("r1", second.ticket));
    }

    #[test]
    fn pending_lists_outstanding_requests() {
        let correlator = Correlator::new();
        let _a = correlator
            .register(Some("a".into()), "sessions.list", Duration::from_secs(5))
            .unwrap();
        let infos = correlator.pending();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].method, "sessions.list");
        assert_eq!(infos[0].timeout, Duration::from_secs(5));
    }
}
