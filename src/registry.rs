//! Controller registry and per-device pending-request tables.
//!
//! The registry is the single source of truth for "is device X connected":
//! a device key maps to exactly one live [`ControllerHandle`] at any instant.
//! Each handle carries its session's pending table: in-flight forwarded
//! requests parked until the device replies, the HTTP client gives up, or the
//! session is torn down.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::codec::RequestId;

/// Outcome delivered to a parked forward request.
#[derive(Debug)]
pub enum PendingOutcome {
    /// The device replied; the bytes are forwarded verbatim.
    Reply(Vec<u8>),
    /// The session was torn down before a reply arrived.
    Disconnected,
}

/// Redraw attempts before the pending table is declared saturated.
const MAX_ID_ATTEMPTS: u32 = 32;

/// Shared view of one controller session, created at admission and unlinked
/// at teardown. The pending table is mutated only under its mutex, by the
/// session task and by forwarders targeting this device.
pub struct ControllerHandle {
    pub device_key: String,
    /// Distinguishes this session instance from a reconnect under the same
    /// key, so a late teardown cannot evict the newcomer.
    pub session_id: Uuid,
    /// Outbound frames, drained by the session task in submission order.
    pub frame_tx: mpsc::Sender<Message>,
    /// In-flight forwarded requests awaiting a device reply.
    pending: Mutex<HashMap<RequestId, oneshot::Sender<PendingOutcome>>>,
}

impl ControllerHandle {
    pub fn new(device_key: String, frame_tx: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            device_key,
            session_id: Uuid::new_v4(),
            frame_tx,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Reserve a fresh request id and park a reply slot under it.
    ///
    /// Ids are drawn uniformly from the full 16-bit space and redrawn on
    /// collision; an id is never reused while its predecessor is unresolved.
    /// Returns `None` when no free id is found within the attempt bound (the
    /// table is saturated) and the forwarder answers 503.
    pub async fn register_pending(
        &self,
    ) -> Option<(RequestId, oneshot::Receiver<PendingOutcome>)> {
        let mut pending = self.pending.lock().await;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = RequestId::random();
            if let Entry::Vacant(slot) = pending.entry(id) {
                let (reply_tx, reply_rx) = oneshot::channel();
                slot.insert(reply_tx);
                return Some((id, reply_rx));
            }
        }
        None
    }

    /// Remove a parked slot without resolving it (the HTTP client went away).
    pub async fn discard_pending(&self, id: RequestId) {
        self.pending.lock().await.remove(&id);
    }

    /// Deliver a device reply. Returns `false` on an unknown id (stale,
    /// cancelled, or never issued), in which case nothing changes.
    pub async fn resolve_pending(&self, id: RequestId, body: Vec<u8>) -> bool {
        let Some(slot) = self.pending.lock().await.remove(&id) else {
            return false;
        };
        // A closed receiver means the HTTP client disconnected first; the
        // reply is dropped on the floor.
        let _ = slot.send(PendingOutcome::Reply(body));
        true
    }

    /// Resolve every in-flight request as failed and empty the table.
    /// Draining an already-drained table is a no-op, which keeps teardown
    /// idempotent. Returns how many requests were failed.
    pub async fn drain_pending(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        let count = drained.len();
        for (id, slot) in drained {
            debug!(device_key = %self.device_key, request_id = %id, "failing pending request");
            let _ = slot.send(PendingOutcome::Disconnected);
        }
        count
    }

    /// Number of in-flight requests, for logs and tests.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Insert result for [`ControllerRegistry::try_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Maps device key → active controller session.
#[derive(Clone, Default)]
pub struct ControllerRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<ControllerHandle>>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic test-and-set keyed by the handle's device key. The only
    /// admission barrier against duplicate controllers.
    pub async fn try_insert(&self, handle: Arc<ControllerHandle>) -> InsertOutcome {
        let mut map = self.inner.write().await;
        match map.entry(handle.device_key.clone()) {
            Entry::Occupied(_) => InsertOutcome::AlreadyPresent,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                InsertOutcome::Inserted
            }
        }
    }

    /// Remove the mapping, but only while it still points at the given
    /// session instance. Idempotent.
    pub async fn remove(&self, device_key: &str, session_id: Uuid) {
        let mut map = self.inner.write().await;
        if map
            .get(device_key)
            .is_some_and(|h| h.session_id == session_id)
        {
            map.remove(device_key);
        }
    }

    pub async fn lookup(&self, device_key: &str) -> Option<Arc<ControllerHandle>> {
        self.inner.read().await.get(device_key).cloned()
    }

    pub async fn contains(&self, device_key: &str) -> bool {
        self.inner.read().await.contains_key(device_key)
    }

    /// Number of connected controllers.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(key: &str) -> Arc<ControllerHandle> {
        let (frame_tx, _frame_rx) = mpsc::channel(8);
        ControllerHandle::new(key.to_string(), frame_tx)
    }

    #[tokio::test]
    async fn second_insert_for_same_key_is_rejected() {
        let registry = ControllerRegistry::new();
        let first = handle("k2");
        let second = handle("k2");

        assert_eq!(registry.try_insert(first.clone()).await, InsertOutcome::Inserted);
        assert_eq!(
            registry.try_insert(second).await,
            InsertOutcome::AlreadyPresent
        );
        // The incumbent is untouched.
        let stored = registry.lookup("k2").await.unwrap();
        assert_eq!(stored.session_id, first.session_id);
    }

    #[tokio::test]
    async fn concurrent_inserts_admit_exactly_one() {
        let registry = ControllerRegistry::new();
        let (a, b) = tokio::join!(
            registry.try_insert(handle("k")),
            registry.try_insert(handle("k")),
        );
        let inserted = [a, b]
            .iter()
            .filter(|o| **o == InsertOutcome::Inserted)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stale_remove_does_not_evict_a_reconnect() {
        let registry = ControllerRegistry::new();
        let old = handle("k");
        let old_session = old.session_id;
        registry.try_insert(old).await;
        registry.remove("k", old_session).await;

        let fresh = handle("k");
        let fresh_session = fresh.session_id;
        registry.try_insert(fresh).await;

        // A teardown of the old instance arriving late must be a no-op.
        registry.remove("k", old_session).await;
        assert_eq!(
            registry.lookup("k").await.unwrap().session_id,
            fresh_session
        );

        // Removing the current instance works, and again is idempotent.
        registry.remove("k", fresh_session).await;
        registry.remove("k", fresh_session).await;
        assert!(!registry.contains("k").await);
    }

    #[tokio::test]
    async fn register_pending_never_hands_out_a_live_id() {
        let h = handle("k");
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let (id, _rx) = h.register_pending().await.unwrap();
            assert!(seen.insert(id), "id {id} issued twice while unresolved");
        }
        assert_eq!(h.pending_len().await, 100);
    }

    #[tokio::test]
    async fn saturated_table_stops_issuing_ids() {
        let h = handle("k");
        {
            let mut pending = h.pending.lock().await;
            for raw in 0..=u16::MAX {
                let (tx, _rx) = oneshot::channel();
                pending.insert(crate::codec::RequestId::from_u16(raw), tx);
            }
        }
        assert!(h.register_pending().await.is_none());
    }

    #[tokio::test]
    async fn resolve_unknown_id_changes_nothing() {
        let h = handle("k5");
        let (id, _rx) = h.register_pending().await.unwrap();
        let unknown = if id == RequestId::from_u16(0x1234) {
            RequestId::from_u16(0x4321)
        } else {
            RequestId::from_u16(0x1234)
        };
        assert!(!h.resolve_pending(unknown, b"late".to_vec()).await);
        assert_eq!(h.pending_len().await, 1);
    }

    #[tokio::test]
    async fn resolve_delivers_exactly_once() {
        let h = handle("k");
        let (id, rx) = h.register_pending().await.unwrap();
        assert!(h.resolve_pending(id, b"OK".to_vec()).await);
        match rx.await.unwrap() {
            PendingOutcome::Reply(body) => assert_eq!(body, b"OK"),
            other => panic!("unexpected outcome {other:?}"),
        }
        // The slot is gone; a second reply for the same id is a miss.
        assert!(!h.resolve_pending(id, b"again".to_vec()).await);
    }

    #[tokio::test]
    async fn reply_after_client_disconnect_is_swallowed() {
        let h = handle("k6");
        let (id, rx) = h.register_pending().await.unwrap();
        drop(rx);
        // The entry is still resolved and removed; the send failure is silent.
        assert!(h.resolve_pending(id, b"body".to_vec()).await);
        assert_eq!(h.pending_len().await, 0);
    }

    #[tokio::test]
    async fn drain_fails_every_pending_request_once() {
        let h = handle("k4");
        let (_, rx1) = h.register_pending().await.unwrap();
        let (_, rx2) = h.register_pending().await.unwrap();

        assert_eq!(h.drain_pending().await, 2);
        for rx in [rx1, rx2] {
            match rx.await.unwrap() {
                PendingOutcome::Disconnected => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        // Teardown is idempotent: a second drain has nothing to do.
        assert_eq!(h.drain_pending().await, 0);
    }
}
