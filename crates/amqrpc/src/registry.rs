// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pending-call registry mapping correlation ids to reply slots.
//!
//! Every outbound call registers a oneshot slot under its correlation id
//! before the request is published. The reply router resolves the slot when
//! the matching reply arrives; timeout, cancellation and teardown all remove
//! the entry exactly once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::correlation::CorrelationId;
use crate::error::{Error, Result};

type ReplySlot = oneshot::Sender<Result<Vec<u8>>>;

/// Shared registry of in-flight calls.
///
/// Cheap to clone; all clones observe the same map. Each entry is resolved
/// at most once: `resolve`/`fail_all` remove the entry before completing the
/// slot, and a [`PendingCall`] removes its own entry on drop if nothing else
/// claimed it first.
#[derive(Clone, Default)]
pub struct CallRegistry {
    inner: Arc<DashMap<CorrelationId, ReplySlot>>,
}

impl CallRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call under `id` and hand back the waiting half.
    ///
    /// Fails with [`Error::DuplicateCorrelationId`] when an entry with the
    /// same id is still pending; the existing entry is left untouched.
    pub fn register(&self, id: CorrelationId) -> Result<PendingCall> {
        use dashmap::mapref::entry::Entry;

        let (tx, rx) = oneshot::channel();
        match self.inner.entry(id) {
            Entry::Occupied(_) => Err(Error::DuplicateCorrelationId(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(PendingCall {
                    id,
                    rx,
                    registry: self.clone(),
                })
            }
        }
    }

    /// Deliver a reply payload to the call registered under `id`.
    ///
    /// Returns `false` when no such call is pending (late, duplicate or
    /// foreign reply); the payload is dropped in that case.
    pub fn resolve(&self, id: &CorrelationId, payload: Vec<u8>) -> bool {
        match self.inner.remove(id) {
            Some((_, tx)) => {
                // Send fails only if the caller gave up between our remove
                // and this send; the entry is gone either way.
                let _ = tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Fail every pending call with a clone of `error`.
    ///
    /// Returns the number of calls failed. Used on connection loss
    /// (`ServiceUnavailable`) and on shutdown (`Shutdown`).
    pub fn fail_all(&self, error: &Error) -> usize {
        // Collect first: removing while holding shard iterators can deadlock.
        let ids: Vec<CorrelationId> = self.inner.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.inner.remove(&id) {
                let _ = tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Number of calls currently awaiting a reply.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no calls are pending.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRegistry")
            .field("pending", &self.inner.len())
            .finish()
    }
}

/// Waiting half of a registered call.
///
/// Dropping it without waiting cancels the call: the registry entry is
/// removed and a reply arriving afterwards is treated as unmatched.
pub struct PendingCall {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<Vec<u8>>>,
    registry: CallRegistry,
}

impl PendingCall {
    /// Correlation id this call is registered under.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait up to `deadline` for the reply.
    ///
    /// On timeout the entry is removed and [`Error::Timeout`] is returned;
    /// a reply arriving later no longer matches anything.
    pub async fn wait(mut self, deadline: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(resolution)) => resolution,
            // Sender dropped without resolving: the registry itself went away.
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.registry.inner.remove(&self.id);
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seq: u64) -> CorrelationId {
        CorrelationId::new(0xfeed_f00d_dead_beef, seq)
    }

    #[tokio::test]
    async fn register_resolve_roundtrip() {
        let registry = CallRegistry::new();
        let call = registry.register(id(1)).expect("Failed to register call");
        assert_eq!(registry.len(), 1);

        assert!(registry.resolve(&id(1), b"pong".to_vec()));
        let reply = call
            .wait(Duration::from_secs(1))
            .await
            .expect("Failed to receive reply");
        assert_eq!(reply, b"pong");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let registry = CallRegistry::new();
        let _first = registry.register(id(7)).expect("Failed to register call");

        let err = registry.register(id(7)).unwrap_err();
        assert!(matches!(err, Error::DuplicateCorrelationId(_)));
        // Original registration is untouched.
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry() {
        let registry = CallRegistry::new();
        let call = registry.register(id(2)).expect("Failed to register call");

        let err = call.wait(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert!(registry.is_empty());

        // A reply arriving after the timeout matches nothing.
        assert!(!registry.resolve(&id(2), b"late".to_vec()));
    }

    #[tokio::test]
    async fn drop_cancels_call() {
        let registry = CallRegistry::new();
        let call = registry.register(id(3)).expect("Failed to register call");
        drop(call);

        assert!(registry.is_empty());
        assert!(!registry.resolve(&id(3), b"orphan".to_vec()));
    }

    #[tokio::test]
    async fn fail_all_resolves_everything() {
        let registry = CallRegistry::new();
        let calls: Vec<PendingCall> = (1..=3)
            .map(|seq| registry.register(id(seq)).expect("Failed to register call"))
            .collect();

        let failed = registry.fail_all(&Error::unavailable("connection lost"));
        assert_eq!(failed, 3);
        assert!(registry.is_empty());

        for call in calls {
            let err = call.wait(Duration::from_secs(1)).await.unwrap_err();
            assert!(matches!(err, Error::ServiceUnavailable(_)));
        }
    }

    #[tokio::test]
    async fn resolve_is_single_shot() {
        let registry = CallRegistry::new();
        let call = registry.register(id(9)).expect("Failed to register call");

        assert!(registry.resolve(&id(9), b"first".to_vec()));
        assert!(!registry.resolve(&id(9), b"second".to_vec()));

        let reply = call
            .wait(Duration::from_secs(1))
            .await
            .expect("Failed to receive reply");
        assert_eq!(reply, b"first");
    }
}
