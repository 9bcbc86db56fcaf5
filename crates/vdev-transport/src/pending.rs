//! Pending-request bookkeeping.
//!
//! Every in-flight operation is an `id -> handler` entry. The driver task is
//! the only mutator; the store is shared with client handles for diagnostics
//! only, using `scc::HashMap` so reads never contend with the hot dispatch
//! path.

use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;
use tracing::error;

use crate::{codec::Frame, error::AgentError};

/// Verdict a handler returns after consuming a frame.
#[derive(Debug)]
pub enum Completion {
    /// Keep the entry registered; more frames are expected.
    Pending,
    /// Terminal success; the entry is removed.
    Done(Value),
    /// Terminal failure; the entry is removed.
    Failed(AgentError),
}

/// Per-request frame handler.
///
/// Invoked by the driver for every frame matching the request id, in arrival
/// order, and exactly once with `Err` if the connection dies while the
/// request is pending.
pub type FrameHandler = Box<dyn FnMut(Result<Frame, AgentError>) -> Completion + Send + Sync>;

/// Store of in-flight request handlers keyed by id.
///
/// Ids come from a monotonically increasing counter that lives for the whole
/// logical connection and is never reused while an entry is live.
pub(crate) struct PendingStore {
    entries: scc::HashMap<u32, FrameHandler>,
    next_id: AtomicU32,
}

impl PendingStore {
    pub(crate) fn new() -> Self {
        Self {
            entries: scc::HashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Claim the next request id.
    pub(crate) fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `handler` under `id`.
    pub(crate) fn register(&self, id: u32, handler: FrameHandler) {
        // a collision means the counter wrapped while the old entry was live
        if self.entries.insert_sync(id, handler).is_err() {
            error!(id, "request id collision, dropping handler");
        }
    }

    /// Route a frame to the handler registered under `id`.
    ///
    /// Returns `None` when no entry matches. A terminal completion removes
    /// the entry; `Pending` keeps it registered for further frames.
    pub(crate) fn dispatch(&self, id: u32, frame: Frame) -> Option<Completion> {
        let completion = self
            .entries
            .update_sync(&id, |_, handler| handler(Ok(frame)))?;
        if !matches!(completion, Completion::Pending) {
            self.entries.remove_sync(&id);
        }
        Some(completion)
    }

    /// Remove the entry under `id` and hand its handler the error.
    pub(crate) fn fail_one(&self, id: u32, error: AgentError) {
        if let Some((_, mut handler)) = self.entries.remove_sync(&id) {
            let _ = handler(Err(error));
        }
    }

    /// Fail every live entry, invoking each handler exactly once with the
    /// produced error. Called on connection teardown.
    pub(crate) fn fail_all<F: Fn() -> AgentError>(&self, make_error: F) {
        let mut ids = Vec::new();
        self.entries.retain_sync(|id, _| {
            ids.push(*id);
            true
        });

        for id in ids {
            if let Some((_, mut handler)) = self.entries.remove_sync(&id) {
                let _ = handler(Err(make_error()));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use serde_json::json;

    use super::*;

    fn counting_handler(seen: Arc<AtomicUsize>, completion_on_frame: bool) -> FrameHandler {
        Box::new(move |event| {
            seen.fetch_add(1, Ordering::Relaxed);
            match event {
                Ok(_) if completion_on_frame => Completion::Done(Value::Null),
                Ok(_) => Completion::Pending,
                Err(err) => Completion::Failed(err),
            }
        })
    }

    #[test]
    fn test_ids_are_monotonic() {
        let store = PendingStore::new();
        let first = store.allocate_id();
        let second = store.allocate_id();
        assert!(second > first);
    }

    #[test]
    fn test_terminal_completion_removes_entry() {
        let store = PendingStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        store.register(1, counting_handler(Arc::clone(&seen), true));
        assert_eq!(store.len(), 1);

        let completion = store.dispatch(1, Frame::Control(json!({"id": 1})));
        assert!(matches!(completion, Some(Completion::Done(_))));
        assert_eq!(store.len(), 0);
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        // a second frame for the same id no longer matches
        assert!(store.dispatch(1, Frame::Control(json!({"id": 1}))).is_none());
    }

    #[test]
    fn test_pending_completion_keeps_entry() {
        let store = PendingStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        store.register(2, counting_handler(Arc::clone(&seen), false));

        for _ in 0..3 {
            let completion = store.dispatch(2, Frame::Control(json!({"id": 2})));
            assert!(matches!(completion, Some(Completion::Pending)));
        }
        assert_eq!(store.len(), 1);
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_dispatch_unknown_id() {
        let store = PendingStore::new();
        assert!(store.dispatch(7, Frame::Control(json!({"id": 7}))).is_none());
    }

    #[test]
    fn test_fail_all_notifies_each_entry_once() {
        let store = PendingStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for id in 1..=4 {
            store.register(id, counting_handler(Arc::clone(&seen), true));
        }

        store.fail_all(|| AgentError::Cancelled);
        assert_eq!(store.len(), 0);
        assert_eq!(seen.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_fail_one() {
        let store = PendingStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        store.register(9, counting_handler(Arc::clone(&seen), true));

        store.fail_one(9, AgentError::connection("gone"));
        assert_eq!(store.len(), 0);
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        // no entry left, nothing invoked
        store.fail_one(9, AgentError::connection("gone"));
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
