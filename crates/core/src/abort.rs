//! Registry of in-flight calls and their cancellation tokens.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Execute,
    Warmup,
}

struct Entry {
    kind: CallKind,
    token: CancellationToken,
}

/// Live set of cancellation tokens for one `Upscaler`.
///
/// Entries are added by [`AbortRegistry::register`] and removed when the
/// returned [`Registration`] drops. `abort_all` cancels every entry present at
/// that moment and leaves the set intact.
pub struct AbortRegistry {
    next_id: AtomicU64,
    entries: DashMap<u64, Entry>,
    live: watch::Sender<usize>,
}

impl AbortRegistry {
    pub fn new() -> Arc<Self> {
        let (live, _) = watch::channel(0);
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
            live,
        })
    }

    pub fn register(self: &Arc<Self>, kind: CallKind) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        self.entries.insert(
            id,
            Entry {
                kind,
                token: token.clone(),
            },
        );
        self.live.send_modify(|n| *n += 1);
        debug!(id, ?kind, "Registered call");
        Registration {
            id,
            token,
            registry: Arc::clone(self),
        }
    }

    /// Cancel every registered call. Returns how many tokens were flipped.
    pub fn abort_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.entries.iter() {
            if !entry.token.is_cancelled() {
                entry.token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        *self.live.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    pub async fn wait_until_empty(&self) {
        let mut rx = self.live.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn deregister(&self, id: u64) {
        if self.entries.remove(&id).is_some() {
            self.live.send_modify(|n| *n = n.saturating_sub(1));
            debug!(id, "Deregistered call");
        }
    }
}

/// Membership of one call in the registry; deregisters on drop.
pub struct Registration {
    id: u64,
    token: CancellationToken,
    registry: Arc<AbortRegistry>,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

/// Cloneable trigger for [`AbortRegistry::abort_all`], for timeout composition.
#[derive(Clone)]
pub struct AbortHandle {
    registry: Arc<AbortRegistry>,
}

impl AbortHandle {
    pub(crate) fn new(registry: Arc<AbortRegistry>) -> Self {
        Self { registry }
    }

    pub fn abort(&self) -> usize {
        self.registry.abort_all()
    }
}
