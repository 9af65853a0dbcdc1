//! Cooperative cancellation.
//!
//! A [`CancellationTokenSource`] owns a cancellation flag; the
//! [`CancellationToken`] handles it hands out can be polled or have callbacks
//! registered on them. Every callback runs exactly once: on the first
//! `cancel()`, or immediately if registered after it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

struct Shared {
    cancelled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl Shared {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        }
    }

    fn cancel(&self) {
        let entries = {
            let mut callbacks = self.callbacks.lock();
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut callbacks.entries)
        };
        // Run outside the lock so callbacks may register or cancel freely.
        for (_, callback) in entries {
            callback();
        }
    }

    /// Returns the registration id, or `None` if the callback already ran.
    fn register(&self, callback: Callback) -> Option<u64> {
        {
            let mut callbacks = self.callbacks.lock();
            if !self.cancelled.load(Ordering::SeqCst) {
                let id = callbacks.next_id;
                callbacks.next_id += 1;
                callbacks.entries.push((id, callback));
                return Some(id);
            }
        }
        callback();
        None
    }

    /// Drop a callback that has not run yet. No-op once it has.
    fn unregister(&self, id: u64) {
        let removed = {
            let mut callbacks = self.callbacks.lock();
            callbacks
                .entries
                .iter()
                .position(|(entry_id, _)| *entry_id == id)
                .map(|index| callbacks.entries.remove(index))
        };
        // Dropped outside the lock; the closure may own other sources.
        drop(removed);
    }
}

/// Unregisters on drop, so an abandoned `cancelled()` wait leaves nothing
/// behind on the token.
struct Registration<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.shared.unregister(self.id);
    }
}

/// Owner of a cancellation flag.
pub struct CancellationTokenSource {
    shared: Arc<Shared>,
    /// Registration on the parent of a linked source, withdrawn on drop.
    parent: Option<(Weak<Shared>, u64)>,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            parent: None,
        }
    }

    /// Create a source that is also cancelled when `parent` is.
    ///
    /// The parent only keeps a weak reference, and the link is removed from
    /// the parent when this source is dropped: keep the source alive for as
    /// long as its tokens should follow the parent.
    pub fn linked(parent: &CancellationToken) -> Self {
        let mut source = Self::new();
        let weak: Weak<Shared> = Arc::downgrade(&source.shared);
        let registration = parent.shared.register(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.cancel();
            }
        }));
        source.parent = registration.map(|id| (Arc::downgrade(&parent.shared), id));
        source
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: self.shared.clone(),
        }
    }

    /// Flip the flag and run every registered callback. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelling(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for CancellationTokenSource {
    fn drop(&mut self) {
        if let Some((parent, id)) = self.parent.take() {
            if let Some(parent) = parent.upgrade() {
                parent.unregister(id);
            }
        }
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationTokenSource")
            .field("is_cancelling", &self.is_cancelling())
            .finish()
    }
}

/// Read-only handle over a source's cancellation flag.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    /// A token that is never cancelled.
    pub fn none() -> Self {
        CancellationTokenSource::new().token()
    }

    pub fn is_cancelling(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Run `callback` once on cancellation, or right now if already cancelled.
    pub fn register<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.register(Box::new(callback));
    }

    /// Resolves once the token is cancelled. Dropping the future before
    /// then withdraws its callback.
    pub async fn cancelled(&self) {
        if self.is_cancelling() {
            return;
        }
        let (tx, rx) = oneshot::channel::<()>();
        let _registration = self
            .shared
            .register(Box::new(move || {
                let _ = tx.send(());
            }))
            .map(|id| Registration {
                shared: &self.shared,
                id,
            });
        let _ = rx.await;
    }

    /// Callbacks waiting on this token.
    #[cfg(test)]
    pub(crate) fn pending_callbacks(&self) -> usize {
        self.shared.callbacks.lock().entries.len()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("is_cancelling", &self.is_cancelling())
            .finish()
    }
}
