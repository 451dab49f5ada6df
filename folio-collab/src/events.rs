//! Pointer-event hub with scoped listeners.
//!
//! The view layer does hit testing and reports which region, if any, a
//! pointer event landed in. Subscribers hold a [`ListenerGuard`]; dropping it
//! detaches the listener, after which it is never invoked again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Down,
    Up,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerEvent {
    pub kind: PointerKind,
    /// Region the event landed in, as resolved by the view layer
    pub region: Option<String>,
}

impl PointerEvent {
    pub fn down(region: Option<&str>) -> Self {
        Self {
            kind: PointerKind::Down,
            region: region.map(str::to_string),
        }
    }

    pub fn up(region: Option<&str>) -> Self {
        Self {
            kind: PointerKind::Up,
            region: region.map(str::to_string),
        }
    }

    pub fn is_within(&self, region: &str) -> bool {
        self.region.as_deref() == Some(region)
    }
}

type Callback = Arc<dyn Fn(&PointerEvent) + Send + Sync>;

struct Listener {
    active: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, Listener>>,
}

/// Pointer-event hub. Clones share the same listener set.
#[derive(Clone, Default)]
pub struct PointerEvents {
    inner: Arc<Listeners>,
}

impl PointerEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener for as long as the returned guard lives.
    #[must_use = "the listener is detached when the guard is dropped"]
    pub fn subscribe<F>(&self, callback: F) -> ListenerGuard
    where
        F: Fn(&PointerEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Listener {
                    active: active.clone(),
                    callback: Arc::new(callback),
                },
            );
        log::trace!("Pointer listener {id} attached");
        ListenerGuard {
            id,
            active,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every attached listener in subscription order.
    /// Returns the number of listeners invoked.
    pub fn dispatch(&self, event: &PointerEvent) -> usize {
        // Snapshot so listeners may subscribe or detach while being called
        let listeners: Vec<(Arc<AtomicBool>, Callback)> = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|l| (l.active.clone(), l.callback.clone()))
            .collect();

        let mut invoked = 0;
        for (active, callback) in listeners {
            if active.load(Ordering::Acquire) {
                callback(event);
                invoked += 1;
            }
        }
        invoked
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Detaches its listener on drop.
pub struct ListenerGuard {
    id: u64,
    active: Arc<AtomicBool>,
    hub: Weak<Listeners>,
}

impl ListenerGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(hub) = self.hub.upgrade() {
            hub.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
            log::trace!("Pointer listener {} detached", self.id);
        }
    }
}
