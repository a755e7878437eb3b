//! Batched "plugin list changed" notification.
//!
//! Listeners register callbacks or subscribe to a broadcast channel.
//! Between `begin_update` and the matching outermost `end_update`, change
//! events are held back; since every change event supersedes the previous
//! one, only the latest is delivered when the batch closes. Reload requests
//! made during a batch are deferred the same way.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

/// Raised after a discovery pass installs a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginListChanged {
    pub generation: u64,
}

impl PluginListChanged {
    /// Any two list-changed events are redundant: the later one carries
    /// everything a listener needs.
    pub fn is_redundant_with(&self, _other: &PluginListChanged) -> bool {
        true
    }
}

/// Callback interface for list changes. Closures taking
/// `&PluginListChanged` implement it.
pub trait PluginListener: Send + Sync {
    fn plugin_list_changed(&self, event: &PluginListChanged);
}

impl<F> PluginListener for F
where
    F: Fn(&PluginListChanged) + Send + Sync,
{
    fn plugin_list_changed(&self, event: &PluginListChanged) {
        self(event)
    }
}

/// Handle returned by [`ChangeNotifier::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Outcome of closing the outermost batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchEnd {
    /// The held-back change, to be dispatched now.
    pub event: Option<PluginListChanged>,
    /// A reload was requested during the batch.
    pub reload: bool,
}

#[derive(Debug, Default)]
struct BatchState {
    depth: usize,
    pending: Option<PluginListChanged>,
    need_reload: bool,
}

const BROADCAST_CAPACITY: usize = 16;

/// Listener registry plus batch bookkeeping.
///
/// The notifier only decides *when* an event is delivered; callers perform
/// delivery with [`fan_out`](Self::fan_out) outside any lock, so listeners
/// may call back into the batch API.
pub struct ChangeNotifier {
    state: Mutex<BatchState>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn PluginListener>)>>,
    next_id: AtomicU64,
    /// Highest generation handed out by [`claim`](Self::claim).
    delivered: AtomicU64,
    sender: broadcast::Sender<PluginListChanged>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Mutex::new(BatchState::default()),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            sender,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PluginListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns false when `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// A receiver for every event delivered from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PluginListChanged> {
        self.sender.subscribe()
    }

    pub fn begin_update(&self) {
        self.state.lock().depth += 1;
    }

    /// Closes one batch level. At the outermost level the held-back event
    /// and the deferred reload flag are handed to the caller.
    pub fn end_update(&self) -> BatchEnd {
        let mut state = self.state.lock();
        match state.depth {
            0 => {
                tracing::warn!("end_update called without matching begin_update");
                BatchEnd::default()
            }
            1 => {
                state.depth = 0;
                BatchEnd {
                    event: state.pending.take(),
                    reload: std::mem::take(&mut state.need_reload),
                }
            }
            _ => {
                state.depth -= 1;
                BatchEnd::default()
            }
        }
    }

    pub fn is_updating(&self) -> bool {
        self.state.lock().depth > 0
    }

    /// Records a change. Returns the event when it must be dispatched right
    /// away, or `None` when a batch holds it back.
    pub fn changed(&self, event: PluginListChanged) -> Option<PluginListChanged> {
        let mut state = self.state.lock();
        if state.depth == 0 {
            return Some(event);
        }
        if let Some(held) = state.pending {
            if event.is_redundant_with(&held) {
                tracing::trace!(
                    held = held.generation,
                    generation = event.generation,
                    "Coalescing plugin list change"
                );
            }
        }
        state.pending = Some(event);
        None
    }

    /// Marks a reload as needed if a batch is open. Returns whether the
    /// request was deferred.
    pub fn defer_reload(&self) -> bool {
        let mut state = self.state.lock();
        if state.depth > 0 {
            state.need_reload = true;
            true
        } else {
            false
        }
    }

    /// Reserves delivery of `event`. Returns false when the same or a newer
    /// generation has already been claimed, so a change held by a batch
    /// never reaches listeners after a later one.
    pub fn claim(&self, event: &PluginListChanged) -> bool {
        self.delivered.fetch_max(event.generation, Ordering::SeqCst) < event.generation
    }

    /// Delivers `event` to every listener and broadcast subscriber.
    ///
    /// A panicking listener is logged and skipped.
    pub fn fan_out(&self, event: &PluginListChanged) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.plugin_list_changed(event)));
            if result.is_err() {
                tracing::error!(generation = event.generation, "Plugin list listener panicked");
            }
        }

        // No subscribers is fine.
        let _ = self.sender.send(*event);
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChangeNotifier")
            .field("depth", &state.depth)
            .field("pending", &state.pending)
            .field("need_reload", &state.need_reload)
            .field("listeners", &self.listener_count())
            .finish()
    }
}
