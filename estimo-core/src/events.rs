//! Cross-tab notification bus.
//!
//! Two independent channels carry storage notifications:
//!
//! ```text
//!  write in tab A
//!     │
//!     ├── dispatch("local-storage", key) ──► every listener, tabs A, B, C …
//!     │
//!     └── medium change event ───────────► listeners in tabs B, C … (never A)
//! ```
//!
//! Delivery is at-least-once and unordered across the two channels, so a
//! listener only ever learns "key K may have changed". Consumers re-read the
//! key and apply whatever is stored now; a duplicate notice costs one read.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Name of the custom notification emitted after a durable write.
pub const STORAGE_EVENT_NAME: &str = "local-storage";

/// Name carried by native storage-change notifications.
pub const NATIVE_STORAGE_EVENT: &str = "storage";

/// Per-channel buffer before slow listeners start lagging.
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Identifies one tab inside a browser context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(u64);

impl TabId {
    /// Origin used for changes made outside any tab of this process.
    pub const EXTERNAL: TabId = TabId(0);

    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Which channel delivered a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeSource {
    /// Custom notification dispatched by the writer.
    Dispatched,
    /// Native storage-change notification from the medium.
    Storage,
    /// The listener fell behind and must assume anything changed.
    Resync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub name: String,
    /// Affected key; `None` means every key (a cleared area).
    pub key: Option<String>,
    pub origin: TabId,
    pub source: NoticeSource,
}

/// Fan-out hub shared by all tabs of one browser context.
#[derive(Debug, Clone)]
pub struct CrossTabEventBus {
    dispatched: broadcast::Sender<BusEvent>,
    storage: broadcast::Sender<BusEvent>,
    capacity: usize,
}

impl CrossTabEventBus {
    pub fn new(capacity: usize) -> Self {
        let (dispatched, _) = broadcast::channel(capacity);
        let (storage, _) = broadcast::channel(capacity);
        Self {
            dispatched,
            storage,
            capacity,
        }
    }

    /// Dispatch a named notification to every listener in every tab,
    /// including `origin` itself. Returns the number of receivers reached.
    pub fn dispatch(&self, name: &str, key: Option<&str>, origin: TabId) -> usize {
        let event = BusEvent {
            name: name.to_string(),
            key: key.map(str::to_string),
            origin,
            source: NoticeSource::Dispatched,
        };
        let reached = self.dispatched.send(event).unwrap_or(0);
        log::debug!("Dispatched `{name}` for {key:?} from tab {} to {reached} listeners", origin.raw());
        reached
    }

    /// Emit the medium's native change notification. Listeners in `origin`
    /// drop it; every other tab sees it.
    pub fn notify_storage(&self, key: Option<&str>, origin: TabId) -> usize {
        let event = BusEvent {
            name: NATIVE_STORAGE_EVENT.to_string(),
            key: key.map(str::to_string),
            origin,
            source: NoticeSource::Storage,
        };
        self.storage.send(event).unwrap_or(0)
    }

    /// Register a listener for `name` in `tab`, optionally filtered by key.
    pub fn listen(&self, tab: TabId, name: &str, key: Option<&str>) -> Listener {
        Listener {
            tab,
            name: name.to_string(),
            key: key.map(str::to_string),
            dispatched: self.dispatched.subscribe(),
            storage: self.storage.subscribe(),
        }
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.dispatched.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for CrossTabEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// A registered listener. Dropping it deregisters from both channels.
#[derive(Debug)]
pub struct Listener {
    tab: TabId,
    name: String,
    key: Option<String>,
    dispatched: broadcast::Receiver<BusEvent>,
    storage: broadcast::Receiver<BusEvent>,
}

impl Listener {
    pub fn tab(&self) -> TabId {
        self.tab
    }

    fn accepts(&self, event: &BusEvent) -> bool {
        let channel_ok = match event.source {
            NoticeSource::Dispatched => event.name == self.name,
            NoticeSource::Storage => event.origin != self.tab,
            NoticeSource::Resync => true,
        };
        let key_ok = match (&self.key, &event.key) {
            (Some(wanted), Some(key)) => wanted == key,
            _ => true,
        };
        channel_ok && key_ok
    }

    fn resync(&self, missed: u64) -> BusEvent {
        log::warn!(
            "Listener for {:?} in tab {} lagged by {missed} notices, resyncing",
            self.key,
            self.tab.raw()
        );
        BusEvent {
            name: self.name.clone(),
            key: self.key.clone(),
            origin: self.tab,
            source: NoticeSource::Resync,
        }
    }

    /// Next accepted notice already queued, without waiting.
    pub fn try_next(&mut self) -> Option<BusEvent> {
        loop {
            match self.dispatched.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => return Some(self.resync(n)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        loop {
            match self.storage.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => return Some(self.resync(n)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything queued; returns how many accepted notices arrived.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while self.try_next().is_some() {
            count += 1;
        }
        count
    }

    /// Wait for the next accepted notice. `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<BusEvent> {
        loop {
            let received = tokio::select! {
                r = self.dispatched.recv() => r,
                r = self.storage.recv() => r,
            };
            match received {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Some(self.resync(n)),
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: TabId = TabId(1);
    const B: TabId = TabId(2);

    #[test]
    fn test_dispatch_reaches_own_tab() {
        let bus = CrossTabEventBus::default();
        let mut own = bus.listen(A, STORAGE_EVENT_NAME, Some("k"));

        bus.dispatch(STORAGE_EVENT_NAME, Some("k"), A);
        let event = own.try_next().unwrap();
        assert_eq!(event.source, NoticeSource::Dispatched);
        assert_eq!(event.key.as_deref(), Some("k"));
        assert!(own.try_next().is_none());
    }

    #[test]
    fn test_storage_notice_skips_writer_tab() {
        let bus = CrossTabEventBus::default();
        let mut writer = bus.listen(A, STORAGE_EVENT_NAME, Some("k"));
        let mut other = bus.listen(B, STORAGE_EVENT_NAME, Some("k"));

        bus.notify_storage(Some("k"), A);

        assert!(writer.try_next().is_none());
        assert_eq!(other.try_next().unwrap().source, NoticeSource::Storage);
    }

    #[test]
    fn test_key_filter() {
        let bus = CrossTabEventBus::default();
        let mut listener = bus.listen(A, STORAGE_EVENT_NAME, Some("identity"));

        bus.dispatch(STORAGE_EVENT_NAME, Some("theme"), B);
        assert!(listener.try_next().is_none());

        // A cleared area (no key) concerns every listener
        bus.notify_storage(None, B);
        assert!(listener.try_next().is_some());
    }

    #[test]
    fn test_name_filter() {
        let bus = CrossTabEventBus::default();
        let mut listener = bus.listen(A, STORAGE_EVENT_NAME, None);

        bus.dispatch("session-storage", Some("k"), A);
        assert!(listener.try_next().is_none());
    }

    #[test]
    fn test_both_channels_deliver_to_foreign_tab() {
        let bus = CrossTabEventBus::default();
        let mut other = bus.listen(B, STORAGE_EVENT_NAME, Some("k"));

        bus.dispatch(STORAGE_EVENT_NAME, Some("k"), A);
        bus.notify_storage(Some("k"), A);

        // Redundant delivery is expected
        assert_eq!(other.drain(), 2);
    }

    #[test]
    fn test_lagged_listener_resyncs() {
        let bus = CrossTabEventBus::new(2);
        let mut slow = bus.listen(B, STORAGE_EVENT_NAME, Some("k"));

        for _ in 0..5 {
            bus.dispatch(STORAGE_EVENT_NAME, Some("k"), A);
        }

        let first = slow.try_next().unwrap();
        assert_eq!(first.source, NoticeSource::Resync);
        assert_eq!(first.key.as_deref(), Some("k"));
    }

    #[test]
    fn test_drop_deregisters() {
        let bus = CrossTabEventBus::default();
        let listener = bus.listen(A, STORAGE_EVENT_NAME, None);
        assert_eq!(bus.listener_count(), 1);
        drop(listener);
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.dispatch(STORAGE_EVENT_NAME, None, A), 0);
    }

    #[tokio::test]
    async fn test_async_next() {
        let bus = CrossTabEventBus::default();
        let mut listener = bus.listen(B, STORAGE_EVENT_NAME, Some("k"));

        let sender = bus.clone();
        tokio::spawn(async move {
            sender.notify_storage(Some("k"), A);
        });

        let event = listener.next().await.unwrap();
        assert_eq!(event.origin, A);
    }
}
