//! Browser contexts and tabs.
//!
//! A [`BrowserContext`] is one tab group: a storage medium plus the bus its
//! tabs talk over. Every [`Tab`] opened from it sees the same stored text.
//! Writes through a tab fire the native storage notice to the *other* tabs,
//! and only when the stored text actually changed.
//!
//! Another process sharing the medium (two CLI instances over one profile
//! directory) has its own bus. [`BrowserContext::watch_external`] polls the
//! medium and raises the storage notice from [`TabId::EXTERNAL`] for keys
//! changed behind this process's back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::StorageError;
use crate::events::{CrossTabEventBus, Listener, TabId};
use crate::storage::{MediumSnapshot, MemoryMedium, StorageMedium};

/// One tab group sharing a storage medium.
pub struct BrowserContext {
    medium: Arc<dyn StorageMedium>,
    bus: CrossTabEventBus,
    next_tab: AtomicU64,
}

impl BrowserContext {
    pub fn new(medium: Arc<dyn StorageMedium>) -> Arc<Self> {
        Self::with_bus(medium, CrossTabEventBus::default())
    }

    pub fn with_bus(medium: Arc<dyn StorageMedium>, bus: CrossTabEventBus) -> Arc<Self> {
        Arc::new(Self {
            medium,
            bus,
            next_tab: AtomicU64::new(1),
        })
    }

    /// A context backed by a fresh in-process medium.
    pub fn in_memory() -> Arc<Self> {
        Self::new(Arc::new(MemoryMedium::new()))
    }

    /// Open a new tab in this context.
    pub fn open_tab(&self) -> Tab {
        let id = TabId::new(self.next_tab.fetch_add(1, Ordering::Relaxed));
        log::debug!("Opened tab {}", id.raw());
        Tab {
            id,
            medium: Arc::clone(&self.medium),
            bus: self.bus.clone(),
        }
    }

    pub fn bus(&self) -> &CrossTabEventBus {
        &self.bus
    }

    pub fn medium(&self) -> &Arc<dyn StorageMedium> {
        &self.medium
    }

    /// Notify every tab about keys that changed since `snapshot` was taken.
    /// Returns how many keys changed.
    pub fn poll_external(&self, snapshot: &mut MediumSnapshot) -> Result<usize, StorageError> {
        let changed = snapshot.refresh(self.medium.as_ref())?;
        for key in &changed {
            log::debug!("Key `{key}` changed outside this process");
            self.bus.notify_storage(Some(key), TabId::EXTERNAL);
        }
        Ok(changed.len())
    }

    /// Poll the medium every `period` for changes made by other processes.
    ///
    /// Writes made by this process's own tabs are seen too; they cost the
    /// listeners one extra read and publish nothing.
    pub fn watch_external(self: &Arc<Self>, period: Duration) -> Result<JoinHandle<()>, StorageError> {
        let mut snapshot = MediumSnapshot::capture(self.medium.as_ref())?;
        let ctx = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = ctx.poll_external(&mut snapshot) {
                    log::warn!("Polling storage for outside changes failed: {e}");
                }
            }
        }))
    }
}

impl fmt::Debug for BrowserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserContext")
            .field("tabs_opened", &(self.next_tab.load(Ordering::Relaxed) - 1))
            .field("listeners", &self.bus.listener_count())
            .finish()
    }
}

/// A single tab: storage access plus bus membership.
#[derive(Clone)]
pub struct Tab {
    id: TabId,
    medium: Arc<dyn StorageMedium>,
    bus: CrossTabEventBus,
}

impl Tab {
    pub fn id(&self) -> TabId {
        self.id
    }

    pub fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.medium.get_item(key)
    }

    /// Store text and notify other tabs if it differs from what was there.
    pub fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let previous = self.medium.get_item(key).unwrap_or(None);
        self.medium.set_item(key, value)?;
        if previous.as_deref() != Some(value) {
            self.bus.notify_storage(Some(key), self.id);
        }
        Ok(())
    }

    /// Remove a key and notify other tabs if it was present.
    pub fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let previous = self.medium.get_item(key).unwrap_or(None);
        self.medium.remove_item(key)?;
        if previous.is_some() {
            self.bus.notify_storage(Some(key), self.id);
        }
        Ok(())
    }

    /// Dispatch a custom notification from this tab.
    pub fn dispatch(&self, name: &str, key: Option<&str>) -> usize {
        self.bus.dispatch(name, key, self.id)
    }

    pub fn listen(&self, name: &str, key: Option<&str>) -> Listener {
        self.bus.listen(self.id, name, key)
    }
}

impl fmt::Debug for Tab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tab").field("id", &self.id).finish()
    }
}

/// Where a durable value is running.
#[derive(Debug, Clone)]
pub enum ExecutionContext {
    /// No storage and no bus: reads yield defaults, writes are refused.
    Server,
    Browser(Tab),
}

impl ExecutionContext {
    pub fn tab(&self) -> Option<&Tab> {
        match self {
            ExecutionContext::Server => None,
            ExecutionContext::Browser(tab) => Some(tab),
        }
    }

    pub fn is_browser(&self) -> bool {
        matches!(self, ExecutionContext::Browser(_))
    }
}

impl From<Tab> for ExecutionContext {
    fn from(tab: Tab) -> Self {
        ExecutionContext::Browser(tab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NoticeSource, NATIVE_STORAGE_EVENT};
    use crate::storage::FileMedium;

    #[test]
    fn test_tabs_share_medium() {
        let ctx = BrowserContext::in_memory();
        let a = ctx.open_tab();
        let b = ctx.open_tab();
        assert_ne!(a.id(), b.id());

        a.set_item("k", "1").unwrap();
        assert_eq!(b.get_item("k").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_storage_notice_only_on_change() {
        let ctx = BrowserContext::in_memory();
        let a = ctx.open_tab();
        let b = ctx.open_tab();
        let mut listener = b.listen(NATIVE_STORAGE_EVENT, Some("k"));

        a.set_item("k", "1").unwrap();
        let event = listener.try_next().unwrap();
        assert_eq!(event.source, NoticeSource::Storage);
        assert_eq!(event.origin, a.id());

        // Same text again: no native notice
        a.set_item("k", "1").unwrap();
        assert!(listener.try_next().is_none());

        a.remove_item("k").unwrap();
        assert!(listener.try_next().is_some());
        a.remove_item("k").unwrap();
        assert!(listener.try_next().is_none());
    }

    #[test]
    fn test_writer_tab_gets_no_native_notice() {
        let ctx = BrowserContext::in_memory();
        let a = ctx.open_tab();
        let mut own = a.listen(NATIVE_STORAGE_EVENT, Some("k"));

        a.set_item("k", "1").unwrap();
        assert!(own.try_next().is_none());
    }

    #[test]
    fn test_quota_failure_sends_nothing() {
        let ctx = BrowserContext::new(Arc::new(MemoryMedium::with_quota(4)));
        let a = ctx.open_tab();
        let b = ctx.open_tab();
        let mut listener = b.listen(NATIVE_STORAGE_EVENT, None);

        assert!(matches!(
            a.set_item("key", "too long"),
            Err(StorageError::QuotaExceeded { .. })
        ));
        assert!(listener.try_next().is_none());
    }

    #[test]
    fn test_outside_write_raises_external_notice() {
        let dir = tempfile::tempdir().unwrap();
        let here = BrowserContext::new(Arc::new(FileMedium::open(dir.path()).unwrap()));
        let elsewhere = BrowserContext::new(Arc::new(FileMedium::open(dir.path()).unwrap()));
        let mut snapshot = MediumSnapshot::capture(here.medium().as_ref()).unwrap();
        let mut listener = here.open_tab().listen(NATIVE_STORAGE_EVENT, Some("k"));

        elsewhere.open_tab().set_item("k", "7").unwrap();
        // Separate buses: nothing arrives on its own
        assert!(listener.try_next().is_none());

        assert_eq!(here.poll_external(&mut snapshot).unwrap(), 1);
        let event = listener.try_next().unwrap();
        assert_eq!(event.origin, TabId::EXTERNAL);
        assert_eq!(event.source, NoticeSource::Storage);
        assert_eq!(here.poll_external(&mut snapshot).unwrap(), 0);

        elsewhere.open_tab().remove_item("k").unwrap();
        assert_eq!(here.poll_external(&mut snapshot).unwrap(), 1);
        assert!(listener.try_next().is_some());
    }

    #[tokio::test]
    async fn test_watch_external_polls() {
        let dir = tempfile::tempdir().unwrap();
        let here = BrowserContext::new(Arc::new(FileMedium::open(dir.path()).unwrap()));
        let elsewhere = BrowserContext::new(Arc::new(FileMedium::open(dir.path()).unwrap()));
        let mut listener = here.open_tab().listen(NATIVE_STORAGE_EVENT, Some("k"));
        let watcher = here.watch_external(Duration::from_millis(10)).unwrap();

        elsewhere.open_tab().set_item("k", "1").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), listener.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.origin, TabId::EXTERNAL);
        watcher.abort();
    }

    #[test]
    fn test_execution_context() {
        let ctx = BrowserContext::in_memory();
        let browser: ExecutionContext = ctx.open_tab().into();
        assert!(browser.is_browser());
        assert!(ExecutionContext::Server.tab().is_none());
    }
}
