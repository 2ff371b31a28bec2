//! Durable, reactive values keyed in a tab group's storage.
//!
//! ```text
//!  set(v) ──► encode ──► Tab::set_item ──► dispatch("local-storage", key)
//!                                                   │
//!  every DurableValue on `key`, any tab ◄───────────┘
//!        └── sync(): re-read key, publish if different
//! ```
//!
//! Every notice is treated as "the key may have changed": the handler
//! re-reads and publishes only when the decoded value differs, so a tab that
//! hears its own write back publishes nothing and never writes again.

use tokio::sync::watch;

use crate::browser::{ExecutionContext, Tab};
use crate::codec::{Codec, JsonCodec};
use crate::events::{Listener, STORAGE_EVENT_NAME};

/// Options applied when a durable value is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Read storage immediately on open. When false the value starts at its
    /// default and a single [`DurableValue::hydrate`] read fills it in.
    pub initialize_with_value: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            initialize_with_value: true,
        }
    }
}

impl StoreOptions {
    /// Start provisional and hydrate later.
    pub fn deferred() -> Self {
        Self {
            initialize_with_value: false,
        }
    }
}

/// What happened to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored and broadcast.
    Persisted,
    /// Storage refused; the in-memory value was still updated.
    Unpersisted,
    /// Not in a browser context; nothing changed.
    Rejected,
}

/// A JSON value persisted under one key, mirrored into a watch channel.
pub struct DurableValue<T, C = JsonCodec> {
    key: String,
    default: T,
    codec: C,
    tab: Option<Tab>,
    listener: Option<Listener>,
    value: watch::Sender<T>,
    hydrated: bool,
}

impl<T, C> DurableValue<T, C>
where
    T: Clone + PartialEq,
    C: Codec<T>,
{
    pub fn open(ctx: &ExecutionContext, key: &str, default: T, options: StoreOptions) -> Self
    where
        C: Default,
    {
        Self::with_codec(ctx, key, default, options, C::default())
    }

    pub fn with_codec(
        ctx: &ExecutionContext,
        key: &str,
        default: T,
        options: StoreOptions,
        codec: C,
    ) -> Self {
        let tab = ctx.tab().cloned();
        let listener = tab.as_ref().map(|t| t.listen(STORAGE_EVENT_NAME, Some(key)));
        let (value, _) = watch::channel(default.clone());
        let mut this = Self {
            key: key.to_string(),
            default,
            codec,
            tab,
            listener,
            value,
            hydrated: false,
        };
        if options.initialize_with_value {
            this.hydrated = true;
            let initial = this.read();
            this.apply(initial);
        }
        this
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current in-memory value.
    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.value.subscribe()
    }

    /// Read and decode the stored value, falling back to the default.
    fn read(&self) -> T {
        let Some(tab) = &self.tab else {
            return self.default.clone();
        };
        match tab.get_item(&self.key) {
            Ok(None) => self.default.clone(),
            Ok(Some(raw)) => match self.codec.decode(&raw) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("Ignoring stored value for `{}`: {e}", self.key);
                    self.default.clone()
                }
            },
            Err(e) => {
                log::warn!("Reading `{}` failed: {e}", self.key);
                self.default.clone()
            }
        }
    }

    fn apply(&self, value: T) -> bool {
        self.value.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Persist `value` and notify every tab.
    pub fn set(&mut self, value: T) -> WriteOutcome {
        let Some(tab) = &self.tab else {
            log::warn!(
                "Tried setting `{}` even though this context has no storage",
                self.key
            );
            return WriteOutcome::Rejected;
        };

        let stored = self
            .codec
            .encode(&value)
            .map_err(|e| e.to_string())
            .and_then(|raw| tab.set_item(&self.key, &raw).map_err(|e| e.to_string()));

        match stored {
            Ok(()) => {
                self.apply(value);
                tab.dispatch(STORAGE_EVENT_NAME, Some(&self.key));
                WriteOutcome::Persisted
            }
            Err(e) => {
                log::warn!("Could not persist `{}`, keeping it in memory: {e}", self.key);
                self.apply(value);
                WriteOutcome::Unpersisted
            }
        }
    }

    /// Persist a value derived from the current one.
    pub fn update<F>(&mut self, f: F) -> WriteOutcome
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.get());
        self.set(next)
    }

    /// Delete the stored value; the in-memory value resets to the default.
    pub fn remove(&mut self) -> T {
        let Some(tab) = &self.tab else {
            log::warn!(
                "Tried removing `{}` even though this context has no storage",
                self.key
            );
            return self.default.clone();
        };
        match tab.remove_item(&self.key) {
            Ok(()) => {
                tab.dispatch(STORAGE_EVENT_NAME, Some(&self.key));
            }
            Err(e) => log::warn!("Could not remove `{}`: {e}", self.key),
        }
        self.apply(self.default.clone());
        self.default.clone()
    }

    /// Handle every queued notice. Returns true if the value changed.
    pub fn sync(&mut self) -> bool {
        let pending = self.listener.as_mut().map(Listener::drain).unwrap_or(0);
        if pending == 0 {
            return false;
        }
        let current = self.read();
        self.apply(current)
    }

    /// Perform the deferred first read. Only the first call reads.
    pub fn hydrate(&mut self) -> bool {
        if self.hydrated || self.tab.is_none() {
            return false;
        }
        self.hydrated = true;
        let current = self.read();
        self.apply(current)
    }

    /// Wait until a notice changes the value. Never resolves without a tab.
    pub async fn changed(&mut self) {
        loop {
            let notice = match self.listener.as_mut() {
                Some(listener) => listener.next().await,
                None => None,
            };
            if notice.is_none() {
                std::future::pending::<()>().await;
            }
            if let Some(listener) = self.listener.as_mut() {
                listener.drain();
            }
            let current = self.read();
            if self.apply(current) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserContext;
    use crate::storage::{FileMedium, MediumSnapshot, MemoryMedium};
    use std::sync::Arc;
    use std::time::Duration;

    fn tab_pair() -> (ExecutionContext, ExecutionContext) {
        let ctx = BrowserContext::in_memory();
        (ctx.open_tab().into(), ctx.open_tab().into())
    }

    #[test]
    fn test_write_then_read() {
        let (a, _) = tab_pair();
        let mut value: DurableValue<Vec<u32>> = DurableValue::open(&a, "k", vec![], StoreOptions::default());
        assert_eq!(value.set(vec![1, 2, 3]), WriteOutcome::Persisted);

        let reopened: DurableValue<Vec<u32>> = DurableValue::open(&a, "k", vec![], StoreOptions::default());
        assert_eq!(reopened.get(), vec![1, 2, 3]);
    }

    #[test]
    fn test_malformed_text_yields_default() {
        let ctx = BrowserContext::in_memory();
        let tab = ctx.open_tab();
        tab.set_item("k", "{broken").unwrap();

        let value: DurableValue<u32> = DurableValue::open(&tab.into(), "k", 7, StoreOptions::default());
        assert_eq!(value.get(), 7);
    }

    #[test]
    fn test_cross_tab_propagation_without_loop() {
        let (a, b) = tab_pair();
        let mut writer: DurableValue<String> = DurableValue::open(&a, "k", String::new(), StoreOptions::default());
        let mut reader: DurableValue<String> = DurableValue::open(&b, "k", String::new(), StoreOptions::default());
        let mut watcher = reader.subscribe();

        writer.set("hello".into());
        assert!(reader.sync());
        assert_eq!(reader.get(), "hello");
        assert!(watcher.has_changed().unwrap());
        watcher.borrow_and_update();

        // The writer hears its own dispatch but the value is unchanged
        assert!(!writer.sync());
        assert!(!reader.sync());
        assert!(!watcher.has_changed().unwrap());
    }

    #[test]
    fn test_server_context_rejects_writes() {
        let mut value: DurableValue<u32> =
            DurableValue::open(&ExecutionContext::Server, "k", 3, StoreOptions::default());
        assert_eq!(value.get(), 3);
        assert_eq!(value.set(9), WriteOutcome::Rejected);
        assert_eq!(value.get(), 3);
        assert_eq!(value.remove(), 3);
        assert!(!value.hydrate());
    }

    #[test]
    fn test_quota_failure_keeps_memory_value() {
        let ctx = BrowserContext::new(Arc::new(MemoryMedium::with_quota(8)));
        let a: ExecutionContext = ctx.open_tab().into();
        let b: ExecutionContext = ctx.open_tab().into();
        let mut writer: DurableValue<String> = DurableValue::open(&a, "k", String::new(), StoreOptions::default());
        let mut reader: DurableValue<String> = DurableValue::open(&b, "k", String::new(), StoreOptions::default());

        let outcome = writer.set("far too long for the quota".into());
        assert_eq!(outcome, WriteOutcome::Unpersisted);
        assert_eq!(writer.get(), "far too long for the quota");

        // Nothing was dispatched
        assert!(!reader.sync());
        assert_eq!(reader.get(), "");
    }

    #[test]
    fn test_deferred_hydration_reads_once() {
        let ctx = BrowserContext::in_memory();
        let tab = ctx.open_tab();
        tab.set_item("k", "5").unwrap();
        let exec: ExecutionContext = tab.into();

        let mut value: DurableValue<u32> = DurableValue::open(&exec, "k", 0, StoreOptions::deferred());
        assert_eq!(value.get(), 0);
        assert!(!value.is_hydrated());

        assert!(value.hydrate());
        assert_eq!(value.get(), 5);
        assert!(!value.hydrate());
    }

    #[test]
    fn test_remove_resets_to_default() {
        let (a, b) = tab_pair();
        let mut writer: DurableValue<u32> = DurableValue::open(&a, "k", 0, StoreOptions::default());
        let mut reader: DurableValue<u32> = DurableValue::open(&b, "k", 0, StoreOptions::default());

        writer.set(4);
        reader.sync();
        assert_eq!(reader.get(), 4);

        assert_eq!(writer.remove(), 0);
        assert!(reader.sync());
        assert_eq!(reader.get(), 0);
    }

    #[test]
    fn test_update_derives_from_current() {
        let (a, _) = tab_pair();
        let mut counter: DurableValue<u32> = DurableValue::open(&a, "n", 1, StoreOptions::default());
        counter.update(|n| n + 1);
        counter.update(|n| n * 10);
        assert_eq!(counter.get(), 20);
    }

    #[test]
    fn test_none_roundtrips_through_placeholder() {
        let ctx = BrowserContext::in_memory();
        let tab = ctx.open_tab();
        let exec: ExecutionContext = tab.clone().into();
        let mut value: DurableValue<Option<u32>> = DurableValue::open(&exec, "k", Some(1), StoreOptions::default());

        value.set(None);
        assert_eq!(tab.get_item("k").unwrap().as_deref(), Some("undefined"));
        let reopened: DurableValue<Option<u32>> = DurableValue::open(&exec, "k", Some(1), StoreOptions::default());
        assert_eq!(reopened.get(), None);
    }

    #[tokio::test]
    async fn test_changed_wakes_on_foreign_write() {
        let (a, b) = tab_pair();
        let mut writer: DurableValue<u32> = DurableValue::open(&a, "k", 0, StoreOptions::default());
        let mut reader: DurableValue<u32> = DurableValue::open(&b, "k", 0, StoreOptions::default());

        writer.set(42);
        tokio::time::timeout(Duration::from_secs(1), reader.changed())
            .await
            .unwrap();
        assert_eq!(reader.get(), 42);
    }

    #[test]
    fn test_separate_processes_over_one_directory() {
        let dir = tempfile::tempdir().unwrap();
        let first = BrowserContext::new(Arc::new(FileMedium::open(dir.path()).unwrap()));
        let second = BrowserContext::new(Arc::new(FileMedium::open(dir.path()).unwrap()));
        let mut snapshot = MediumSnapshot::capture(second.medium().as_ref()).unwrap();

        let mut writer: DurableValue<u32> =
            DurableValue::open(&first.open_tab().into(), "k", 0, StoreOptions::default());
        let mut reader: DurableValue<u32> =
            DurableValue::open(&second.open_tab().into(), "k", 0, StoreOptions::default());

        writer.set(7);
        assert!(!reader.sync());

        second.poll_external(&mut snapshot).unwrap();
        assert!(reader.sync());
        assert_eq!(reader.get(), 7);
    }
}
