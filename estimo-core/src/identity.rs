//! Durable participant identity.
//!
//! One identity per tab group, stored as `{"id"?, "username"?}` under
//! [`IDENTITY_KEY`]. It starts empty and is filled in lazily, normally by
//! the presence reconciler seeding it from the first network presence.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::browser::ExecutionContext;
use crate::durable::{DurableValue, StoreOptions, WriteOutcome};

/// Storage key holding the identity.
pub const IDENTITY_KEY: &str = "estimo:identity";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            username: Some(username.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.username.is_none()
    }

    /// Overlay the fields present in `other`.
    pub fn merged(&self, other: &Identity) -> Identity {
        Identity {
            id: other.id.clone().or_else(|| self.id.clone()),
            username: other.username.clone().or_else(|| self.username.clone()),
        }
    }
}

/// Reactive identity shared by all tabs of a browser context.
pub struct IdentityStore {
    value: DurableValue<Identity>,
}

impl IdentityStore {
    pub fn open(ctx: &ExecutionContext) -> Self {
        Self::with_options(ctx, StoreOptions::default())
    }

    pub fn with_options(ctx: &ExecutionContext, options: StoreOptions) -> Self {
        Self {
            value: DurableValue::open(ctx, IDENTITY_KEY, Identity::default(), options),
        }
    }

    pub fn identity(&self) -> Identity {
        self.value.get()
    }

    pub fn set(&mut self, identity: Identity) -> WriteOutcome {
        log::debug!("Persisting identity {identity:?}");
        self.value.set(identity)
    }

    pub fn update<F>(&mut self, f: F) -> WriteOutcome
    where
        F: FnOnce(&Identity) -> Identity,
    {
        self.value.update(f)
    }

    /// Forget the identity entirely.
    pub fn remove(&mut self) -> Identity {
        log::info!("Removing stored identity");
        self.value.remove()
    }

    pub fn subscribe(&self) -> watch::Receiver<Identity> {
        self.value.subscribe()
    }

    pub fn sync(&mut self) -> bool {
        self.value.sync()
    }

    pub fn hydrate(&mut self) -> bool {
        self.value.hydrate()
    }

    pub async fn changed(&mut self) {
        self.value.changed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserContext;

    #[test]
    fn test_absent_fields_are_omitted() {
        let json = serde_json::to_string(&Identity::default()).unwrap();
        assert_eq!(json, "{}");

        let json = serde_json::to_string(&Identity {
            id: Some("P1".into()),
            username: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"id":"P1"}"#);
    }

    #[test]
    fn test_merged_overlays_present_fields() {
        let base = Identity::new("P1", "Alice");
        let patch = Identity {
            id: None,
            username: Some("Bob".into()),
        };
        assert_eq!(base.merged(&patch), Identity::new("P1", "Bob"));
    }

    #[test]
    fn test_identity_shared_between_tabs() {
        let ctx = BrowserContext::in_memory();
        let mut a = IdentityStore::open(&ctx.open_tab().into());
        let mut b = IdentityStore::open(&ctx.open_tab().into());
        assert!(b.identity().is_empty());

        a.set(Identity::new("P1", "Alice"));
        assert!(b.sync());
        assert_eq!(b.identity(), Identity::new("P1", "Alice"));

        b.remove();
        assert!(a.sync());
        assert!(a.identity().is_empty());
    }

    #[test]
    fn test_stored_layout() {
        let ctx = BrowserContext::in_memory();
        let tab = ctx.open_tab();
        let mut store = IdentityStore::open(&tab.clone().into());
        store.set(Identity::new("P1", "Alice"));

        let raw = tab.get_item(IDENTITY_KEY).unwrap().unwrap();
        assert_eq!(raw, r#"{"id":"P1","username":"Alice"}"#);
    }
}
