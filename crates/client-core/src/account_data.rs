use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    capabilities::{CapabilityCache, Feature},
    error::ClientError,
    lock,
    state_machine::SyncLifecycle,
    transport::Transport,
    types::BasicEvent,
};

/// How a write settled.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountDataWrite {
    /// Content equalled the cached value; nothing was sent.
    Unchanged,
    /// Resolved on the HTTP response without waiting for a sync echo.
    Written(Value),
    /// Resolved by a sync payload reporting this content for the type.
    Echoed(Value),
    /// Removed through the atomic delete endpoint.
    Deleted,
}

#[derive(Default)]
struct Entry {
    /// Last content observed through sync.
    synced: Option<Value>,
    /// Written while sync echoes could not be relied on.
    local: Option<Value>,
    waiters: Vec<(u64, oneshot::Sender<Value>)>,
}

impl Entry {
    fn current(&self) -> Option<&Value> {
        self.local.as_ref().or(self.synced.as_ref())
    }
}

/// Global account data of the signed-in user, reconciled with sync.
pub struct AccountDataStore {
    transport: Arc<dyn Transport>,
    user_id: String,
    capabilities: Arc<CapabilityCache>,
    lifecycle: Arc<SyncLifecycle>,
    entries: Mutex<HashMap<String, Entry>>,
    next_waiter: AtomicU64,
}

impl AccountDataStore {
    pub fn new(
        transport: Arc<dyn Transport>,
        user_id: impl Into<String>,
        capabilities: Arc<CapabilityCache>,
        lifecycle: Arc<SyncLifecycle>,
    ) -> Self {
        Self {
            transport,
            user_id: user_id.into(),
            capabilities,
            lifecycle,
            entries: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
        }
    }

    /// Last known content for `event_type`, if any was ever observed.
    pub fn get_account_data(&self, event_type: &str) -> Option<Value> {
        lock(&self.entries)
            .get(event_type)
            .and_then(Entry::current)
            .cloned()
    }

    pub async fn set_account_data(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<AccountDataWrite, ClientError> {
        if !self.lifecycle.has_started() {
            warn!(
                event_type,
                "sync has not started; account data write will not wait for its sync echo"
            );
            return self.write_without_echo(event_type, content).await;
        }

        if lock(&self.entries)
            .get(event_type)
            .and_then(Entry::current)
            .is_some_and(|cached| *cached == content)
        {
            debug!(event_type, "account data unchanged, skipping write");
            return Ok(AccountDataWrite::Unchanged);
        }

        if !self.lifecycle.echo_reliable() {
            return self.write_without_echo(event_type, content).await;
        }

        let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.entries)
            .entry(event_type.to_owned())
            .or_default()
            .waiters
            .push((waiter_id, tx));

        let response = match self
            .transport
            .put_account_data(&self.user_id, event_type, content)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                if let Some(entry) = lock(&self.entries).get_mut(event_type) {
                    entry.waiters.retain(|(id, _)| *id != waiter_id);
                }
                return Err(err.into());
            }
        };

        match rx.await {
            Ok(echo) => Ok(AccountDataWrite::Echoed(echo)),
            // Waiters are dropped when sync stops or halts.
            Err(_) => Ok(AccountDataWrite::Written(response)),
        }
    }

    /// Remove `event_type`, atomically when the server supports it.
    pub async fn delete_account_data(
        &self,
        event_type: &str,
    ) -> Result<AccountDataWrite, ClientError> {
        if !self
            .capabilities
            .support(Feature::AccountDataDeletion)
            .await?
            .is_supported()
        {
            debug!(event_type, "no atomic account data deletion, writing empty content");
            return self.set_account_data(event_type, json!({})).await;
        }

        self.transport
            .delete_account_data(&self.user_id, event_type)
            .await?;
        if let Some(entry) = lock(&self.entries).get_mut(event_type) {
            entry.synced = None;
            entry.local = None;
        }
        Ok(AccountDataWrite::Deleted)
    }

    /// Record account data from a sync payload and release matching writers.
    pub fn apply_sync_events(&self, events: &[BasicEvent]) {
        let mut entries = lock(&self.entries);
        for event in events {
            let entry = entries.entry(event.event_type.clone()).or_default();
            entry.synced = Some(event.content.clone());
            entry.local = None;
            let waiters = std::mem::take(&mut entry.waiters);
            if !waiters.is_empty() {
                debug!(
                    event_type = %event.event_type,
                    waiters = waiters.len(),
                    "account data echo received"
                );
            }
            for (_, tx) in waiters {
                let _ = tx.send(event.content.clone());
            }
        }
    }

    /// Resolve every outstanding writer on its HTTP response.
    pub(crate) fn flush_waiters(&self) {
        for entry in lock(&self.entries).values_mut() {
            entry.waiters.clear();
        }
    }

    async fn write_without_echo(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<AccountDataWrite, ClientError> {
        let response = self
            .transport
            .put_account_data(&self.user_id, event_type, content.clone())
            .await?;
        lock(&self.entries)
            .entry(event_type.to_owned())
            .or_default()
            .local = Some(content);
        Ok(AccountDataWrite::Written(response))
    }
}
