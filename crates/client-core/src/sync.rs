use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use client_platform::{ScopedStore, Store};
use serde_json::{Value, json};
use tokio::{
    sync::{Mutex as AsyncMutex, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    account_data::AccountDataStore,
    config::ClientConfig,
    error::{ClientError, ErrorCategory, SyncFailure, TransportError, classify_sync_failure},
    listeners::ListenerId,
    lock,
    retry::RetryPolicy,
    rooms::RoomStore,
    state_machine::{StateTransition, SyncLifecycle, SyncStateListener, SyncStateMachine},
    transport::{SyncRequest, Transport},
    types::{SyncResponse, SyncState},
};

const FILTER_NAMESPACE: &str = "filters";
const SYNC_NAMESPACE: &str = "sync";
/// Slack on top of the server-side wait before a long-poll counts as lost.
const SYNC_REQUEST_GRACE_MS: u64 = 10_000;
const INITIAL_TIMELINE_LIMIT: u64 = 20;

#[derive(Debug)]
struct RunningSyncTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Bootstrap steps already completed; a failed bootstrap resumes from here.
#[derive(Debug, Default)]
struct BootstrapProgress {
    push_rules_loaded: bool,
    filter_id: Option<String>,
}

/// Everything the sync task touches.
struct SyncShared {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    lifecycle: Arc<SyncLifecycle>,
    rooms: Arc<Mutex<RoomStore>>,
    account_data: Arc<AccountDataStore>,
    filters: ScopedStore<Arc<dyn Store>>,
    tokens: ScopedStore<Arc<dyn Store>>,
    push_rules: Mutex<Option<Value>>,
    presence: Mutex<HashMap<String, Value>>,
    pending_retry: Mutex<Option<oneshot::Sender<()>>>,
}

/// Drives the long-poll sync cycle and reports its health as [`SyncState`].
pub struct ConnectionStateMachine {
    shared: Arc<SyncShared>,
    sync_task: AsyncMutex<Option<RunningSyncTask>>,
}

impl ConnectionStateMachine {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        lifecycle: Arc<SyncLifecycle>,
        rooms: Arc<Mutex<RoomStore>>,
        account_data: Arc<AccountDataStore>,
    ) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                config,
                transport,
                lifecycle,
                rooms,
                account_data,
                filters: ScopedStore::new(store.clone(), FILTER_NAMESPACE),
                tokens: ScopedStore::new(store, SYNC_NAMESPACE),
                push_rules: Mutex::new(None),
                presence: Mutex::new(HashMap::new()),
                pending_retry: Mutex::new(None),
            }),
            sync_task: AsyncMutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        self.shared.lifecycle.state()
    }

    /// Register a `(new_state, old_state)` callback.
    pub fn subscribe(&self, listener: Arc<SyncStateListener>) -> ListenerId {
        self.shared.lifecycle.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.lifecycle.unsubscribe(id)
    }

    pub async fn is_running(&self) -> bool {
        self.sync_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Push rules fetched during bootstrap.
    pub fn push_rules(&self) -> Option<Value> {
        lock(&self.shared.push_rules).clone()
    }

    /// Last presence content seen for `user_id`.
    pub fn presence(&self, user_id: &str) -> Option<Value> {
        lock(&self.shared.presence).get(user_id).cloned()
    }

    /// Continuation token persisted after the last successful cycle.
    pub fn sync_token(&self) -> Option<String> {
        self.shared.load_token()
    }

    /// Spawn the sync loop.
    ///
    /// A loop that halted on a fatal error still holds its slot; `stop` must
    /// be called before sync can start again.
    pub async fn start(&self) -> Result<(), ClientError> {
        let mut guard = self.sync_task.lock().await;
        if guard.is_some() && self.shared.lifecycle.is_halted() {
            return Err(ClientError::new(
                ErrorCategory::InvalidState,
                "sync_halted",
                "sync halted on a fatal error; stop it before starting again",
            ));
        }
        if guard.is_some() {
            return Err(ClientError::new(
                ErrorCategory::InvalidState,
                "sync_already_running",
                "sync task is already running",
            ));
        }

        self.shared.lifecycle.mark_started();
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let shared = self.shared.clone();
        let task = tokio::spawn(async move { shared.run(stop_child).await });

        info!(user_id = %self.shared.config.user_id, "sync started");
        *guard = Some(RunningSyncTask { stop, task });
        Ok(())
    }

    /// Stop the loop and move to [`SyncState::Stopped`].
    pub async fn stop(&self) -> Result<(), ClientError> {
        let running = {
            let mut guard = self.sync_task.lock().await;
            guard.take()
        };

        let Some(running) = running else {
            return Err(ClientError::new(
                ErrorCategory::InvalidState,
                "sync_not_running",
                "sync task is not running",
            ));
        };

        running.stop.cancel();
        let _ = running.task.await;

        lock(&self.shared.pending_retry).take();
        self.shared.lifecycle.mark_stopped();
        self.shared.account_data.flush_waiters();
        self.shared.lifecycle.apply(|machine| Ok(machine.on_stop()))?;
        info!("sync stopped");
        Ok(())
    }

    /// Fire a retry that is waiting on its backoff timer right now.
    ///
    /// Returns `false` when no retry is pending.
    pub fn retry_immediately(&self) -> bool {
        match lock(&self.shared.pending_retry).take() {
            Some(fire) => fire.send(()).is_ok(),
            None => false,
        }
    }
}

impl SyncShared {
    async fn run(self: Arc<Self>, stop: CancellationToken) {
        let mut backoff = RetryPolicy::from_config(&self.config).backoff();
        let mut bootstrap = BootstrapProgress::default();
        let mut since = self.load_token();

        loop {
            let cycle = tokio::select! {
                _ = stop.cancelled() => break,
                result = self.cycle(&mut bootstrap, &mut since) => result,
            };

            match cycle {
                Ok(()) => {
                    backoff.reset();
                    self.transition(|machine| machine.on_sync_success());
                }
                Err(err) => match classify_sync_failure(&err) {
                    SyncFailure::Fatal => {
                        error!(code = %err.code, message = %err.message, "sync halted");
                        self.lifecycle.mark_halted();
                        self.account_data.flush_waiters();
                        break;
                    }
                    SyncFailure::Transient => {
                        self.transition(|machine| machine.on_sync_failure());
                        let delay = backoff.next_delay(err.retry_after_ms);
                        warn!(
                            code = %err.code,
                            attempt = backoff.attempt(),
                            ?delay,
                            "sync failed, retrying"
                        );
                        if !self.wait_for_retry(delay, &stop).await {
                            break;
                        }
                    }
                },
            }
        }
    }

    async fn cycle(
        &self,
        bootstrap: &mut BootstrapProgress,
        since: &mut Option<String>,
    ) -> Result<(), ClientError> {
        if !self.config.is_guest {
            self.bootstrap(bootstrap).await?;
        }

        let request = SyncRequest {
            since: since.clone(),
            timeout_ms: self.config.sync_timeout_ms,
            filter_id: bootstrap.filter_id.clone(),
        };
        let bound = Duration::from_millis(
            self.config
                .sync_timeout_ms
                .saturating_add(SYNC_REQUEST_GRACE_MS),
        );
        let response = match tokio::time::timeout(bound, self.transport.sync(request)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout.into()),
        };

        self.apply_sync_response(&response);
        self.save_token(&response.next_batch);
        *since = Some(response.next_batch);
        Ok(())
    }

    async fn bootstrap(&self, progress: &mut BootstrapProgress) -> Result<(), ClientError> {
        if !progress.push_rules_loaded {
            let rules = self.transport.get_push_rules().await?;
            *lock(&self.push_rules) = Some(rules);
            progress.push_rules_loaded = true;
            debug!("push rules loaded");
        }
        if progress.filter_id.is_none() {
            progress.filter_id = Some(self.resolve_filter().await?);
        }
        Ok(())
    }

    /// Cached filter id for this user and purpose, created when the server
    /// does not know it.
    async fn resolve_filter(&self) -> Result<String, ClientError> {
        let user_id = &self.config.user_id;
        let key = format!("{user_id}/{}", self.config.filter_purpose);

        if let Some(cached) = self.filters.get_optional(&key)? {
            match self.transport.get_filter(user_id, &cached).await {
                Ok(_) => return Ok(cached),
                Err(err) if is_unknown_filter(&err) => {
                    debug!(filter_id = %cached, "cached filter unknown to server, recreating");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let filter_id = self
            .transport
            .create_filter(user_id, self.filter_definition())
            .await?;
        self.filters.set(&key, &filter_id)?;
        info!(filter_id = %filter_id, "created sync filter");
        Ok(filter_id)
    }

    fn filter_definition(&self) -> Value {
        json!({
            "room": {
                "timeline": {
                    "limit": INITIAL_TIMELINE_LIMIT,
                    "unread_thread_notifications": self.config.thread_support,
                },
                "state": {"lazy_load_members": true},
            },
        })
    }

    fn apply_sync_response(&self, response: &SyncResponse) {
        {
            let mut rooms = lock(&self.rooms);
            for (room_id, joined) in &response.rooms.join {
                rooms.apply_joined_room(room_id, joined);
            }
        }
        self.account_data
            .apply_sync_events(&response.account_data.events);

        let mut presence = lock(&self.presence);
        for event in &response.presence.events {
            if let Some(sender) = &event.sender {
                presence.insert(sender.clone(), event.content.clone());
            }
        }
    }

    /// Wait out the backoff while probing the keepalive endpoint.
    ///
    /// Returns `false` when the loop was stopped meanwhile.
    async fn wait_for_retry(&self, delay: Duration, stop: &CancellationToken) -> bool {
        let (fire, fired) = oneshot::channel();
        *lock(&self.pending_retry) = Some(fire);

        let proceed = tokio::select! {
            _ = stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
            _ = fired => {
                debug!("retrying sync immediately");
                true
            }
            _ = self.keepalive() => {
                self.transition(|machine| machine.on_keepalive_success());
                true
            }
        };

        lock(&self.pending_retry).take();
        proceed
    }

    /// Probe `/versions` on a fixed cadence until the server answers.
    async fn keepalive(&self) {
        let interval = Duration::from_millis(self.config.keepalive_interval_ms);
        loop {
            tokio::time::sleep(interval).await;
            match self.transport.get_versions().await {
                Ok(_) => return,
                // Any client error still proves the server is reachable.
                Err(err) if err.status().is_some_and(|status| (400..500).contains(&status)) => {
                    return;
                }
                Err(err) => debug!(error = %err, "keepalive probe failed"),
            }
        }
    }

    fn transition<F>(&self, step: F)
    where
        F: FnOnce(&mut SyncStateMachine) -> Result<StateTransition, ClientError>,
    {
        if let Err(err) = self.lifecycle.apply(|machine| step(machine).map(Some)) {
            error!(code = %err.code, message = %err.message, "rejected sync state transition");
        }
    }

    fn token_key(&self) -> String {
        format!("{}/next_batch", self.config.user_id)
    }

    fn load_token(&self) -> Option<String> {
        match self.tokens.get_optional(&self.token_key()) {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, "failed to load sync token, starting from scratch");
                None
            }
        }
    }

    fn save_token(&self, token: &str) {
        if let Err(err) = self.tokens.set(&self.token_key(), token) {
            warn!(error = %err, "failed to persist sync token");
        }
    }
}

fn is_unknown_filter(err: &TransportError) -> bool {
    matches!(err.status(), Some(404))
        || matches!(err.errcode(), Some("M_NOT_FOUND" | "M_INVALID_PARAM"))
}
