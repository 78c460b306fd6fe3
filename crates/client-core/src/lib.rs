//! Sync and event-lifecycle core of a federated messaging client.
//!
//! This crate owns the connection state machine that drives the long-poll
//! sync loop, the outgoing event pipeline with local echoes, the pure
//! timeline assembly helpers and reconciled account data. Network access and
//! end-to-end encryption are injected through the traits in [`transport`].

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Reconciled global account data.
pub mod account_data;
/// Thread partitioning and room-upgrade chains.
pub mod assembler;
/// Homeserver feature negotiation.
pub mod capabilities;
/// Facade wiring every component of one client instance.
pub mod client;
/// Runtime configuration and environment loader.
pub mod config;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Observer registry shared by state listeners.
pub mod listeners;
/// Local echo update helpers.
pub mod normalization;
/// Paginated notification feed.
pub mod notifications;
/// Backoff policy used by the sync retry loop.
pub mod retry;
/// Local room model and sync ingestion.
pub mod rooms;
/// Outgoing event pipeline.
pub mod send;
/// Sync connection state machine.
pub mod state_machine;
/// Long-poll sync loop and its bootstrap.
pub mod sync;
/// Timeline merge buffer utilities.
pub mod timeline;
/// Capabilities injected by the host: HTTP transport and encryption.
pub mod transport;
/// Transaction id generation.
pub mod txn;
/// Wire and domain types.
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use account_data::{AccountDataStore, AccountDataWrite};
pub use assembler::{Placement, RoomGraph, partition_threaded_events};
pub use capabilities::{CapabilityCache, Feature, ServerSupport, ServerVersions};
pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use error::{
    ClientError, ErrorCategory, SyncFailure, TransportError, classify_http_status,
    classify_sync_failure,
};
pub use listeners::ListenerId;
pub use normalization::{LocalEchoUpdate, normalize_local_echo};
pub use notifications::NotificationTimeline;
pub use retry::{Backoff, RetryPolicy};
pub use rooms::{Room, RoomStore};
pub use send::EventSendPipeline;
pub use state_machine::{StateTransition, SyncLifecycle, SyncStateListener, SyncStateMachine};
pub use sync::ConnectionStateMachine;
pub use timeline::{TimelineBuffer, TimelineItem, TimelineKey, TimelineMergeError, TimelineOp};
pub use transport::{EncryptedContent, EncryptionBackend, Transport};
pub use txn::TxnIdGenerator;
pub use types::{
    BasicEvent, DelayMode, DelayedEvent, DelayedEventAction, DelayedEventsPage, JoinedRoom,
    Notification, PendingEvent, PendingStatus, RoomEvent, ScheduledDelayedEvent, SyncResponse,
    SyncState,
};

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
