use thiserror::Error;

use crate::types::{PendingStatus, RoomEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    #[error("timeline item {0:?} was not found")]
    MissingItem(TimelineKey),
}

/// How an operation addresses an existing item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineKey {
    /// Server event id.
    Event(String),
    /// Transaction id of a local echo.
    Txn(String),
}

/// One timeline position.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineItem {
    pub event: RoomEvent,
    /// Transaction id when the item started life as a local echo.
    pub txn_id: Option<String>,
    /// Send status mirrored from the pending event; `None` once the server copy arrived.
    pub local_status: Option<PendingStatus>,
}

impl TimelineItem {
    pub fn remote(event: RoomEvent) -> Self {
        Self {
            event,
            txn_id: None,
            local_status: None,
        }
    }

    pub fn local_echo(event: RoomEvent, txn_id: impl Into<String>) -> Self {
        Self {
            event,
            txn_id: Some(txn_id.into()),
            local_status: Some(PendingStatus::Queued),
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event.event_id.as_deref()
    }

    /// Whether the item still carries pending-send markers.
    pub fn is_pending(&self) -> bool {
        self.local_status.is_some_and(PendingStatus::is_in_flight)
    }

    fn matches(&self, key: &TimelineKey) -> bool {
        match key {
            TimelineKey::Event(event_id) => self.event_id() == Some(event_id.as_str()),
            TimelineKey::Txn(txn_id) => self.txn_id.as_deref() == Some(txn_id.as_str()),
        }
    }
}

/// Edit applied to a [`TimelineBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineOp {
    /// Newest position.
    Append(TimelineItem),
    /// Oldest position, for back-pagination.
    Prepend(TimelineItem),
    Replace { key: TimelineKey, item: TimelineItem },
    Remove { key: TimelineKey },
    /// Drop everything, e.g. after a gapped (`limited`) sync batch.
    Clear,
}

/// Ordered items of one room or thread, keeping at most `max_items` of the
/// newest.
#[derive(Debug, Clone)]
pub struct TimelineBuffer {
    items: Vec<TimelineItem>,
    max_items: usize,
}

impl TimelineBuffer {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: Vec::new(),
            max_items: max_items.max(1),
        }
    }

    /// Oldest first.
    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &TimelineKey) -> bool {
        self.position(key).is_some()
    }

    pub fn find(&self, key: &TimelineKey) -> Option<&TimelineItem> {
        self.position(key).map(|idx| &self.items[idx])
    }

    pub(crate) fn find_mut(&mut self, key: &TimelineKey) -> Option<&mut TimelineItem> {
        let idx = self.position(key)?;
        self.items.get_mut(idx)
    }

    /// Apply `ops` in order, stopping at the first one that addresses a
    /// missing item. Earlier operations stay applied.
    pub fn apply_ops(&mut self, ops: &[TimelineOp]) -> Result<(), TimelineMergeError> {
        for op in ops {
            match op {
                TimelineOp::Append(item) => self.items.push(item.clone()),
                TimelineOp::Prepend(item) => self.items.insert(0, item.clone()),
                TimelineOp::Replace { key, item } => {
                    let idx = self.require(key)?;
                    self.items[idx] = item.clone();
                }
                TimelineOp::Remove { key } => {
                    let idx = self.require(key)?;
                    self.items.remove(idx);
                }
                TimelineOp::Clear => self.items.clear(),
            }
            self.evict_oldest();
        }
        Ok(())
    }

    /// Page size actually requested from a server that serves at most
    /// `server_cap` items, never outside `1..=100`.
    pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
        requested.clamp(1, server_cap.clamp(1, 100))
    }

    fn position(&self, key: &TimelineKey) -> Option<usize> {
        self.items.iter().position(|item| item.matches(key))
    }

    fn require(&self, key: &TimelineKey) -> Result<usize, TimelineMergeError> {
        self.position(key)
            .ok_or_else(|| TimelineMergeError::MissingItem(key.clone()))
    }

    fn evict_oldest(&mut self) {
        let excess = self.items.len().saturating_sub(self.max_items);
        if excess > 0 {
            self.items.drain(..excess);
        }
    }
}
