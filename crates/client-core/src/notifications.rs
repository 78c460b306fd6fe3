use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::ClientError,
    timeline::TimelineBuffer,
    transport::{NotificationsRequest, Transport},
    types::Notification,
};

const SERVER_PAGINATION_LIMIT_CAP: u16 = 100;

#[derive(Debug, Default)]
struct Cursor {
    from: Option<String>,
    exhausted: bool,
    items: Vec<Notification>,
}

/// Backward-only view of the `/notifications` feed.
pub struct NotificationTimeline {
    transport: Arc<dyn Transport>,
    only: Option<String>,
    cursor: Mutex<Cursor>,
}

impl NotificationTimeline {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            only: None,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Restrict the feed, e.g. to `"highlight"` notifications.
    pub fn only(mut self, filter: impl Into<String>) -> Self {
        self.only = Some(filter.into());
        self
    }

    /// Fetch the next older page and return it.
    ///
    /// Once the server stopped returning a continuation token, further calls
    /// return an empty page without a request.
    pub async fn paginate_back(&self, limit: u16) -> Result<Vec<Notification>, ClientError> {
        let mut cursor = self.cursor.lock().await;
        if cursor.exhausted {
            return Ok(Vec::new());
        }

        let limit = TimelineBuffer::bounded_paginate_limit(limit, SERVER_PAGINATION_LIMIT_CAP);
        let response = self
            .transport
            .get_notifications(NotificationsRequest {
                from: cursor.from.clone(),
                limit,
                only: self.only.clone(),
            })
            .await?;

        debug!(
            count = response.notifications.len(),
            has_more = response.next_token.is_some(),
            "fetched notifications page"
        );
        cursor.exhausted = response.next_token.is_none();
        cursor.from = response.next_token;
        cursor.items.extend(response.notifications.iter().cloned());
        Ok(response.notifications)
    }

    /// Every notification fetched so far, newest first.
    pub async fn items(&self) -> Vec<Notification> {
        self.cursor.lock().await.items.clone()
    }

    pub async fn has_more(&self) -> bool {
        !self.cursor.lock().await.exhausted
    }
}
